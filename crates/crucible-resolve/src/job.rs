//! Compilation job batching.
//!
//! Units queued between two builds form one batch; a build resolves every
//! queued unit (reading sources, scanning preambles, chasing requirements)
//! and emits at most one [`CompilationJob`]. A unit whose resolution fails
//! is retired from the batch before submission, cascading to its
//! dependents, so a job never carries a unit with a known unmet
//! dependency.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::directives;
use crate::error::ResolveError;
use crate::graph::DependencyGraph;
use crate::provider::{SourceProvider, read_with_retry};
use crate::registry::UnitRegistry;

/// Monotonic job identifier, also the wire correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// One named file embedded in a compile request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// One batch of units submitted to the worker as a single request.
#[derive(Debug, Clone)]
pub struct CompilationJob {
    pub id: JobId,
    /// Output module name.
    pub name: String,
    /// Normalized names of the constituent units.
    pub units: Vec<String>,
    /// Source files: one per unit plus any attached include files.
    pub sources: Vec<JobFile>,
    /// Reference table: external libraries plus already-compiled
    /// dependency modules embedded rather than recompiled.
    pub references: Vec<JobFile>,
}

impl CompilationJob {
    /// True when the job batches more than one unit.
    pub fn is_batch(&self) -> bool {
        self.units.len() > 1
    }
}

/// A unit retired from the batch during resolution.
#[derive(Debug, Clone)]
pub struct FailedUnit {
    pub unit: String,
    /// Rendered diagnostic, also recorded on the unit.
    pub message: String,
    /// The unit had compiled before; the host should unload its module.
    pub retire: bool,
}

/// Outcome of one build pass over the queued units.
#[derive(Debug)]
pub struct BuildReport {
    /// The job to submit, absent when every queued unit failed (or none
    /// were queued).
    pub job: Option<CompilationJob>,
    pub failed: Vec<FailedUnit>,
    pub warnings: Vec<String>,
}

/// Read-only view of modules the host already has loaded, used to embed
/// compiled dependencies as references instead of recompiling them.
pub trait ModuleCatalog: Send + Sync {
    /// Patched byte image of the unit's current loaded module, if it is
    /// usable (loaded and not stale).
    fn loaded_module(&self, unit: &str) -> Option<Vec<u8>>;
}

/// Catalog with no loaded modules; every dependency compiles in-batch.
#[derive(Debug, Default)]
pub struct NoLoadedModules;

impl ModuleCatalog for NoLoadedModules {
    fn loaded_module(&self, _unit: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Libraries every compile request carries implicitly; referencing one
/// explicitly is redundant.
const DEFAULT_REFERENCES: &[&str] = &["mscorlib", "System", "System.Core", "Crucible.Core"];

/// Bound on modified-source rescan passes per build.
const MAX_PASSES: usize = 16;

/// Batches queued units into compilation jobs.
pub struct Resolver {
    registry: Arc<UnitRegistry>,
    provider: Arc<dyn SourceProvider>,
    catalog: Arc<dyn ModuleCatalog>,
    graph: Mutex<DependencyGraph>,
    pending: Mutex<IndexSet<String>>,
    next_id: AtomicU64,
}

impl Resolver {
    pub fn new(
        registry: Arc<UnitRegistry>,
        provider: Arc<dyn SourceProvider>,
        catalog: Arc<dyn ModuleCatalog>,
    ) -> Self {
        Self {
            registry,
            provider,
            catalog,
            graph: Mutex::new(DependencyGraph::new()),
            pending: Mutex::new(IndexSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    /// Units whose last scanned preamble requires `unit`.
    pub fn dependents_of(&self, unit: &str) -> Vec<String> {
        self.graph.lock().dependents_of(unit)
    }

    /// Queues a unit for the next build. Units queued while a batch is
    /// forming join that batch; the queue drains atomically when a build
    /// starts.
    pub fn enqueue(&self, script_name: &str) {
        let handle = self.registry.find_or_create(script_name);
        let name = {
            let mut unit = handle.lock();
            unit.compilation_needed = true;
            unit.name.clone()
        };
        self.pending.lock().insert(name);
    }

    /// Resolves every queued unit and produces at most one job.
    pub fn build(&self) -> BuildReport {
        let mut batch: IndexSet<String> = std::mem::take(&mut *self.pending.lock());
        let mut report = BuildReport {
            job: None,
            failed: Vec::new(),
            warnings: Vec::new(),
        };
        if batch.is_empty() {
            return report;
        }

        // Reference tables keyed by name so a library embedded for two
        // units appears once.
        let mut references: IndexMap<String, Vec<u8>> = IndexMap::new();
        let mut includes: IndexMap<String, Vec<u8>> = IndexMap::new();

        // Resolve until a full pass changes nothing: a unit's source may
        // change (or a new dependency may join) while others are still
        // being resolved.
        for pass in 0.. {
            if pass == MAX_PASSES {
                warn!("dependency resolution did not settle after {MAX_PASSES} passes");
                break;
            }
            let mut changed = false;
            for name in batch.clone() {
                if !batch.contains(&name) {
                    continue;
                }
                changed |= self.resolve_unit(&name, &mut batch, &mut references, &mut report);
            }
            if !changed {
                break;
            }
        }

        // References are collected for every unit in the settled batch,
        // not only rescanned ones: an unmodified unit re-enqueued after a
        // failed load still needs its libraries embedded.
        for name in batch.clone() {
            if !batch.contains(&name) {
                continue;
            }
            let Some(handle) = self.registry.get(&name) else {
                continue;
            };
            let script_name = handle.lock().script_name.clone();
            if let Err(err) = self.resolve_references(
                &name,
                &script_name,
                &handle,
                &mut references,
                &mut includes,
                &mut report,
            ) {
                self.fail_unit(&name, err, &mut batch, &mut report);
            }
        }

        if batch.is_empty() {
            return report;
        }
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut sources = Vec::new();
        for name in &batch {
            if let Some(handle) = self.registry.get(name) {
                let unit = handle.lock();
                sources.push(JobFile {
                    name: unit.file_name(),
                    bytes: unit.lines.join("\n").into_bytes(),
                });
            }
        }
        for (name, bytes) in includes {
            sources.push(JobFile { name, bytes });
        }
        report.job = Some(CompilationJob {
            id,
            name: format!("scripts_{}", id.0),
            units: batch.into_iter().collect(),
            sources,
            references: references
                .into_iter()
                .map(|(name, bytes)| JobFile { name, bytes })
                .collect(),
        });
        report
    }

    /// Resolves one unit in place. Returns true when this call changed
    /// the batch or refreshed a source (forcing another pass).
    fn resolve_unit(
        &self,
        name: &str,
        batch: &mut IndexSet<String>,
        references: &mut IndexMap<String, Vec<u8>>,
        report: &mut BuildReport,
    ) -> bool {
        let Some(handle) = self.registry.get(name) else {
            batch.shift_remove(name);
            return true;
        };

        let (script_name, needs_scan) = {
            let unit = handle.lock();
            let current = self.provider.modified(&unit.script_name);
            (
                unit.script_name.clone(),
                unit.lines.is_empty()
                    || unit.diagnostic.is_some()
                    || unit.is_modified(current),
            )
        };

        let mut changed = false;
        if needs_scan {
            changed = true;
            let source = match read_with_retry(self.provider.as_ref(), &script_name) {
                Ok(Some(source)) => source,
                Ok(None) => {
                    self.fail_unit(
                        name,
                        ResolveError::SourceMissing {
                            unit: script_name.clone(),
                        },
                        batch,
                        report,
                    );
                    return true;
                }
                Err(err) => {
                    self.fail_unit(name, err, batch, report);
                    return true;
                }
            };
            if source.text.trim().is_empty() {
                self.fail_unit(
                    name,
                    ResolveError::EmptyScript {
                        unit: script_name.clone(),
                    },
                    batch,
                    report,
                );
                return true;
            }

            let preamble = {
                let mut unit = handle.lock();
                unit.refresh(&source.text, &source.encoding, source.modified);
                directives::scan(&unit.lines)
            };
            if let Some(declared) = &preamble.class_name
                && *declared != name
            {
                self.fail_unit(
                    name,
                    ResolveError::NameMismatch {
                        unit: script_name.clone(),
                        declared: declared.clone(),
                    },
                    batch,
                    report,
                );
                return true;
            }
            {
                let mut unit = handle.lock();
                unit.requires = preamble.requires.clone();
                unit.references = preamble.references.clone();
            }
            self.graph
                .lock()
                .set_requirements(name, preamble.requires.clone());
        }

        changed |= self.resolve_requirements(name, &handle, batch, references, report);
        changed
    }

    /// Resolves a unit's library references: default libraries warn and
    /// drop, installed libraries embed, include files attach as extra
    /// sources, anything else fails the unit.
    fn resolve_references(
        &self,
        name: &str,
        script_name: &str,
        handle: &crate::registry::UnitHandle,
        references: &mut IndexMap<String, Vec<u8>>,
        includes: &mut IndexMap<String, Vec<u8>>,
        report: &mut BuildReport,
    ) -> Result<(), ResolveError> {
        let wanted = handle.lock().references.clone();
        for library in wanted {
            if DEFAULT_REFERENCES.contains(&library.as_str()) {
                report.warnings.push(format!(
                    "{script_name}: unnecessary reference to default library {library}"
                ));
                continue;
            }
            if let Some(bytes) =
                self.provider
                    .library_bytes(&library)
                    .map_err(|err| ResolveError::Read {
                        unit: script_name.to_string(),
                        source: err,
                    })?
            {
                references.entry(library).or_insert(bytes);
                continue;
            }
            if let Some(path) = self.provider.include_path(&library) {
                let bytes = std::fs::read(&path).map_err(|err| ResolveError::Read {
                    unit: script_name.to_string(),
                    source: err,
                })?;
                let file_name = path
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_else(|| format!("{library}.cs"));
                includes.entry(file_name).or_insert(bytes);
                {
                    let mut unit = handle.lock();
                    if !unit.include_paths.contains(&path) {
                        unit.include_paths.push(path);
                    }
                }
                debug!(unit = name, library, "attached include file for missing library");
                continue;
            }
            return Err(ResolveError::ReferenceUnavailable {
                unit: script_name.to_string(),
                reference: library,
            });
        }
        Ok(())
    }

    /// Resolves a unit's required units: in-batch units stay, loaded
    /// modules embed as references, resolvable sources join the batch,
    /// anything else fails the unit.
    fn resolve_requirements(
        &self,
        name: &str,
        handle: &crate::registry::UnitHandle,
        batch: &mut IndexSet<String>,
        references: &mut IndexMap<String, Vec<u8>>,
        report: &mut BuildReport,
    ) -> bool {
        let requires = handle.lock().requires.clone();
        let mut changed = false;
        for required in requires {
            if batch.contains(&required) {
                continue;
            }
            if report.failed.iter().any(|f| f.unit == required) {
                self.fail_unit(
                    name,
                    ResolveError::MissingDependency {
                        unit: name.to_string(),
                        dependency: required.clone(),
                    },
                    batch,
                    report,
                );
                return true;
            }
            if let Some(bytes) = self.catalog.loaded_module(&required) {
                if references
                    .insert(required.clone(), bytes)
                    .is_none()
                {
                    changed = true;
                }
                continue;
            }
            let dep = self.registry.find_or_create(&required);
            let dep_script = dep.lock().script_name.clone();
            if self.provider.modified(&dep_script).is_some() {
                dep.lock().compilation_needed = true;
                batch.insert(required.clone());
                debug!(unit = name, dependency = %required, "pulled dependency into batch");
                changed = true;
            } else {
                self.fail_unit(
                    name,
                    ResolveError::MissingDependency {
                        unit: name.to_string(),
                        dependency: required.clone(),
                    },
                    batch,
                    report,
                );
                return true;
            }
        }
        changed
    }

    /// Records a failure on a unit, removes it from the batch, and
    /// cascades through its dependents.
    fn fail_unit(
        &self,
        name: &str,
        error: ResolveError,
        batch: &mut IndexSet<String>,
        report: &mut BuildReport,
    ) {
        let message = error.to_string();
        warn!(unit = name, "{message}");
        let mut retire = false;
        if let Some(handle) = self.registry.get(name) {
            let mut unit = handle.lock();
            unit.fail(message.clone());
            retire = unit.compiled_once;
        }
        report.failed.push(FailedUnit {
            unit: name.to_string(),
            message,
            retire,
        });

        let graph = self.graph.lock();
        let removed = graph.cascade_remove(name, batch);
        for dependent in removed {
            let dependency = graph
                .requirements(&dependent)
                .find(|req| !batch.contains(*req))
                .unwrap_or(name)
                .to_string();
            let message = ResolveError::MissingDependency {
                unit: dependent.clone(),
                dependency,
            }
            .to_string();
            let mut retire = false;
            if let Some(handle) = self.registry.get(&dependent) {
                let mut unit = handle.lock();
                unit.fail(message.clone());
                retire = unit.compiled_once;
            }
            report.failed.push(FailedUnit {
                unit: dependent,
                message,
                retire,
            });
        }
    }
}
