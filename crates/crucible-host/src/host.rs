//! The orchestrator: wires resolver, worker, patcher, and loader into a
//! single cooperative control loop.
//!
//! All user-visible state changes happen inside [`ScriptHost::tick`]:
//! scheduled callbacks run first, then queued units resolve into a job,
//! then worker completions and patch results are drained. Background
//! tasks only ever post records onto channels; nothing user-visible is
//! mutated off the control loop.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use indexmap::IndexSet;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crucible_resolve::{
    CompilationJob, DirectoryProvider, JobId, Resolver, UnitRegistry,
};
use crucible_sandbox::{PatchOutcome, Patcher, SandboxError, SecurityPolicy};
use crucible_worker::{
    JobCompletion, JobResult, WorkerConfig, WorkerService, attribute,
    overwrite_missing_dependencies,
};

use crate::module::{CompiledModule, LoadState, ModuleStore};
use crate::traits::{DiagnosticSink, ModuleLoader, Severity, TickScheduler};

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub scripts: PathBuf,
    pub libraries: PathBuf,
    pub includes: PathBuf,
    pub worker: WorkerConfig,
    pub policy: SecurityPolicy,
}

/// What one control tick did, for callers that surface activity.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Jobs submitted to the worker this tick.
    pub submitted: Vec<JobId>,
    /// Units that failed resolution this tick.
    pub resolve_failures: Vec<String>,
    /// Units whose new module went live this tick.
    pub loaded: Vec<String>,
    /// Units that failed compilation, patching, or loading this tick.
    pub failed_units: Vec<String>,
}

/// A compiled module waiting for (or coming back from) the patcher.
struct ReadyModule {
    id: JobId,
    name: String,
    units: Vec<String>,
    raw: Vec<u8>,
}

struct PatchedJob {
    module: ReadyModule,
    outcome: Result<PatchOutcome, SandboxError>,
}

/// Script compilation host.
pub struct ScriptHost {
    registry: Arc<UnitRegistry>,
    resolver: Resolver,
    store: Arc<ModuleStore>,
    loader: Arc<dyn ModuleLoader>,
    sink: Arc<dyn DiagnosticSink>,
    scheduler: Arc<TickScheduler>,
    policy: Arc<SecurityPolicy>,
    worker: Option<WorkerService>,
    completions: Mutex<mpsc::UnboundedReceiver<JobCompletion>>,
    patch_tx: mpsc::UnboundedSender<PatchedJob>,
    patch_rx: Mutex<mpsc::UnboundedReceiver<PatchedJob>>,
    /// Single in-flight patch guard; a second patch waits in the backlog
    /// until the active one's result is drained.
    patch_in_flight: AtomicBool,
    patch_backlog: Mutex<VecDeque<ReadyModule>>,
    /// Jobs that would have gone to the worker, when none is attached.
    unsubmitted: Mutex<Vec<CompilationJob>>,
}

impl ScriptHost {
    /// Creates a host with its own compiler worker.
    pub fn new(
        config: HostConfig,
        loader: Arc<dyn ModuleLoader>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let worker = WorkerService::spawn(config.worker.clone(), completion_tx);
        Self::build(config, loader, sink, completion_rx, Some(worker))
    }

    /// Creates a host that drains completions from an external channel
    /// instead of owning a worker. Jobs accumulate via
    /// [`ScriptHost::take_unsubmitted`].
    pub fn with_completions(
        config: HostConfig,
        loader: Arc<dyn ModuleLoader>,
        sink: Arc<dyn DiagnosticSink>,
        completions: mpsc::UnboundedReceiver<JobCompletion>,
    ) -> Self {
        Self::build(config, loader, sink, completions, None)
    }

    fn build(
        config: HostConfig,
        loader: Arc<dyn ModuleLoader>,
        sink: Arc<dyn DiagnosticSink>,
        completions: mpsc::UnboundedReceiver<JobCompletion>,
        worker: Option<WorkerService>,
    ) -> Self {
        let registry = Arc::new(UnitRegistry::new());
        let store = Arc::new(ModuleStore::new(Arc::clone(&registry)));
        let provider = DirectoryProvider::new(config.scripts, config.libraries, config.includes);
        let resolver = Resolver::new(
            Arc::clone(&registry),
            Arc::new(provider),
            Arc::clone(&store) as Arc<dyn crucible_resolve::ModuleCatalog>,
        );
        let (patch_tx, patch_rx) = mpsc::unbounded_channel();
        Self {
            registry,
            resolver,
            store,
            loader,
            sink,
            scheduler: Arc::new(TickScheduler::new()),
            policy: Arc::new(config.policy),
            worker,
            completions: Mutex::new(completions),
            patch_tx,
            patch_rx: Mutex::new(patch_rx),
            patch_in_flight: AtomicBool::new(false),
            patch_backlog: Mutex::new(VecDeque::new()),
            unsubmitted: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ModuleStore {
        &self.store
    }

    pub fn scheduler(&self) -> &TickScheduler {
        &self.scheduler
    }

    /// Queues a script for (re)compilation on the next tick.
    pub fn request_compile(&self, script_name: &str) {
        self.resolver.enqueue(script_name);
    }

    /// Jobs built while no worker is attached.
    pub fn take_unsubmitted(&self) -> Vec<CompilationJob> {
        std::mem::take(&mut *self.unsubmitted.lock())
    }

    /// Requests worker shutdown; outstanding jobs complete with synthetic
    /// failures on a later tick.
    pub fn shutdown(&self) {
        if let Some(worker) = &self.worker {
            worker.shutdown();
        }
    }

    /// One control tick.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        self.scheduler.run_due();
        self.resolve_queued(&mut report);
        self.drain_completions(&mut report);
        self.drain_patches(&mut report);
        report
    }

    fn resolve_queued(&self, report: &mut TickReport) {
        let build = self.resolver.build();
        for warning in &build.warnings {
            self.sink.report(Severity::Warning, warning);
        }
        for failed in &build.failed {
            self.sink.report(Severity::Error, &failed.message);
            report.resolve_failures.push(failed.unit.clone());
            if failed.retire {
                self.unload(&failed.unit);
            }
        }
        if let Some(job) = build.job {
            report.submitted.push(job.id);
            match &self.worker {
                Some(worker) => {
                    if let Err(err) = worker.submit(job) {
                        self.sink.report(Severity::Error, &err.to_string());
                    }
                }
                None => self.unsubmitted.lock().push(job),
            }
        }
    }

    fn drain_completions(&self, report: &mut TickReport) {
        loop {
            let completion = self.completions.lock().try_recv();
            let Ok(completion) = completion else { break };
            self.on_completion(completion, report);
        }
    }

    fn on_completion(&self, completion: JobCompletion, report: &mut TickReport) {
        match completion.result {
            JobResult::Failed { message } => {
                self.on_job_failed(&completion.units, &message, report);
            }
            JobResult::Module { bytes, diagnostics } => {
                let mut survivors = completion.units.clone();
                if let Some(text) = diagnostics {
                    let implicated = self.fail_diagnosed_units(&completion.units, &text, report);
                    survivors.retain(|unit| !implicated.contains(unit));
                }
                if survivors.is_empty() {
                    return;
                }
                self.start_patch(ReadyModule {
                    id: completion.id,
                    name: format!("scripts_{}", completion.id.0),
                    units: survivors,
                    raw: bytes,
                });
            }
        }
    }

    /// Whole-job failure: units implicated by a diagnostic line get that
    /// line; the rest get the raw failure.
    fn on_job_failed(&self, units: &[String], message: &str, report: &mut TickReport) {
        let implicated = self.fail_diagnosed_units(units, message, report);
        for unit in units {
            if implicated.contains(unit) {
                continue;
            }
            self.fail_unit(unit, message, report);
        }
    }

    /// Attributes a diagnostic blob to units and fails the implicated
    /// ones. Returns the implicated set.
    fn fail_diagnosed_units(
        &self,
        units: &[String],
        blob: &str,
        report: &mut TickReport,
    ) -> IndexSet<String> {
        let mut attributed = attribute(blob, units);
        let registry = Arc::clone(&self.registry);
        let store = Arc::clone(&self.store);
        let in_job: IndexSet<String> = units.iter().cloned().collect();
        overwrite_missing_dependencies(
            &mut attributed.per_unit,
            |unit| {
                registry
                    .get(unit)
                    .map(|handle| handle.lock().requires.clone())
                    .unwrap_or_default()
            },
            |name| in_job.contains(name) || store.state(name) == LoadState::Loaded,
        );
        let mut implicated = IndexSet::new();
        for (unit, message) in &attributed.per_unit {
            self.fail_unit(unit, message, report);
            implicated.insert(unit.clone());
        }
        implicated
    }

    fn fail_unit(&self, unit: &str, message: &str, report: &mut TickReport) {
        if let Some(handle) = self.registry.get(unit) {
            handle.lock().fail(message.to_string());
        }
        self.sink
            .report(Severity::Error, &format!("{unit}: {message}"));
        report.failed_units.push(unit.to_string());
    }

    /// Hands a raw module to the patcher on a blocking task, or queues it
    /// behind the active patch.
    fn start_patch(&self, module: ReadyModule) {
        if self.patch_in_flight.swap(true, Ordering::AcqRel) {
            debug!(id = %module.id, "patch queued behind active patch");
            self.patch_backlog.lock().push_back(module);
            return;
        }
        let policy = Arc::clone(&self.policy);
        let tx = self.patch_tx.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = Patcher::new(&policy, &module.units).patch(&module.raw);
            let _ = tx.send(PatchedJob { module, outcome });
        });
    }

    fn drain_patches(&self, report: &mut TickReport) {
        loop {
            let patched = self.patch_rx.lock().try_recv();
            let Ok(patched) = patched else { break };
            self.patch_in_flight.store(false, Ordering::Release);
            if let Some(next) = self.patch_backlog.lock().pop_front() {
                self.start_patch(next);
            }
            match patched.outcome {
                Ok(outcome) => self.activate(patched.module, outcome, report),
                Err(err) => {
                    // Patch failures are atomic: the whole batch fails and
                    // every unit keeps its previous module.
                    let message = format!("sandbox patch failed: {err}");
                    for unit in &patched.module.units {
                        self.fail_unit(unit, &message, report);
                    }
                }
            }
        }
    }

    /// Loads a patched module and flips the constituent units onto it,
    /// rolling back to the last good module on load failure.
    fn activate(&self, ready: ReadyModule, outcome: PatchOutcome, report: &mut TickReport) {
        for warning in &outcome.warnings {
            self.sink.report(Severity::Warning, warning);
        }
        let mut survivors: Vec<String> = ready.units.clone();
        for unit_error in &outcome.unit_errors {
            self.fail_unit(&unit_error.unit, &unit_error.message, report);
            survivors.retain(|unit| *unit != unit_error.unit);
        }
        // A survivor whose requirement is neither in this module nor
        // already loaded cannot go live.
        let in_module: IndexSet<String> = survivors.iter().cloned().collect();
        let mut unmet: Vec<(String, String)> = Vec::new();
        for unit in &survivors {
            let requires = self
                .registry
                .get(unit)
                .map(|handle| handle.lock().requires.clone())
                .unwrap_or_default();
            if let Some(missing) = requires.iter().find(|req| {
                !in_module.contains(*req) && self.store.state(req) != LoadState::Loaded
            }) {
                unmet.push((unit.clone(), missing.clone()));
            }
        }
        for (unit, missing) in &unmet {
            self.fail_unit(
                unit,
                &format!("{unit} requires missing dependency {missing}"),
                report,
            );
            survivors.retain(|u| u != unit);
        }
        if survivors.is_empty() {
            return;
        }

        let module = Arc::new(CompiledModule {
            name: ready.name.clone(),
            raw_bytes: ready.raw,
            patched_bytes: outcome.bytes,
            units: survivors.clone(),
            compiled_at: SystemTime::now(),
        });
        for unit in &survivors {
            self.store
                .with_slot(unit, |slot| slot.state = LoadState::Loading);
            if let Some(handle) = self.registry.get(unit) {
                handle.lock().is_loading = true;
            }
        }
        match self.loader.load(&module.name, &module.patched_bytes) {
            Ok(instance) => {
                let now = SystemTime::now();
                for unit in &survivors {
                    self.store.with_slot(unit, |slot| {
                        slot.current = Some(Arc::clone(&module));
                        slot.last_good = Some(Arc::clone(&module));
                        slot.state = LoadState::Loaded;
                        slot.instance = Some(instance);
                    });
                    if let Some(handle) = self.registry.get(unit) {
                        let mut unit = handle.lock();
                        unit.is_loading = false;
                        unit.mark_compiled(now);
                    }
                    report.loaded.push(unit.clone());
                }
                debug!(module = %module.name, units = survivors.len(), "module live");
            }
            Err(err) => {
                for unit in &survivors {
                    self.store.with_slot(unit, |slot| {
                        // Keep running on the previous good module.
                        slot.current = slot.last_good.clone();
                        slot.state = if slot.last_good.is_some() {
                            LoadState::Loaded
                        } else {
                            LoadState::Unloaded
                        };
                    });
                    if let Some(handle) = self.registry.get(unit) {
                        handle.lock().is_loading = false;
                    }
                    self.fail_unit(unit, &format!("module load failed: {err}"), report);
                }
            }
        }
    }

    /// Unloads a unit's module and, transitively, its dependents.
    pub fn unload(&self, unit: &str) {
        let mut visited = IndexSet::new();
        let mut worklist = vec![unit.to_string()];
        while let Some(name) = worklist.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            if let Some(instance) = self.store.remove(&name) {
                self.loader.unload(instance);
                self.sink
                    .report(Severity::Info, &format!("unloaded {name}"));
            } else {
                continue;
            }
            for dependent in self.resolver.dependents_of(&name) {
                warn!(unit = %dependent, requires = %name, "unloading dependent");
                worklist.push(dependent);
            }
        }
    }
}
