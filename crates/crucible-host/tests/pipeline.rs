//! End-to-end control loop behavior with a stub loader and synthetic
//! worker completions.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crucible_host::{
    DiagnosticSink, HostConfig, InstanceHandle, LoadError, LoadState, ModuleLoader, ScriptHost,
    Severity, TickReport,
};
use crucible_module::{
    Instruction, MethodBody, MethodDef, ModuleImage, Opcode, SCRIPT_NAMESPACE, TypeDef,
};
use crucible_resolve::CompilationJob;
use crucible_sandbox::SecurityPolicy;
use crucible_worker::{JobCompletion, JobResult, WorkerConfig};

#[derive(Default)]
struct RecordingLoader {
    next: AtomicU64,
    fail_next: AtomicBool,
    loads: Mutex<Vec<String>>,
    unloads: Mutex<Vec<InstanceHandle>>,
}

impl ModuleLoader for RecordingLoader {
    fn load(&self, module_name: &str, _image: &[u8]) -> Result<InstanceHandle, LoadError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LoadError("runtime refused the image".to_string()));
        }
        self.loads.lock().push(module_name.to_string());
        Ok(InstanceHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn unload(&self, handle: InstanceHandle) {
        self.unloads.lock().push(handle);
    }
}

#[derive(Default)]
struct CollectingSink {
    messages: Mutex<Vec<(Severity, String)>>,
}

impl CollectingSink {
    fn with_severity(&self, severity: Severity) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, severity: Severity, message: &str) {
        self.messages.lock().push((severity, message.to_string()));
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    host: ScriptHost,
    loader: Arc<RecordingLoader>,
    sink: Arc<CollectingSink>,
    completions: mpsc::UnboundedSender<JobCompletion>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["scripts", "libs", "include"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        let loader = Arc::new(RecordingLoader::default());
        let sink = Arc::new(CollectingSink::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let config = HostConfig {
            scripts: dir.path().join("scripts"),
            libraries: dir.path().join("libs"),
            includes: dir.path().join("include"),
            worker: WorkerConfig::new("/nonexistent/compiler"),
            policy: SecurityPolicy::host_default(),
        };
        let host = ScriptHost::with_completions(
            config,
            Arc::clone(&loader) as Arc<dyn ModuleLoader>,
            Arc::clone(&sink) as Arc<dyn DiagnosticSink>,
            rx,
        );
        Self {
            dir,
            host,
            loader,
            sink,
            completions: tx,
        }
    }

    fn write_script(&self, name: &str, text: &str) {
        fs::write(self.dir.path().join(format!("scripts/{name}.cs")), text).unwrap();
    }

    fn remove_script(&self, name: &str) {
        fs::remove_file(self.dir.path().join(format!("scripts/{name}.cs"))).unwrap();
    }

    /// Ticks once and returns the job the build produced.
    fn submit(&self) -> CompilationJob {
        let report = self.host.tick();
        assert_eq!(report.submitted.len(), 1, "expected one job submission");
        let mut jobs = self.host.take_unsubmitted();
        assert_eq!(jobs.len(), 1);
        jobs.remove(0)
    }

    fn complete(&self, job: &CompilationJob, result: JobResult) {
        self.completions
            .send(JobCompletion {
                id: job.id,
                units: job.units.clone(),
                result,
            })
            .unwrap();
    }

    /// Ticks until `done` accepts a report. The patch stage runs on a
    /// blocking task, so results land a tick or two later.
    async fn settle(&self, mut done: impl FnMut(&TickReport) -> bool) -> TickReport {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let report = self.host.tick();
            if done(&report) {
                return report;
            }
            assert!(Instant::now() < deadline, "pipeline did not settle");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn hook_method(name: &str) -> MethodDef {
    MethodDef {
        name: name.to_string(),
        is_static: false,
        is_public: false,
        is_constructor: false,
        is_accessor: false,
        is_generic: false,
        hook_tagged: false,
        native_import: None,
        params: vec![],
        return_type: "System.Void".to_string(),
        body: Some(MethodBody {
            locals: vec![],
            instructions: vec![Instruction::new(Opcode::Return)],
        }),
    }
}

fn entry_type(unit: &str) -> TypeDef {
    let mut ty = TypeDef::new(SCRIPT_NAMESPACE, unit);
    ty.methods.push(hook_method("OnServerSave"));
    ty
}

fn module_bytes(types: Vec<TypeDef>) -> Vec<u8> {
    ModuleImage {
        name: "scripts.mod".to_string(),
        types,
    }
    .to_bytes()
    .unwrap()
}

#[tokio::test]
async fn compiled_module_goes_live() {
    let fx = Fixture::new();
    fx.write_script("Sample", "public class Sample {}");
    fx.host.request_compile("Sample");

    let job = fx.submit();
    assert_eq!(job.units, vec!["Sample"]);
    fx.complete(
        &job,
        JobResult::Module {
            bytes: module_bytes(vec![entry_type("Sample")]),
            diagnostics: None,
        },
    );

    let report = fx.settle(|r| !r.loaded.is_empty()).await;
    assert_eq!(report.loaded, vec!["Sample"]);
    assert_eq!(fx.host.store().state("Sample"), LoadState::Loaded);
    assert_eq!(*fx.loader.loads.lock(), vec![job.name.clone()]);

    let unit = fx.host.registry().get("Sample").unwrap();
    let unit = unit.lock();
    assert!(unit.diagnostic.is_none());
    assert!(unit.compiled_once);
}

#[tokio::test]
async fn failed_reload_rolls_back_to_the_previous_module() {
    let fx = Fixture::new();
    fx.write_script("Sample", "public class Sample {}");
    fx.host.request_compile("Sample");
    let job = fx.submit();
    fx.complete(
        &job,
        JobResult::Module {
            bytes: module_bytes(vec![entry_type("Sample")]),
            diagnostics: None,
        },
    );
    fx.settle(|r| !r.loaded.is_empty()).await;
    let first = fx.host.store().current("Sample").unwrap();

    // Recompile after an edit, but have the runtime reject the new image.
    fx.write_script("Sample", "public class Sample { int n; }");
    fx.host.request_compile("Sample");
    let job = fx.submit();
    fx.complete(
        &job,
        JobResult::Module {
            bytes: module_bytes(vec![entry_type("Sample")]),
            diagnostics: None,
        },
    );
    fx.loader.fail_next.store(true, Ordering::SeqCst);

    let report = fx.settle(|r| !r.failed_units.is_empty()).await;
    assert_eq!(report.failed_units, vec!["Sample"]);
    assert_eq!(fx.host.store().state("Sample"), LoadState::Loaded);
    let current = fx.host.store().current("Sample").unwrap();
    assert!(Arc::ptr_eq(&first, &current));
    assert_eq!(fx.loader.loads.lock().len(), 1);
}

#[tokio::test]
async fn compiler_diagnostics_attribute_to_the_implicated_unit() {
    let fx = Fixture::new();
    fx.write_script("Shop", "public class Shop {}");
    fx.write_script("Economy", "public class Economy {}");
    fx.host.request_compile("Shop");
    fx.host.request_compile("Economy");

    let job = fx.submit();
    assert_eq!(job.units.len(), 2);
    fx.complete(
        &job,
        JobResult::Failed {
            message: "Shop.cs(1,14): error CS1002: ; expected".to_string(),
        },
    );

    let report = fx.settle(|r| !r.failed_units.is_empty()).await;
    assert_eq!(report.failed_units.len(), 2);

    let shop = fx.host.registry().get("Shop").unwrap();
    assert!(shop.lock().diagnostic.as_ref().unwrap().contains("CS1002"));
    // The unimplicated unit fails with the raw blob, not a file line.
    let economy = fx.host.registry().get("Economy").unwrap();
    assert!(economy.lock().diagnostic.is_some());
    assert!(!fx.sink.with_severity(Severity::Error).is_empty());
}

#[tokio::test]
async fn entry_type_error_fails_only_that_unit() {
    let fx = Fixture::new();
    fx.write_script("Shop", "public class Shop {}");
    fx.write_script("Economy", "public class Economy {}");
    fx.host.request_compile("Shop");
    fx.host.request_compile("Economy");
    let job = fx.submit();

    // Shop declares a non-public constructor, which the patcher rejects.
    let mut shop = entry_type("Shop");
    let mut ctor = hook_method(".ctor");
    ctor.is_constructor = true;
    shop.methods.push(ctor);
    fx.complete(
        &job,
        JobResult::Module {
            bytes: module_bytes(vec![shop, entry_type("Economy")]),
            diagnostics: None,
        },
    );

    let report = fx.settle(|r| !r.loaded.is_empty()).await;
    assert_eq!(report.loaded, vec!["Economy"]);
    assert_eq!(report.failed_units, vec!["Shop"]);
    assert_eq!(fx.host.store().state("Economy"), LoadState::Loaded);
    assert_eq!(fx.host.store().state("Shop"), LoadState::Unloaded);

    let shop = fx.host.registry().get("Shop").unwrap();
    assert!(shop.lock().diagnostic.as_ref().unwrap().contains("constructor"));
}

#[tokio::test]
async fn undecodable_module_fails_the_whole_batch() {
    let fx = Fixture::new();
    fx.write_script("Shop", "public class Shop {}");
    fx.write_script("Economy", "public class Economy {}");
    fx.host.request_compile("Shop");
    fx.host.request_compile("Economy");
    let job = fx.submit();

    fx.complete(
        &job,
        JobResult::Module {
            bytes: b"not a module image".to_vec(),
            diagnostics: None,
        },
    );

    let report = fx.settle(|r| !r.failed_units.is_empty()).await;
    assert_eq!(report.failed_units.len(), 2);
    assert!(report.loaded.is_empty());
    assert_eq!(fx.host.store().state("Shop"), LoadState::Unloaded);
    assert_eq!(fx.host.store().state("Economy"), LoadState::Unloaded);
    assert!(fx.loader.loads.lock().is_empty());
}

#[tokio::test]
async fn pollution_warnings_reach_the_sink() {
    let fx = Fixture::new();
    fx.write_script("Sample", "public class Sample {}");
    fx.host.request_compile("Sample");
    let job = fx.submit();

    fx.complete(
        &job,
        JobResult::Module {
            bytes: module_bytes(vec![entry_type("Sample"), entry_type("Stowaway")]),
            diagnostics: None,
        },
    );

    fx.settle(|r| !r.loaded.is_empty()).await;
    let warnings = fx.sink.with_severity(Severity::Warning);
    assert!(
        warnings
            .iter()
            .any(|w| w.contains("namespace pollution") && w.contains("Stowaway"))
    );
}

#[tokio::test]
async fn unloading_a_dependency_unloads_its_dependents() {
    let fx = Fixture::new();
    fx.write_script("Shop", "// Requires: Economy\npublic class Shop {}");
    fx.write_script("Economy", "public class Economy {}");
    fx.host.request_compile("Shop");

    let job = fx.submit();
    assert_eq!(job.units.len(), 2, "requirement joins the batch");
    let types = job.units.iter().map(|u| entry_type(u)).collect();
    fx.complete(
        &job,
        JobResult::Module {
            bytes: module_bytes(types),
            diagnostics: None,
        },
    );
    fx.settle(|r| r.loaded.len() == 2).await;

    fx.host.unload("Economy");
    assert_eq!(fx.host.store().state("Economy"), LoadState::Unloaded);
    assert_eq!(fx.host.store().state("Shop"), LoadState::Unloaded);
    assert_eq!(fx.loader.unloads.lock().len(), 2);
}

#[tokio::test]
async fn resolve_failure_of_a_compiled_unit_retires_its_module() {
    let fx = Fixture::new();
    fx.write_script("Sample", "public class Sample {}");
    fx.host.request_compile("Sample");
    let job = fx.submit();
    fx.complete(
        &job,
        JobResult::Module {
            bytes: module_bytes(vec![entry_type("Sample")]),
            diagnostics: None,
        },
    );
    fx.settle(|r| !r.loaded.is_empty()).await;

    fx.remove_script("Sample");
    fx.host.request_compile("Sample");
    let report = fx.host.tick();
    assert_eq!(report.resolve_failures, vec!["Sample"]);
    assert_eq!(fx.host.store().state("Sample"), LoadState::Unloaded);
    assert_eq!(fx.loader.unloads.lock().len(), 1);
}
