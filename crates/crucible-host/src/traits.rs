//! Host collaborator interfaces.
//!
//! The orchestrator never touches the runtime, the clock, or the log
//! directly; everything user-visible goes through these seams so the
//! pipeline is testable with stubs.

use std::time::Duration;

use parking_lot::Mutex;
use std::time::Instant;
use thiserror::Error;

/// Opaque handle to a live module instance inside the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(pub u64);

#[derive(Debug, Error)]
#[error("{0}")]
pub struct LoadError(pub String);

/// Loads finished byte images into the runtime.
pub trait ModuleLoader: Send + Sync {
    /// Instantiates a patched module image. Returns a handle used for a
    /// later unload.
    fn load(&self, module_name: &str, image: &[u8]) -> Result<InstanceHandle, LoadError>;

    fn unload(&self, handle: InstanceHandle);
}

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Accepts leveled diagnostic messages for the user.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, severity: Severity, message: &str);
}

type Callback = Box<dyn FnOnce() + Send>;

/// Defers work onto the control loop.
pub trait Scheduler: Send + Sync {
    /// Runs `callback` on the next control tick.
    fn on_next_tick(&self, callback: Callback);

    /// Runs `callback` on the first tick at least `delay` from now.
    fn after(&self, delay: Duration, callback: Callback);
}

/// Queue-backed scheduler drained once per control tick.
#[derive(Default)]
pub struct TickScheduler {
    queue: Mutex<Vec<(Instant, Callback)>>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every callback that has come due. Called once per tick,
    /// before any other user-visible work.
    pub fn run_due(&self) {
        let now = Instant::now();
        let due: Vec<Callback> = {
            let mut queue = self.queue.lock();
            let mut due = Vec::new();
            let mut index = 0;
            while index < queue.len() {
                if queue[index].0 <= now {
                    due.push(queue.swap_remove(index).1);
                } else {
                    index += 1;
                }
            }
            due
        };
        for callback in due {
            callback();
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl Scheduler for TickScheduler {
    fn on_next_tick(&self, callback: Callback) {
        self.queue.lock().push((Instant::now(), callback));
    }

    fn after(&self, delay: Duration, callback: Callback) {
        self.queue.lock().push((Instant::now() + delay, callback));
    }
}
