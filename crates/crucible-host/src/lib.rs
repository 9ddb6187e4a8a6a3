//! Script host: the control loop tying resolution, out-of-process
//! compilation, sandbox patching, and module loading together.
//!
//! The host is tick-driven. Callers queue scripts with
//! [`ScriptHost::request_compile`] and call [`ScriptHost::tick`] once per
//! frame; everything user-visible (diagnostics, load state changes,
//! scheduled callbacks) happens inside the tick.

pub mod host;
pub mod module;
pub mod traits;

pub use host::{HostConfig, ScriptHost, TickReport};
pub use module::{CompiledModule, LoadState, ModuleSlot, ModuleStore};
pub use traits::{
    DiagnosticSink, InstanceHandle, LoadError, ModuleLoader, Scheduler, Severity, TickScheduler,
};
