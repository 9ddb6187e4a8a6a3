//! Out-of-process compiler worker: wire protocol, process lifecycle, job
//! correlation, and diagnostic recovery.
//!
//! The host never talks to the compiler process directly; it submits
//! [`CompilationJob`](crucible_resolve::CompilationJob)s to a
//! [`WorkerService`] and drains [`JobCompletion`]s from a channel on its
//! control tick.

pub mod diagnostics;
pub mod error;
pub mod protocol;
pub mod service;

pub use diagnostics::{AttributedDiagnostics, attribute, overwrite_missing_dependencies};
pub use error::{Result, WorkerError};
pub use protocol::{AssemblyPayload, CompilePayload, Envelope, MessageBody, WireFile};
pub use service::{JobCompletion, JobResult, WorkerConfig, WorkerService, WorkerState};
