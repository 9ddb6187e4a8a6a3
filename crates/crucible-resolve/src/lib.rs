//! Dependency resolution and compilation batching for script units.
//!
//! Scans script preambles for directives, maintains the unit registry and
//! the requirer → required dependency graph, and batches simultaneously
//! ready units into compilation jobs. A job never contains a unit with a
//! known unmet dependency: resolution failures retire units from the
//! batch before submission and cascade to their dependents.

pub mod directives;
pub mod error;
pub mod graph;
pub mod job;
pub mod provider;
pub mod registry;
pub mod unit;

pub use directives::Preamble;
pub use error::{ResolveError, Result};
pub use graph::DependencyGraph;
pub use job::{
    BuildReport, CompilationJob, FailedUnit, JobFile, JobId, ModuleCatalog, NoLoadedModules,
    Resolver,
};
pub use provider::{DirectoryProvider, SourceProvider, SourceText};
pub use registry::{UnitHandle, UnitRegistry};
pub use unit::{SCRIPT_EXTENSION, ScriptUnit, normalize_name};
