//! Resolver errors.
//!
//! Every variant renders to the diagnostic text recorded on the failing
//! unit; resolution failures never abort the batch, they retire units
//! from it.

use thiserror::Error;

/// Result type for resolver operations.
pub type Result<T> = std::result::Result<T, ResolveError>;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The unit's backing source file does not exist.
    #[error("couldn't find main source file for {unit}")]
    SourceMissing { unit: String },

    /// The source file exists but contains nothing compilable.
    #[error("source file for {unit} is empty")]
    EmptyScript { unit: String },

    /// The first declared type does not match the unit's file name.
    #[error("script filename {unit} must match the main class {declared}")]
    NameMismatch { unit: String, declared: String },

    /// A required unit could not be resolved.
    #[error("{unit} requires missing dependency {dependency}")]
    MissingDependency { unit: String, dependency: String },

    /// A referenced library is neither installed nor available as an
    /// include file.
    #[error("{unit} references unavailable library {reference}")]
    ReferenceUnavailable { unit: String, reference: String },

    /// The source could not be read after bounded retries.
    #[error("failed to read source for {unit}: {source}")]
    Read {
        unit: String,
        #[source]
        source: std::io::Error,
    },
}
