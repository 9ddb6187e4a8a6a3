//! Sandbox errors.

use thiserror::Error;

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// Errors raised while patching a module or generating dispatch code.
///
/// Any of these aborts the whole patch; per-unit diagnostics that do not
/// abort (entry-type constructor errors, pollution warnings) are reported
/// through [`crate::PatchOutcome`] instead.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("module image error: {0}")]
    Image(#[from] crucible_module::ImageError),

    /// A dispatch candidate has a signature the trampoline generator
    /// cannot express. This is an explicit, documented condition (pointer
    /// typed parameters); the host falls back to reflective invocation for
    /// the affected method.
    #[error("cannot generate direct dispatch for {type_name}::{method}: {reason}")]
    DispatchUnsupported {
        type_name: String,
        method: String,
        reason: String,
    },
}
