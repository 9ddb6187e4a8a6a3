//! Module image errors.

use thiserror::Error;

/// Result type for module image operations.
pub type Result<T> = std::result::Result<T, ImageError>;

/// Errors raised while encoding or decoding a module byte image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to decode module image: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode module image: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("branch target {target} out of range for body of {len} instructions")]
    BranchOutOfRange { target: usize, len: usize },
}
