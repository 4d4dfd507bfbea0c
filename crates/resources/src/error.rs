//! Resource error types.

use thiserror::Error;

/// Errors surfaced by resource collaborators.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The addressed resource does not exist.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The resource service rejected or failed the write.
    #[error("Resource write failed: {0}")]
    WriteFailed(String),

    /// The resource service is unreachable.
    #[error("Resource unavailable: {0}")]
    Unavailable(String),
}

/// Convenience type alias for resource results.
pub type Result<T> = std::result::Result<T, ResourceError>;
