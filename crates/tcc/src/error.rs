//! TCC error types.

use resources::ResourceError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur during TCC coordination.
#[derive(Debug, Error)]
pub enum TccError {
    /// A branch's Try returned false; the whole operation must fail and
    /// the external coordinator cancels whichever branch already
    /// succeeded.
    #[error("Try rejected by branch '{branch}'")]
    TryRejected { branch: &'static str },

    /// State store error.
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// Resource collaborator error.
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for TCC results.
pub type Result<T> = std::result::Result<T, TccError>;
