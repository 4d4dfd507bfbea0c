//! Messaging error types.

use resources::ResourceError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur on the transactional-messaging path.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// The broker refused or lost a message operation.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The producer's local transaction failed; the half message was
    /// rolled back.
    #[error("Local transaction failed: {0}")]
    LocalTransactionFailed(String),

    /// Persistent store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Resource collaborator error.
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for messaging results.
pub type Result<T> = std::result::Result<T, MessagingError>;
