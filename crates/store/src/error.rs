//! Store error types.

use common::TransactionId;
use thiserror::Error;

/// Errors that can occur in the state and log stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No action state exists for the given key.
    #[error("Action state not found: transaction {transaction_id}, action '{action_name}'")]
    StateNotFound {
        transaction_id: TransactionId,
        action_name: String,
    },

    /// An action state already exists for the given key.
    #[error("Action state already exists: transaction {transaction_id}, action '{action_name}'")]
    DuplicateState {
        transaction_id: TransactionId,
        action_name: String,
    },

    /// No transaction log row exists for the given transaction.
    #[error("Transaction log row not found: {0}")]
    TransactionLogNotFound(TransactionId),

    /// No operation log row exists for the given transaction.
    #[error("Operation log row not found: {0}")]
    OperationLogNotFound(TransactionId),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;
