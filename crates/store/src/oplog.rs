//! Operation log holding pre-image/post-image audit rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ArticleId, TransactionId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Status of one audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Operation started, outcome pending.
    InProgress,

    /// Operation completed.
    Success,

    /// Operation failed.
    Failed,

    /// Operation reversed by compensation.
    Compensated,
}

/// Audit record keyed by transaction id and user id.
///
/// `old_data` is the source of truth for compensation's reverse write
/// when the transaction log's own pre-image is insufficient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLogRecord {
    pub transaction_id: TransactionId,
    pub user_id: UserId,
    pub article_id: ArticleId,
    pub operation_type: String,
    pub operation_status: OperationStatus,
    pub old_data: Option<serde_json::Value>,
    pub new_data: Option<serde_json::Value>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub error_message: Option<String>,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

impl OperationLogRecord {
    /// Creates an `InProgress` row for a new operation.
    pub fn in_progress(
        transaction_id: TransactionId,
        user_id: UserId,
        article_id: ArticleId,
        operation_type: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            transaction_id,
            user_id,
            article_id,
            operation_type: operation_type.into(),
            operation_status: OperationStatus::InProgress,
            old_data: None,
            new_data: None,
            client_ip: None,
            user_agent: None,
            error_message: None,
            created_time: now,
            updated_time: now,
        }
    }
}

/// Store for operation audit rows.
#[async_trait]
pub trait OperationLogStore: Send + Sync {
    /// Inserts a new row.
    async fn insert(&self, record: OperationLogRecord) -> Result<()>;

    /// Returns the row for a transaction and user, if any.
    async fn get(
        &self,
        transaction_id: TransactionId,
        user_id: UserId,
    ) -> Result<Option<OperationLogRecord>>;

    /// Updates the operation status.
    async fn update_status(
        &self,
        transaction_id: TransactionId,
        status: OperationStatus,
    ) -> Result<()>;

    /// Records an error message on the row.
    async fn set_error(&self, transaction_id: TransactionId, message: &str) -> Result<()>;
}
