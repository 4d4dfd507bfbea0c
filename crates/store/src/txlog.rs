//! Transaction log for the transactional-messaging path.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{ArticleId, TransactionId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Visibility status of the paired broker message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Half message sent, no visibility decision yet.
    Preparing,

    /// Message made visible to consumers.
    Committed,

    /// Message discarded, or the consumer reported failure.
    Rollback,
}

/// Status of the producer's local transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalStatus {
    /// Local transaction in flight.
    Preparing,

    /// Local side effect durably applied.
    Committed,

    /// Local transaction rolled back.
    Rollback,
}

/// Outcome of the compensation sweep for one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompensationStatus {
    /// Not compensated (or not yet needed).
    #[default]
    None,

    /// Reverse write applied and recorded.
    Succeeded,

    /// Reverse write failed; the row stays eligible for the next sweep.
    Failed,
}

/// One record per attempted transactional send.
///
/// `local_status = Committed` with `message_status = Rollback` is the
/// compensation trigger condition: the local write took effect but the
/// paired message never reached its consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionLogRecord {
    pub transaction_id: TransactionId,
    pub topic: String,
    pub tag: String,
    pub message_body: serde_json::Value,
    pub business_id: String,
    pub user_id: UserId,
    pub article_id: ArticleId,
    pub message_status: MessageStatus,
    pub local_status: LocalStatus,
    pub retry_count: u32,
    pub max_retry_count: u32,
    pub error_message: Option<String>,
    pub compensation: CompensationStatus,
    pub created_time: DateTime<Utc>,
    pub updated_time: DateTime<Utc>,
}

impl TransactionLogRecord {
    /// Creates a fresh `Preparing`/`Preparing` row for a new send.
    pub fn preparing(
        transaction_id: TransactionId,
        topic: impl Into<String>,
        tag: impl Into<String>,
        message_body: serde_json::Value,
        user_id: UserId,
        article_id: ArticleId,
    ) -> Self {
        let now = Utc::now();
        Self {
            transaction_id,
            topic: topic.into(),
            tag: tag.into(),
            message_body,
            business_id: article_id.to_string(),
            user_id,
            article_id,
            message_status: MessageStatus::Preparing,
            local_status: LocalStatus::Preparing,
            retry_count: 0,
            max_retry_count: 3,
            error_message: None,
            compensation: CompensationStatus::default(),
            created_time: now,
            updated_time: now,
        }
    }

    /// Returns true when this row needs compensation: the local write
    /// committed but the message was rolled back, and no reverse write
    /// has succeeded yet.
    pub fn needs_compensation(&self) -> bool {
        self.local_status == LocalStatus::Committed
            && self.message_status == MessageStatus::Rollback
            && self.compensation != CompensationStatus::Succeeded
    }
}

/// Store for transactional-message log rows.
#[async_trait]
pub trait TransactionLogStore: Send + Sync {
    /// Inserts a new row.
    async fn insert(&self, record: TransactionLogRecord) -> Result<()>;

    /// Returns the row for a transaction, if any.
    async fn get(&self, transaction_id: TransactionId) -> Result<Option<TransactionLogRecord>>;

    /// Updates the message visibility status.
    async fn update_message_status(
        &self,
        transaction_id: TransactionId,
        status: MessageStatus,
    ) -> Result<()>;

    /// Updates the local transaction status.
    async fn update_local_status(
        &self,
        transaction_id: TransactionId,
        status: LocalStatus,
    ) -> Result<()>;

    /// Records an error message on the row.
    async fn set_error(&self, transaction_id: TransactionId, message: &str) -> Result<()>;

    /// Atomically records the compensation outcome.
    ///
    /// Returns `false` without touching the row if a previous sweep
    /// already succeeded; this is the guard that keeps compensation
    /// single-shot.
    async fn mark_compensated(
        &self,
        transaction_id: TransactionId,
        outcome: CompensationStatus,
    ) -> Result<bool>;

    /// Selects rows needing compensation whose last update is older than
    /// the grace period.
    async fn needing_compensation(&self, grace: Duration) -> Result<Vec<TransactionLogRecord>>;

    /// Deletes rows created before the cutoff, regardless of their
    /// compensation state. Returns the number of rows deleted.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Number of rows still needing compensation, for operational
    /// visibility.
    async fn unresolved_count(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TransactionLogRecord {
        TransactionLogRecord::preparing(
            TransactionId::new(),
            "article-update",
            "update",
            serde_json::json!({"title": "t"}),
            UserId::new(1),
            ArticleId::new(5),
        )
    }

    #[test]
    fn preparing_row_defaults() {
        let row = record();
        assert_eq!(row.message_status, MessageStatus::Preparing);
        assert_eq!(row.local_status, LocalStatus::Preparing);
        assert_eq!(row.compensation, CompensationStatus::None);
        assert_eq!(row.business_id, "5");
    }

    #[test]
    fn needs_compensation_trigger_condition() {
        let mut row = record();
        assert!(!row.needs_compensation());

        row.local_status = LocalStatus::Committed;
        row.message_status = MessageStatus::Rollback;
        assert!(row.needs_compensation());

        row.compensation = CompensationStatus::Failed;
        assert!(row.needs_compensation());

        row.compensation = CompensationStatus::Succeeded;
        assert!(!row.needs_compensation());
    }

    #[test]
    fn committed_message_never_compensates() {
        let mut row = record();
        row.local_status = LocalStatus::Committed;
        row.message_status = MessageStatus::Committed;
        assert!(!row.needs_compensation());
    }
}
