//! Transactional producer: half message, local transaction, decision.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::TransactionId;
use resources::UserResource;
use serde::{Deserialize, Serialize};
use store::{
    LocalStatus, MessageStatus, OperationLogRecord, OperationLogStore, OperationStatus,
    TransactionLogRecord, TransactionLogStore,
};

use crate::broker::MessageBroker;
use crate::error::{MessagingError, Result};
use crate::message::{ArticleUpdateMessage, HalfMessage, ARTICLE_UPDATE_TAG, ARTICLE_UPDATE_TOPIC};

/// Answer to the broker's check-back for an undecided half message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTransactionState {
    /// The local transaction durably committed; release the message.
    Committed,

    /// The local transaction rolled back or never durably committed;
    /// discard the message.
    RolledBack,

    /// The log could not be consulted; the broker should ask again.
    Unknown,
}

/// The pre-image captured into the Operation Log before the local write.
///
/// Compensation replays this to reverse the user's last-login update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLoginSnapshot {
    pub last_login_time: Option<DateTime<Utc>>,
}

/// Sends article-update messages transactionally: the message becomes
/// visible if and only if the local last-login write commits.
///
/// The sequence is half message first, then the local transaction, then
/// the visibility decision. A decision lost on the way to the broker is
/// recovered by [`check_local_transaction`](Self::check_local_transaction),
/// which answers purely from the Transaction Log row.
pub struct TransactionalProducer {
    broker: Arc<dyn MessageBroker>,
    txlog: Arc<dyn TransactionLogStore>,
    oplog: Arc<dyn OperationLogStore>,
    user: Arc<dyn UserResource>,
}

impl TransactionalProducer {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        txlog: Arc<dyn TransactionLogStore>,
        oplog: Arc<dyn OperationLogStore>,
        user: Arc<dyn UserResource>,
    ) -> Self {
        Self {
            broker,
            txlog,
            oplog,
            user,
        }
    }

    /// Runs one transactional send end to end.
    #[tracing::instrument(skip(self, message), fields(user_id = %message.user_id, article_id = %message.article_id))]
    pub async fn send_transactional(&self, message: ArticleUpdateMessage) -> Result<TransactionId> {
        let transaction_id = TransactionId::new();
        let body = serde_json::to_value(&message)?;

        self.broker
            .send_half(HalfMessage::article_update(transaction_id, body.clone()))
            .await?;
        tracing::info!(%transaction_id, "half message staged");

        match self.run_local_transaction(transaction_id, &message, body).await {
            Ok(()) => {
                metrics::counter!("messaging_sends_total").increment(1);
                match self.broker.commit(transaction_id).await {
                    Ok(()) => {
                        if let Err(error) = self
                            .txlog
                            .update_message_status(transaction_id, MessageStatus::Committed)
                            .await
                        {
                            tracing::error!(%transaction_id, %error, "message status update failed");
                        }
                    }
                    Err(error) => {
                        // The check-back will re-derive the decision from
                        // the log row.
                        tracing::warn!(%transaction_id, %error, "commit decision lost");
                    }
                }
                Ok(transaction_id)
            }
            Err(error) => {
                metrics::counter!("messaging_local_rollback_total").increment(1);
                tracing::error!(%transaction_id, %error, "local transaction failed; rolling back");
                self.record_local_rollback(transaction_id, &error).await;
                if let Err(broker_error) = self.broker.rollback(transaction_id).await {
                    tracing::warn!(%transaction_id, %broker_error, "rollback decision lost");
                }
                Err(MessagingError::LocalTransactionFailed(error.to_string()))
            }
        }
    }

    /// Broker check-back for an undecided half message, answered purely
    /// from the Transaction Log row. A missing row means the local
    /// transaction never durably committed.
    pub async fn check_local_transaction(&self, transaction_id: TransactionId) -> LocalTransactionState {
        metrics::counter!("messaging_checkback_total").increment(1);
        match self.txlog.get(transaction_id).await {
            Ok(Some(row)) if row.local_status == LocalStatus::Committed => {
                LocalTransactionState::Committed
            }
            Ok(_) => LocalTransactionState::RolledBack,
            Err(error) => {
                tracing::error!(%transaction_id, %error, "check-back log read failed");
                LocalTransactionState::Unknown
            }
        }
    }

    async fn run_local_transaction(
        &self,
        transaction_id: TransactionId,
        message: &ArticleUpdateMessage,
        body: serde_json::Value,
    ) -> Result<()> {
        self.txlog
            .insert(TransactionLogRecord::preparing(
                transaction_id,
                ARTICLE_UPDATE_TOPIC,
                ARTICLE_UPDATE_TAG,
                body,
                message.user_id,
                message.article_id,
            ))
            .await?;

        let user = self
            .user
            .get_user(message.user_id)
            .await?
            .ok_or_else(|| {
                MessagingError::LocalTransactionFailed(format!("user {} not found", message.user_id))
            })?;

        let snapshot = UserLoginSnapshot {
            last_login_time: user.last_login_time,
        };
        let mut record = OperationLogRecord::in_progress(
            transaction_id,
            message.user_id,
            message.article_id,
            message.operation_type.clone(),
        );
        record.old_data = Some(serde_json::to_value(&snapshot)?);
        record.client_ip = message.client_ip.clone();
        record.user_agent = message.user_agent.clone();
        self.oplog.insert(record).await?;

        self.user.update_last_login_time(message.user_id).await?;

        self.oplog
            .update_status(transaction_id, OperationStatus::Success)
            .await?;
        self.txlog
            .update_local_status(transaction_id, LocalStatus::Committed)
            .await?;
        Ok(())
    }

    async fn record_local_rollback(&self, transaction_id: TransactionId, error: &MessagingError) {
        let note = error.to_string();
        if let Err(log_error) = self
            .txlog
            .update_local_status(transaction_id, LocalStatus::Rollback)
            .await
        {
            tracing::debug!(%transaction_id, %log_error, "no transaction log row to mark");
            return;
        }
        if let Err(log_error) = self.txlog.set_error(transaction_id, &note).await {
            tracing::debug!(%transaction_id, %log_error, "error note not recorded");
        }
        if let Err(log_error) = self
            .oplog
            .update_status(transaction_id, OperationStatus::Failed)
            .await
        {
            tracing::debug!(%transaction_id, %log_error, "no operation log row to mark");
            return;
        }
        if let Err(log_error) = self.oplog.set_error(transaction_id, &note).await {
            tracing::debug!(%transaction_id, %log_error, "error note not recorded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use common::{ArticleId, UserId};
    use resources::InMemoryUserResource;
    use store::memory::{InMemoryOperationLogStore, InMemoryTransactionLogStore};

    struct Fixture {
        broker: Arc<InMemoryBroker>,
        txlog: Arc<InMemoryTransactionLogStore>,
        oplog: Arc<InMemoryOperationLogStore>,
        user: Arc<InMemoryUserResource>,
        producer: TransactionalProducer,
    }

    fn fixture() -> Fixture {
        let broker = Arc::new(InMemoryBroker::new());
        let txlog = Arc::new(InMemoryTransactionLogStore::new());
        let oplog = Arc::new(InMemoryOperationLogStore::new());
        let user = Arc::new(InMemoryUserResource::new());
        user.insert_user(UserId::new(1), "alice", None);
        let producer = TransactionalProducer::new(
            broker.clone(),
            txlog.clone(),
            oplog.clone(),
            user.clone(),
        );
        Fixture {
            broker,
            txlog,
            oplog,
            user,
            producer,
        }
    }

    fn message() -> ArticleUpdateMessage {
        let mut message = ArticleUpdateMessage::new(UserId::new(1), ArticleId::new(5));
        message.title = Some("new title".to_string());
        message
    }

    #[tokio::test]
    async fn successful_send_commits_message_and_local_write() {
        let f = fixture();
        let xid = f.producer.send_transactional(message()).await.unwrap();

        assert_eq!(f.broker.visible().len(), 1);
        assert_eq!(f.user.update_count(), 1);

        let row = f.txlog.get(xid).await.unwrap().unwrap();
        assert_eq!(row.local_status, LocalStatus::Committed);
        assert_eq!(row.message_status, MessageStatus::Committed);

        let op = f.oplog.get(xid, UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(op.operation_status, OperationStatus::Success);
        let snapshot: UserLoginSnapshot = serde_json::from_value(op.old_data.unwrap()).unwrap();
        assert!(snapshot.last_login_time.is_none());
    }

    #[tokio::test]
    async fn failed_local_write_rolls_back_the_message() {
        let f = fixture();
        f.user.set_fail_on_update(true);

        let result = f.producer.send_transactional(message()).await;
        assert!(matches!(result, Err(MessagingError::LocalTransactionFailed(_))));
        assert!(f.broker.visible().is_empty());
        assert_eq!(f.broker.discarded().len(), 1);

        let xid = f.broker.discarded()[0];
        let row = f.txlog.get(xid).await.unwrap().unwrap();
        assert_eq!(row.local_status, LocalStatus::Rollback);
        assert!(row.error_message.is_some());
        let op = f.oplog.get(xid, UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(op.operation_status, OperationStatus::Failed);
    }

    #[tokio::test]
    async fn missing_user_fails_before_the_write() {
        let f = fixture();
        let unknown = ArticleUpdateMessage::new(UserId::new(99), ArticleId::new(5));

        let result = f.producer.send_transactional(unknown).await;
        assert!(result.is_err());
        assert!(f.broker.visible().is_empty());
        assert_eq!(f.user.update_count(), 0);
    }

    #[tokio::test]
    async fn refused_half_message_leaves_no_trace() {
        let f = fixture();
        f.broker.set_fail_on_send(true);

        let result = f.producer.send_transactional(message()).await;
        assert!(matches!(result, Err(MessagingError::Broker(_))));
        assert_eq!(f.txlog.row_count().await, 0);
        assert_eq!(f.user.update_count(), 0);
    }

    #[tokio::test]
    async fn check_back_answers_from_the_log_row() {
        let f = fixture();
        f.broker.set_drop_decisions(true);
        let xid = f.producer.send_transactional(message()).await.unwrap();

        // The commit decision was lost; the half message is still pending
        // and the check-back recovers the outcome.
        assert_eq!(f.broker.pending().len(), 1);
        assert_eq!(
            f.producer.check_local_transaction(xid).await,
            LocalTransactionState::Committed
        );

        // An unknown transaction id means the local side never committed.
        assert_eq!(
            f.producer.check_local_transaction(TransactionId::new()).await,
            LocalTransactionState::RolledBack
        );
    }
}
