//! Reverse writes for committed-local / rolled-back-message rows.

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::TransactionId;
use resources::UserResource;
use store::{
    CompensationStatus, LocalStatus, OperationLogStore, OperationStatus, TransactionLogRecord,
    TransactionLogStore,
};

use crate::error::{MessagingError, Result};
use crate::producer::UserLoginSnapshot;

/// Reverses the local last-login write for transactions whose message
/// never reached its consumer.
///
/// The reverse write restores the pre-image captured in the Operation
/// Log; when no pre-image exists the last login time is approximated as
/// `now - fallback_window`. A row is compensated at most once: success
/// seals it through the `mark_compensated` guard, failure leaves it for
/// the next sweep.
pub struct CompensationService {
    txlog: Arc<dyn TransactionLogStore>,
    oplog: Arc<dyn OperationLogStore>,
    user: Arc<dyn UserResource>,
    fallback_window: Duration,
}

impl CompensationService {
    pub fn new(
        txlog: Arc<dyn TransactionLogStore>,
        oplog: Arc<dyn OperationLogStore>,
        user: Arc<dyn UserResource>,
    ) -> Self {
        Self {
            txlog,
            oplog,
            user,
            fallback_window: Duration::hours(1),
        }
    }

    /// Overrides the fallback window (default one hour).
    pub fn with_fallback_window(mut self, window: Duration) -> Self {
        self.fallback_window = window;
        self
    }

    /// Compensates one transaction. Returns `Ok(true)` if the reverse
    /// write was applied, `Ok(false)` if the row did not need (or no
    /// longer needs) compensation.
    #[tracing::instrument(skip(self), fields(transaction_id = %transaction_id))]
    pub async fn compensate(&self, transaction_id: TransactionId) -> Result<bool> {
        let Some(row) = self.txlog.get(transaction_id).await? else {
            tracing::debug!(%transaction_id, "no transaction log row; nothing to compensate");
            return Ok(false);
        };
        if !row.needs_compensation() {
            return Ok(false);
        }

        match self.restore_pre_image(&row).await {
            Ok(used_fallback) => {
                // Sealed rows mean a concurrent sweep got here first; the
                // reverse write is idempotent either way.
                let sealed = self
                    .txlog
                    .mark_compensated(transaction_id, CompensationStatus::Succeeded)
                    .await?;
                if !sealed {
                    tracing::debug!(%transaction_id, "row already sealed by an earlier sweep");
                    return Ok(false);
                }
                if let Err(error) = self
                    .txlog
                    .update_local_status(transaction_id, LocalStatus::Rollback)
                    .await
                {
                    tracing::warn!(%transaction_id, %error, "final local status not recorded");
                }
                if let Err(error) = self
                    .oplog
                    .update_status(transaction_id, OperationStatus::Compensated)
                    .await
                {
                    tracing::debug!(%transaction_id, %error, "no operation log row to mark");
                }
                metrics::counter!("messaging_compensations_total").increment(1);
                tracing::info!(%transaction_id, used_fallback, "compensation applied");
                Ok(true)
            }
            Err(error) => {
                let note = error.to_string();
                if let Err(mark_error) = self
                    .txlog
                    .mark_compensated(transaction_id, CompensationStatus::Failed)
                    .await
                {
                    tracing::error!(%transaction_id, %mark_error, "failure outcome not recorded");
                }
                if let Err(log_error) = self.txlog.set_error(transaction_id, &note).await {
                    tracing::debug!(%transaction_id, %log_error, "error note not recorded");
                }
                if let Err(log_error) = self.oplog.set_error(transaction_id, &note).await {
                    tracing::debug!(%transaction_id, %log_error, "no operation log row for note");
                }
                metrics::counter!("messaging_compensation_failures_total").increment(1);
                Err(error)
            }
        }
    }

    /// Restores the user's last login time from the Operation Log
    /// pre-image. Returns whether the fallback approximation was used.
    async fn restore_pre_image(&self, row: &TransactionLogRecord) -> Result<bool> {
        let pre_image = match self.oplog.get(row.transaction_id, row.user_id).await? {
            Some(op) => op.old_data.and_then(|data| {
                serde_json::from_value::<UserLoginSnapshot>(data)
                    .map_err(|error| {
                        tracing::error!(
                            transaction_id = %row.transaction_id,
                            %error,
                            "pre-image deserialization failed"
                        );
                        error
                    })
                    .ok()
            }),
            None => None,
        };

        match pre_image {
            Some(snapshot) => {
                self.user
                    .restore_last_login_time(row.user_id, snapshot.last_login_time)
                    .await?;
                Ok(false)
            }
            None => {
                tracing::warn!(
                    transaction_id = %row.transaction_id,
                    user_id = %row.user_id,
                    "no pre-image; approximating with the fallback window"
                );
                let approximate = Utc::now() - self.fallback_window;
                self.user
                    .restore_last_login_time(row.user_id, Some(approximate))
                    .await?;
                Ok(true)
            }
        }
    }

    /// Number of rows still awaiting compensation.
    pub async fn unresolved_count(&self) -> Result<usize> {
        self.txlog.unresolved_count().await.map_err(MessagingError::from)
    }
}
