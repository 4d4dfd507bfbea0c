//! Try-phase orchestration for the combined user/article update.

use std::sync::Arc;

use common::{ArticleId, TransactionId, UserId};
use resources::ArticleUpdate;

use crate::article_action::ArticleUpdateAction;
use crate::branches::{ARTICLE_UPDATE, USER_LAST_LOGIN};
use crate::error::{Result, TccError};
use crate::user_action::UserLoginAction;

/// Runs the Try phase of both branches in order.
///
/// A rejected Try surfaces as [`TccError::TryRejected`]; the external
/// coordinator then drives Cancel on every branch, including the one
/// whose Try never ran (null rollback). Confirm and Cancel do not go
/// through here; the coordinator delivers them to the branches directly.
pub struct TccOrchestrator {
    user_action: Arc<UserLoginAction>,
    article_action: Arc<ArticleUpdateAction>,
}

impl TccOrchestrator {
    pub fn new(user_action: Arc<UserLoginAction>, article_action: Arc<ArticleUpdateAction>) -> Self {
        Self {
            user_action,
            article_action,
        }
    }

    /// Starts a combined update: stamp the user's last login time and
    /// apply the article changes, atomically from the caller's view.
    ///
    /// Returns the global transaction id under which Confirm and Cancel
    /// will arrive.
    #[tracing::instrument(skip(self, update), fields(user_id = %user_id, article_id = %article_id))]
    pub async fn update_article_with_login(
        &self,
        user_id: UserId,
        article_id: ArticleId,
        update: ArticleUpdate,
    ) -> Result<TransactionId> {
        let transaction_id = TransactionId::new();
        tracing::info!(transaction_id = %transaction_id, "starting combined update");
        metrics::counter!("tcc_transactions_started_total").increment(1);

        if !self.user_action.try_update_last_login(user_id).await {
            metrics::counter!("tcc_try_rejected_total", "action" => USER_LAST_LOGIN).increment(1);
            return Err(TccError::TryRejected {
                branch: USER_LAST_LOGIN,
            });
        }

        if !self.article_action.try_update_article(article_id, update).await {
            metrics::counter!("tcc_try_rejected_total", "action" => ARTICLE_UPDATE).increment(1);
            return Err(TccError::TryRejected {
                branch: ARTICLE_UPDATE,
            });
        }

        Ok(transaction_id)
    }
}
