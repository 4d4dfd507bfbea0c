//! User branch: last-login-time update.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{TransactionId, UserId};
use resources::UserResource;
use serde::{Deserialize, Serialize};
use store::{ActionState, ActionStateStore, ActionStatus};

use crate::action::{ActionContext, BranchAction};
use crate::branches::{ARTICLE_UPDATE, USER_LAST_LOGIN};
use crate::config::RetryPolicy;
use crate::enforcer::{CrossBranchEnforcer, GateDecision};

/// Pre-image of the user fields this branch touches, persisted as
/// `original_data` at Try time and replayed by Cancel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPreImage {
    pub user_id: UserId,
    pub last_login_time: Option<DateTime<Utc>>,
    pub version: u64,
}

/// TCC branch that sets the user's last login time.
///
/// The write happens in Try; Confirm only flips the persisted state and
/// Cancel restores the pre-image. Try persists its record under a
/// provisional transaction id, so Confirm and Cancel locate it through
/// the adopting lookup.
pub struct UserLoginAction {
    user: Arc<dyn UserResource>,
    states: Arc<dyn ActionStateStore>,
    enforcer: Arc<CrossBranchEnforcer>,
    policy: RetryPolicy,
}

impl UserLoginAction {
    pub fn new(
        user: Arc<dyn UserResource>,
        states: Arc<dyn ActionStateStore>,
        enforcer: Arc<CrossBranchEnforcer>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            user,
            states,
            enforcer,
            policy,
        }
    }

    /// Try phase: capture the pre-image, persist the `Tried` record, then
    /// perform the business write.
    ///
    /// The record is saved before the write so a crash between the two
    /// leaves a cancellable trail; a failed write purges the record so no
    /// stale `Tried` state survives a rejected Try.
    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn try_update_last_login(&self, user_id: UserId) -> bool {
        let user = match self.user.get_user(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::warn!(user_id = %user_id, "Try rejected: user not found");
                return false;
            }
            Err(error) => {
                tracing::error!(user_id = %user_id, %error, "Try rejected: user lookup failed");
                return false;
            }
        };

        let pre_image = UserPreImage {
            user_id,
            last_login_time: user.last_login_time,
            version: user.version,
        };
        let original_data = match serde_json::to_value(&pre_image) {
            Ok(value) => value,
            Err(error) => {
                tracing::error!(user_id = %user_id, %error, "pre-image serialization failed");
                return false;
            }
        };

        let state = ActionState::tried(
            TransactionId::provisional(),
            USER_LAST_LOGIN,
            user_id.value(),
            serde_json::json!({ "new_last_login_time": Utc::now() }),
            Some(original_data),
            self.policy.effective_max(),
        );
        if let Err(error) = self.states.insert(state).await {
            tracing::error!(user_id = %user_id, %error, "Try rejected: state insert failed");
            return false;
        }

        match self.user.update_last_login_time(user_id).await {
            Ok(updated) => {
                tracing::info!(
                    user_id = %user_id,
                    version = updated.version,
                    "last login time updated"
                );
                metrics::counter!("tcc_try_total", "action" => USER_LAST_LOGIN).increment(1);
                true
            }
            Err(error) => {
                tracing::error!(user_id = %user_id, %error, "Try rejected: business write failed");
                // Purge the Tried record so no lookup path can find a
                // branch that never took effect.
                if let Err(purge_error) = self
                    .states
                    .remove_by_business_key(USER_LAST_LOGIN, user_id.value())
                    .await
                {
                    tracing::error!(user_id = %user_id, %purge_error, "Tried record purge failed");
                }
                false
            }
        }
    }

    /// Whether the Try write is still the latest write on the record.
    ///
    /// Try bumped the version to pre-image + 1; any later restore bumps
    /// it further. Used by the premature-rollback check in Confirm.
    async fn write_still_in_effect(&self, state: &ActionState) -> bool {
        let Some(pre_image) = Self::pre_image(state) else {
            return false;
        };
        match self.user.get_user(pre_image.user_id).await {
            Ok(Some(user)) => user.version == pre_image.version + 1,
            Ok(None) => false,
            Err(error) => {
                tracing::error!(
                    user_id = %pre_image.user_id,
                    %error,
                    "version check failed; assuming rollback stands"
                );
                false
            }
        }
    }

    fn pre_image(state: &ActionState) -> Option<UserPreImage> {
        let value = state.original_data.clone()?;
        match serde_json::from_value(value) {
            Ok(pre_image) => Some(pre_image),
            Err(error) => {
                tracing::error!(
                    transaction_id = %state.transaction_id,
                    %error,
                    "pre-image deserialization failed"
                );
                None
            }
        }
    }

    async fn commit(&self, ctx: &ActionContext) -> bool {
        let flipped = match self
            .states
            .update_status(
                ctx.transaction_id,
                USER_LAST_LOGIN,
                &[ActionStatus::Tried],
                ActionStatus::Committed,
            )
            .await
        {
            Ok(flipped) => flipped,
            Err(error) => {
                tracing::error!(transaction_id = %ctx.transaction_id, %error, "commit flip failed");
                return false;
            }
        };

        if flipped {
            metrics::counter!("tcc_confirm_total", "action" => USER_LAST_LOGIN).increment(1);
            return true;
        }

        // A concurrent invocation moved the record first; only its result
        // counts.
        matches!(
            self.states.get(ctx.transaction_id, USER_LAST_LOGIN).await,
            Ok(Some(state)) if state.status == ActionStatus::Committed
        )
    }

    async fn rollback(&self, ctx: &ActionContext, state: &ActionState) -> bool {
        match Self::pre_image(state) {
            Some(pre_image) => {
                if let Err(error) = self
                    .user
                    .restore_last_login_time(pre_image.user_id, pre_image.last_login_time)
                    .await
                {
                    tracing::error!(
                        transaction_id = %ctx.transaction_id,
                        user_id = %pre_image.user_id,
                        %error,
                        "restore failed; requesting redelivery"
                    );
                    return false;
                }
            }
            None => {
                tracing::warn!(
                    transaction_id = %ctx.transaction_id,
                    "no pre-image recorded; skipping the inverse write"
                );
            }
        }

        let flipped = match self
            .states
            .update_status(
                ctx.transaction_id,
                USER_LAST_LOGIN,
                &[
                    ActionStatus::Tried,
                    ActionStatus::Failed,
                    ActionStatus::Committed,
                ],
                ActionStatus::Rollbacked,
            )
            .await
        {
            Ok(flipped) => flipped,
            Err(error) => {
                tracing::error!(transaction_id = %ctx.transaction_id, %error, "rollback flip failed");
                return false;
            }
        };

        if flipped {
            metrics::counter!("tcc_cancel_total", "action" => USER_LAST_LOGIN).increment(1);
            return true;
        }
        matches!(
            self.states.get(ctx.transaction_id, USER_LAST_LOGIN).await,
            Ok(Some(state)) if state.status == ActionStatus::Rollbacked
        )
    }
}

#[async_trait]
impl BranchAction for UserLoginAction {
    fn action_name(&self) -> &'static str {
        USER_LAST_LOGIN
    }

    #[tracing::instrument(skip(self, ctx), fields(transaction_id = %ctx.transaction_id))]
    async fn confirm(&self, ctx: &ActionContext) -> bool {
        let state = match self
            .states
            .adopt(ctx.transaction_id, USER_LAST_LOGIN, ctx.business_key)
            .await
        {
            Ok(state) => state,
            Err(error) => {
                tracing::error!(transaction_id = %ctx.transaction_id, %error, "state lookup failed");
                return false;
            }
        };

        let Some(state) = state else {
            return self
                .enforcer
                .reject_confirm(
                    ctx.transaction_id,
                    USER_LAST_LOGIN,
                    ctx.business_key,
                    ARTICLE_UPDATE,
                    ctx.sibling_key,
                    "Confirm without a Tried record",
                    self.policy.effective_max(),
                )
                .await;
        };

        match state.status {
            ActionStatus::Committed => true,
            ActionStatus::Tried => {
                match self
                    .enforcer
                    .sibling_gate(
                        ctx.transaction_id,
                        USER_LAST_LOGIN,
                        ctx.business_key,
                        ARTICLE_UPDATE,
                        ctx.sibling_key,
                    )
                    .await
                {
                    GateDecision::Proceed => self.commit(ctx).await,
                    GateDecision::Retry => false,
                    // The sibling cannot commit; join it in rollback and
                    // end the coordinator's loop.
                    GateDecision::Converged => self.cancel(ctx).await,
                }
            }
            ActionStatus::Failed => {
                self.enforcer
                    .handle_own_failed(
                        ctx.transaction_id,
                        USER_LAST_LOGIN,
                        ctx.business_key,
                        ARTICLE_UPDATE,
                        ctx.sibling_key,
                    )
                    .await
            }
            ActionStatus::Rollbacked => {
                let in_effect = self.write_still_in_effect(&state).await;
                self.enforcer
                    .handle_rollbacked(ctx.transaction_id, USER_LAST_LOGIN, in_effect)
                    .await
            }
        }
    }

    #[tracing::instrument(skip(self, ctx), fields(transaction_id = %ctx.transaction_id))]
    async fn cancel(&self, ctx: &ActionContext) -> bool {
        let state = match self
            .states
            .adopt(ctx.transaction_id, USER_LAST_LOGIN, ctx.business_key)
            .await
        {
            Ok(state) => state,
            Err(error) => {
                tracing::error!(transaction_id = %ctx.transaction_id, %error, "state lookup failed");
                return false;
            }
        };

        let Some(state) = state else {
            // Null rollback: Try never ran, nothing to reverse.
            tracing::info!(transaction_id = %ctx.transaction_id, "null rollback");
            return true;
        };

        match state.status {
            ActionStatus::Rollbacked => true,
            // A Cancel arriving for a committed branch is the convergence
            // loop dragging it back after its sibling failed; the commit
            // does not shield the write.
            ActionStatus::Committed => {
                tracing::warn!(
                    transaction_id = %ctx.transaction_id,
                    "forced rollback of a committed branch"
                );
                self.rollback(ctx, &state).await
            }
            ActionStatus::Tried | ActionStatus::Failed => self.rollback(ctx, &state).await,
        }
    }
}
