//! Cross-branch convergence enforcement.
//!
//! Each branch consults the enforcer before finalizing. The enforcer
//! reads the sibling's persisted state and, when the sibling has failed,
//! drives this branch's bounded retry loop: within budget it asks the
//! external coordinator for redelivery, and once the budget is exhausted
//! it forces the sibling's Cancel so both branches end Rollbacked.

use std::sync::Arc;

use common::TransactionId;
use store::{ActionStateStore, ActionStatus};

use crate::action::ActionContext;
use crate::registry::BranchRegistry;

/// Decision returned by the sibling gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Sibling is healthy; the branch proceeds with its own transition.
    Proceed,

    /// Sibling has failed and this branch still has retry budget: answer
    /// `false` so the coordinator redelivers.
    Retry,

    /// Sibling has failed and the budget is exhausted; the sibling's
    /// Cancel has been forced. Answer `true` so the coordinator stops.
    Converged,
}

/// Enforces that sibling branches converge to the same terminal status.
pub struct CrossBranchEnforcer {
    states: Arc<dyn ActionStateStore>,
    registry: Arc<BranchRegistry>,
}

impl CrossBranchEnforcer {
    pub fn new(states: Arc<dyn ActionStateStore>, registry: Arc<BranchRegistry>) -> Self {
        Self { states, registry }
    }

    /// Checks the sibling's state before this branch confirms.
    ///
    /// A sibling in `Failed` means the global outcome must be rollback:
    /// this branch burns one unit of its own retry budget per attempt and
    /// on exhaustion forces the sibling's Cancel. Storage errors during
    /// the check are logged and treated as `Retry` so the coordinator
    /// redelivers.
    pub async fn sibling_gate(
        &self,
        transaction_id: TransactionId,
        own_action: &str,
        own_key: u64,
        sibling_action: &'static str,
        sibling_key: u64,
    ) -> GateDecision {
        let sibling = match self
            .states
            .adopt(transaction_id, sibling_action, sibling_key)
            .await
        {
            Ok(state) => state,
            Err(error) => {
                tracing::error!(
                    transaction_id = %transaction_id,
                    action = own_action,
                    sibling = sibling_action,
                    %error,
                    "sibling state lookup failed; requesting redelivery"
                );
                return GateDecision::Retry;
            }
        };

        match sibling {
            Some(state) if state.status == ActionStatus::Failed => {
                self.failed_sibling_decision(
                    transaction_id,
                    own_action,
                    own_key,
                    sibling_action,
                    sibling_key,
                )
                .await
            }
            _ => GateDecision::Proceed,
        }
    }

    /// Refuses a Confirm that arrived without a prior Tried record.
    ///
    /// Writes a `Failed` marker for this branch so the sibling's gate can
    /// see it, then immediately forces the sibling's Cancel. Always
    /// returns `false`.
    pub async fn reject_confirm(
        &self,
        transaction_id: TransactionId,
        own_action: &str,
        business_key: u64,
        sibling_action: &'static str,
        sibling_key: u64,
        reason: &str,
        max_retry_count: u32,
    ) -> bool {
        tracing::warn!(
            transaction_id = %transaction_id,
            action = own_action,
            reason,
            "refusing Confirm without a Tried record"
        );
        metrics::counter!("tcc_confirm_refusals_total").increment(1);

        if let Err(error) = self
            .states
            .mark_failed(
                transaction_id,
                own_action,
                business_key,
                reason,
                max_retry_count,
            )
            .await
        {
            tracing::error!(
                transaction_id = %transaction_id,
                action = own_action,
                %error,
                "failed to persist Failed marker"
            );
        }

        let ctx = ActionContext::new(transaction_id, sibling_key, business_key);
        self.registry.force_cancel(sibling_action, &ctx).await;
        false
    }

    /// Handles a Confirm arriving on a record already in `Failed`.
    ///
    /// Same bounded loop as the sibling gate, except exhaustion also
    /// forces this branch's own Cancel so it moves to `Rollbacked`.
    pub async fn handle_own_failed(
        &self,
        transaction_id: TransactionId,
        own_action: &'static str,
        business_key: u64,
        sibling_action: &'static str,
        sibling_key: u64,
    ) -> bool {
        match self
            .bump_retry(transaction_id, own_action)
            .await
        {
            RetryVerdict::WithinBudget => false,
            RetryVerdict::Exhausted => {
                let own_ctx = ActionContext::new(transaction_id, business_key, sibling_key);
                self.registry.force_cancel(own_action, &own_ctx).await;
                let sibling_ctx = ActionContext::new(transaction_id, sibling_key, business_key);
                self.registry.force_cancel(sibling_action, &sibling_ctx).await;
                true
            }
        }
    }

    /// Handles a Confirm arriving on a record already in `Rollbacked`.
    ///
    /// If the Try's business write is still in effect (the resource
    /// version has not moved past the write, so no restore overwrote it),
    /// the rollback raced an in-flight Confirm: flip the record to
    /// `Committed` and succeed. Otherwise the rollback stands and this
    /// Confirm burns retry budget until the coordinator gives up.
    pub async fn handle_rollbacked(
        &self,
        transaction_id: TransactionId,
        own_action: &str,
        write_still_in_effect: bool,
    ) -> bool {
        if write_still_in_effect {
            tracing::warn!(
                transaction_id = %transaction_id,
                action = own_action,
                "Confirm after premature rollback; write still in effect, committing"
            );
            return match self
                .states
                .update_status(
                    transaction_id,
                    own_action,
                    &[ActionStatus::Rollbacked],
                    ActionStatus::Committed,
                )
                .await
            {
                Ok(flipped) => flipped,
                Err(error) => {
                    tracing::error!(
                        transaction_id = %transaction_id,
                        action = own_action,
                        %error,
                        "status flip failed"
                    );
                    false
                }
            };
        }

        // The restore already overwrote the Try's effect; confirming now
        // would resurrect a cancelled write. Stall until the budget runs
        // out, then let the coordinator stop.
        matches!(
            self.bump_retry(transaction_id, own_action).await,
            RetryVerdict::Exhausted
        )
    }

    async fn failed_sibling_decision(
        &self,
        transaction_id: TransactionId,
        own_action: &str,
        own_key: u64,
        sibling_action: &'static str,
        sibling_key: u64,
    ) -> GateDecision {
        tracing::warn!(
            transaction_id = %transaction_id,
            action = own_action,
            sibling = sibling_action,
            "sibling branch failed; global outcome must be rollback"
        );

        match self.bump_retry(transaction_id, own_action).await {
            RetryVerdict::WithinBudget => GateDecision::Retry,
            RetryVerdict::Exhausted => {
                let ctx = ActionContext::new(transaction_id, sibling_key, own_key);
                self.registry.force_cancel(sibling_action, &ctx).await;
                GateDecision::Converged
            }
        }
    }

    async fn bump_retry(&self, transaction_id: TransactionId, action_name: &str) -> RetryVerdict {
        match self.states.increment_retry(transaction_id, action_name).await {
            Ok(Some((retry_count, max_retry_count))) if retry_count > max_retry_count => {
                tracing::warn!(
                    transaction_id = %transaction_id,
                    action = action_name,
                    retry_count,
                    max_retry_count,
                    "retry budget exhausted; forcing rollback convergence"
                );
                metrics::counter!("tcc_retry_budget_exhausted_total").increment(1);
                RetryVerdict::Exhausted
            }
            Ok(Some((retry_count, max_retry_count))) => {
                tracing::info!(
                    transaction_id = %transaction_id,
                    action = action_name,
                    retry_count,
                    max_retry_count,
                    "within retry budget; requesting redelivery"
                );
                RetryVerdict::WithinBudget
            }
            Ok(None) => {
                tracing::error!(
                    transaction_id = %transaction_id,
                    action = action_name,
                    "retry increment found no record; treating budget as exhausted"
                );
                RetryVerdict::Exhausted
            }
            Err(error) => {
                tracing::error!(
                    transaction_id = %transaction_id,
                    action = action_name,
                    %error,
                    "retry increment failed; requesting redelivery"
                );
                RetryVerdict::WithinBudget
            }
        }
    }
}

enum RetryVerdict {
    WithinBudget,
    Exhausted,
}
