//! Cross-branch consistency checking and repair.

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{TransactionId, UserId};
use resources::UserResource;
use store::{ActionState, ActionStateStore, ActionStatus};

use crate::action::ActionContext;
use crate::branches::{ARTICLE_UPDATE, USER_LAST_LOGIN};
use crate::registry::BranchRegistry;

/// Classification of a transaction's branch pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyReport {
    /// Both branches committed.
    ConsistentCommitted,

    /// Both branches rolled back.
    ConsistentRolledBack,

    /// One branch failed or rolled back while the other rolled back; the
    /// convergence loop already did its job.
    ExpectedMixed,

    /// One branch committed while the other rolled back or failed. Needs
    /// repair.
    Inconsistent { committed_branch: &'static str },

    /// At least one branch is still in flight or has no record yet.
    Pending,
}

/// Result of a repair attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The transaction was not inconsistent.
    NotNeeded,

    /// The committed branch was rolled back. `used_fallback` marks the
    /// case where the pre-image was missing and the user's last login
    /// time was pushed back by the rollback window instead.
    Repaired { used_fallback: bool },

    /// Repair could not complete; manual intervention required.
    Failed(String),
}

/// Detects and repairs split-brain outcomes between the two branches.
///
/// Repair drives the committed branch back through its own Cancel (via
/// the registry) so the restore logic is not duplicated here. When the
/// user branch's pre-image is gone, the last login time is restored to
/// `now - rollback_window` as an approximation.
pub struct ConsistencyMonitor {
    states: Arc<dyn ActionStateStore>,
    registry: Arc<BranchRegistry>,
    user: Arc<dyn UserResource>,
    rollback_window: Duration,
}

impl ConsistencyMonitor {
    pub fn new(
        states: Arc<dyn ActionStateStore>,
        registry: Arc<BranchRegistry>,
        user: Arc<dyn UserResource>,
    ) -> Self {
        Self {
            states,
            registry,
            user,
            rollback_window: Duration::hours(1),
        }
    }

    /// Overrides the fallback rollback window (default one hour).
    pub fn with_rollback_window(mut self, window: Duration) -> Self {
        self.rollback_window = window;
        self
    }

    /// Classifies the branch pair of one transaction.
    pub async fn check(&self, transaction_id: TransactionId) -> ConsistencyReport {
        let (user_state, article_state) = match self.branch_states(transaction_id).await {
            Ok(pair) => pair,
            Err(_) => return ConsistencyReport::Pending,
        };

        let (Some(user_state), Some(article_state)) = (&user_state, &article_state) else {
            return ConsistencyReport::Pending;
        };

        use ActionStatus::*;
        match (user_state.status, article_state.status) {
            (Committed, Committed) => ConsistencyReport::ConsistentCommitted,
            (Rollbacked, Rollbacked) => ConsistencyReport::ConsistentRolledBack,
            (Failed, Rollbacked) | (Rollbacked, Failed) => ConsistencyReport::ExpectedMixed,
            (Committed, Rollbacked) | (Committed, Failed) => ConsistencyReport::Inconsistent {
                committed_branch: USER_LAST_LOGIN,
            },
            (Rollbacked, Committed) | (Failed, Committed) => ConsistencyReport::Inconsistent {
                committed_branch: ARTICLE_UPDATE,
            },
            _ => ConsistencyReport::Pending,
        }
    }

    /// Rolls the committed branch back if the pair is inconsistent.
    #[tracing::instrument(skip(self), fields(transaction_id = %transaction_id))]
    pub async fn repair(&self, transaction_id: TransactionId) -> RepairOutcome {
        let committed_branch = match self.check(transaction_id).await {
            ConsistencyReport::Inconsistent { committed_branch } => committed_branch,
            _ => return RepairOutcome::NotNeeded,
        };

        metrics::counter!("tcc_inconsistencies_total").increment(1);
        tracing::warn!(
            transaction_id = %transaction_id,
            committed_branch,
            "inconsistent branch pair detected; rolling the committed branch back"
        );

        let (user_state, article_state) = match self.branch_states(transaction_id).await {
            Ok(pair) => pair,
            Err(error) => return RepairOutcome::Failed(error),
        };
        let (committed, other) = if committed_branch == USER_LAST_LOGIN {
            (user_state, article_state)
        } else {
            (article_state, user_state)
        };
        let Some(committed) = committed else {
            return RepairOutcome::Failed("committed branch record vanished".to_string());
        };
        let sibling_key = other.map(|s| s.business_key).unwrap_or_default();

        if committed.original_data.is_none() {
            return self.fallback_repair(transaction_id, &committed).await;
        }

        // The branch's own Cancel accepts a forced rollback from
        // Committed and runs its normal restore path.
        let ctx = ActionContext::new(transaction_id, committed.business_key, sibling_key);
        if self.registry.force_cancel(committed_branch, &ctx).await {
            metrics::counter!("tcc_repairs_total").increment(1);
            RepairOutcome::Repaired { used_fallback: false }
        } else {
            RepairOutcome::Failed(format!("forced cancel of '{committed_branch}' failed"))
        }
    }

    /// Human-readable status line for one transaction.
    pub async fn report(&self, transaction_id: TransactionId) -> String {
        let (user_state, article_state) = self
            .branch_states(transaction_id)
            .await
            .unwrap_or((None, None));
        let describe = |state: &Option<ActionState>| {
            state
                .as_ref()
                .map(|s| s.status.to_string())
                .unwrap_or_else(|| "absent".to_string())
        };
        format!(
            "{transaction_id}: {USER_LAST_LOGIN}={}, {ARTICLE_UPDATE}={} => {:?}",
            describe(&user_state),
            describe(&article_state),
            self.check(transaction_id).await,
        )
    }

    async fn fallback_repair(
        &self,
        transaction_id: TransactionId,
        committed: &ActionState,
    ) -> RepairOutcome {
        if committed.action_name != USER_LAST_LOGIN {
            return RepairOutcome::Failed(format!(
                "no pre-image for committed branch '{}'",
                committed.action_name
            ));
        }

        let user_id = UserId::new(committed.business_key);
        let approximate = Utc::now() - self.rollback_window;
        tracing::warn!(
            transaction_id = %transaction_id,
            user_id = %user_id,
            "pre-image missing; restoring last login time to the window start"
        );
        if let Err(error) = self
            .user
            .restore_last_login_time(user_id, Some(approximate))
            .await
        {
            return RepairOutcome::Failed(error.to_string());
        }

        match self
            .states
            .update_status(
                transaction_id,
                USER_LAST_LOGIN,
                &[ActionStatus::Committed],
                ActionStatus::Rollbacked,
            )
            .await
        {
            Ok(_) => {
                metrics::counter!("tcc_repairs_total").increment(1);
                RepairOutcome::Repaired { used_fallback: true }
            }
            Err(error) => RepairOutcome::Failed(error.to_string()),
        }
    }

    async fn branch_states(
        &self,
        transaction_id: TransactionId,
    ) -> std::result::Result<(Option<ActionState>, Option<ActionState>), String> {
        let states = self
            .states
            .states_for_transaction(transaction_id)
            .await
            .map_err(|e| e.to_string())?;
        let mut user_state = None;
        let mut article_state = None;
        for state in states {
            match state.action_name.as_str() {
                USER_LAST_LOGIN => user_state = Some(state),
                ARTICLE_UPDATE => article_state = Some(state),
                _ => {}
            }
        }
        Ok((user_state, article_state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::enforcer::CrossBranchEnforcer;
    use crate::user_action::{UserLoginAction, UserPreImage};

    use resources::InMemoryUserResource;
    use store::memory::InMemoryActionStateStore;

    struct Fixture {
        states: Arc<InMemoryActionStateStore>,
        user: Arc<InMemoryUserResource>,
        monitor: ConsistencyMonitor,
    }

    fn fixture() -> Fixture {
        let states = Arc::new(InMemoryActionStateStore::new());
        let user = Arc::new(InMemoryUserResource::new());
        let registry = Arc::new(BranchRegistry::new());
        let enforcer = Arc::new(CrossBranchEnforcer::new(states.clone(), registry.clone()));
        let user_action = Arc::new(UserLoginAction::new(
            user.clone(),
            states.clone(),
            enforcer,
            RetryPolicy::default(),
        ));
        registry.register(user_action);
        let monitor = ConsistencyMonitor::new(states.clone(), registry, user.clone());
        Fixture {
            states,
            user,
            monitor,
        }
    }

    async fn seed_state(
        fixture: &Fixture,
        xid: TransactionId,
        action_name: &str,
        business_key: u64,
        status: ActionStatus,
        original_data: Option<serde_json::Value>,
    ) {
        let mut state = ActionState::tried(
            xid,
            action_name,
            business_key,
            serde_json::Value::Null,
            original_data,
            3,
        );
        state.status = status;
        fixture.states.insert(state).await.unwrap();
    }

    #[tokio::test]
    async fn classifies_consistent_pairs() {
        let fixture = fixture();
        let xid = TransactionId::new();
        seed_state(&fixture, xid, USER_LAST_LOGIN, 1, ActionStatus::Committed, None).await;
        seed_state(&fixture, xid, ARTICLE_UPDATE, 5, ActionStatus::Committed, None).await;
        assert_eq!(
            fixture.monitor.check(xid).await,
            ConsistencyReport::ConsistentCommitted
        );
    }

    #[tokio::test]
    async fn classifies_expected_mixed() {
        let fixture = fixture();
        let xid = TransactionId::new();
        seed_state(&fixture, xid, USER_LAST_LOGIN, 1, ActionStatus::Failed, None).await;
        seed_state(&fixture, xid, ARTICLE_UPDATE, 5, ActionStatus::Rollbacked, None).await;
        assert_eq!(
            fixture.monitor.check(xid).await,
            ConsistencyReport::ExpectedMixed
        );
    }

    #[tokio::test]
    async fn missing_branch_is_pending() {
        let fixture = fixture();
        let xid = TransactionId::new();
        seed_state(&fixture, xid, USER_LAST_LOGIN, 1, ActionStatus::Committed, None).await;
        assert_eq!(fixture.monitor.check(xid).await, ConsistencyReport::Pending);
    }

    #[tokio::test]
    async fn repairs_committed_user_branch_through_cancel() {
        let fixture = fixture();
        let xid = TransactionId::new();
        let original = Utc::now() - chrono::Duration::days(2);
        fixture.user.insert_user(UserId::new(1), "alice", Some(original));
        fixture.user.update_last_login_time(UserId::new(1)).await.unwrap();

        let pre_image = UserPreImage {
            user_id: UserId::new(1),
            last_login_time: Some(original),
            version: 1,
        };
        seed_state(
            &fixture,
            xid,
            USER_LAST_LOGIN,
            1,
            ActionStatus::Committed,
            Some(serde_json::to_value(&pre_image).unwrap()),
        )
        .await;
        seed_state(&fixture, xid, ARTICLE_UPDATE, 5, ActionStatus::Rollbacked, None).await;

        assert_eq!(
            fixture.monitor.check(xid).await,
            ConsistencyReport::Inconsistent {
                committed_branch: USER_LAST_LOGIN
            }
        );
        assert_eq!(
            fixture.monitor.repair(xid).await,
            RepairOutcome::Repaired { used_fallback: false }
        );

        let record = fixture.user.get_user(UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(record.last_login_time, Some(original));
        assert_eq!(
            fixture.monitor.check(xid).await,
            ConsistencyReport::ConsistentRolledBack
        );
    }

    #[tokio::test]
    async fn repair_without_pre_image_uses_window_fallback() {
        let fixture = fixture();
        let xid = TransactionId::new();
        fixture.user.insert_user(UserId::new(1), "alice", None);
        fixture.user.update_last_login_time(UserId::new(1)).await.unwrap();

        seed_state(&fixture, xid, USER_LAST_LOGIN, 1, ActionStatus::Committed, None).await;
        seed_state(&fixture, xid, ARTICLE_UPDATE, 5, ActionStatus::Rollbacked, None).await;

        assert_eq!(
            fixture.monitor.repair(xid).await,
            RepairOutcome::Repaired { used_fallback: true }
        );

        let record = fixture.user.get_user(UserId::new(1)).await.unwrap().unwrap();
        let restored = record.last_login_time.unwrap();
        assert!(restored <= Utc::now() - Duration::minutes(59));
    }

    #[tokio::test]
    async fn repair_is_a_no_op_for_consistent_pairs() {
        let fixture = fixture();
        let xid = TransactionId::new();
        seed_state(&fixture, xid, USER_LAST_LOGIN, 1, ActionStatus::Rollbacked, None).await;
        seed_state(&fixture, xid, ARTICLE_UPDATE, 5, ActionStatus::Rollbacked, None).await;
        assert_eq!(fixture.monitor.repair(xid).await, RepairOutcome::NotNeeded);
    }

    #[tokio::test]
    async fn report_names_both_branches() {
        let fixture = fixture();
        let xid = TransactionId::new();
        seed_state(&fixture, xid, USER_LAST_LOGIN, 1, ActionStatus::Committed, None).await;
        seed_state(&fixture, xid, ARTICLE_UPDATE, 5, ActionStatus::Committed, None).await;

        let report = fixture.monitor.report(xid).await;
        assert!(report.contains("user_last_login_time=Committed"));
        assert!(report.contains("article_update=Committed"));
        assert!(report.contains("ConsistentCommitted"));
    }
}
