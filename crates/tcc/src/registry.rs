//! Branch registry for cross-branch lookups.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::action::{ActionContext, BranchAction};

/// Name-keyed registry of branch actions.
///
/// The cross-branch enforcer reaches the sibling branch through this
/// registry instead of holding it directly, which breaks the
/// compile-time cycle between the user and article implementations. The
/// map is populated after both actions are constructed.
#[derive(Default)]
pub struct BranchRegistry {
    actions: RwLock<HashMap<&'static str, Arc<dyn BranchAction>>>,
}

impl BranchRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a branch action under its own name.
    pub fn register(&self, action: Arc<dyn BranchAction>) {
        let mut actions = self.actions.write().unwrap();
        actions.insert(action.action_name(), action);
    }

    /// Looks a branch up by name.
    pub fn get(&self, action_name: &str) -> Option<Arc<dyn BranchAction>> {
        let actions = self.actions.read().unwrap();
        actions.get(action_name).cloned()
    }

    /// Forces Cancel on the named branch.
    ///
    /// This is the enforcer's direct in-process call: idempotent on the
    /// target side and non-blocking beyond its own synchronous await. An
    /// unregistered branch is logged and reported as `false`.
    pub async fn force_cancel(&self, action_name: &str, ctx: &ActionContext) -> bool {
        let Some(action) = self.get(action_name) else {
            tracing::error!(
                action = action_name,
                transaction_id = %ctx.transaction_id,
                "forced cancel requested for unregistered branch"
            );
            return false;
        };

        tracing::warn!(
            action = action_name,
            transaction_id = %ctx.transaction_id,
            business_key = ctx.business_key,
            "forcing sibling branch cancel"
        );
        metrics::counter!("tcc_forced_cancels_total").increment(1);
        action.cancel(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::TransactionId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubAction {
        cancels: AtomicUsize,
    }

    #[async_trait]
    impl BranchAction for StubAction {
        fn action_name(&self) -> &'static str {
            "stub_action"
        }

        async fn confirm(&self, _ctx: &ActionContext) -> bool {
            true
        }

        async fn cancel(&self, _ctx: &ActionContext) -> bool {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn register_and_force_cancel() {
        let registry = BranchRegistry::new();
        let action = Arc::new(StubAction {
            cancels: AtomicUsize::new(0),
        });
        registry.register(action.clone());

        let ctx = ActionContext::new(TransactionId::new(), 1, 2);
        assert!(registry.force_cancel("stub_action", &ctx).await);
        assert_eq!(action.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_cancel_on_unregistered_branch_reports_false() {
        let registry = BranchRegistry::new();
        let ctx = ActionContext::new(TransactionId::new(), 1, 2);
        assert!(!registry.force_cancel("missing", &ctx).await);
    }
}
