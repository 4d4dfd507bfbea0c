//! Article branch: field update.

use std::sync::Arc;

use async_trait::async_trait;
use common::{ArticleId, TransactionId};
use resources::{ArticleResource, ArticleSnapshot, ArticleUpdate, CacheRefresher};
use store::{ActionState, ActionStateStore, ActionStatus};

use crate::action::{ActionContext, BranchAction};
use crate::branches::{ARTICLE_UPDATE, USER_LAST_LOGIN};
use crate::config::RetryPolicy;
use crate::enforcer::{CrossBranchEnforcer, GateDecision};

/// TCC branch that applies a partial article update.
///
/// `business_data` holds the requested [`ArticleUpdate`], `original_data`
/// the [`ArticleSnapshot`] pre-image. After a successful Confirm the
/// downstream cache is refreshed best-effort.
pub struct ArticleUpdateAction {
    article: Arc<dyn ArticleResource>,
    cache: Arc<dyn CacheRefresher>,
    states: Arc<dyn ActionStateStore>,
    enforcer: Arc<CrossBranchEnforcer>,
    policy: RetryPolicy,
}

impl ArticleUpdateAction {
    pub fn new(
        article: Arc<dyn ArticleResource>,
        cache: Arc<dyn CacheRefresher>,
        states: Arc<dyn ActionStateStore>,
        enforcer: Arc<CrossBranchEnforcer>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            article,
            cache,
            states,
            enforcer,
            policy,
        }
    }

    /// Try phase: snapshot the article, persist the `Tried` record, then
    /// apply the update.
    #[tracing::instrument(skip(self, update), fields(article_id = %article_id))]
    pub async fn try_update_article(&self, article_id: ArticleId, update: ArticleUpdate) -> bool {
        let article = match self.article.get_article(article_id).await {
            Ok(Some(article)) => article,
            Ok(None) => {
                tracing::warn!(article_id = %article_id, "Try rejected: article not found");
                return false;
            }
            Err(error) => {
                tracing::error!(article_id = %article_id, %error, "Try rejected: article lookup failed");
                return false;
            }
        };

        let snapshot = article.snapshot();
        let (business_data, original_data) = match (
            serde_json::to_value(&update),
            serde_json::to_value(&snapshot),
        ) {
            (Ok(business), Ok(original)) => (business, original),
            (Err(error), _) | (_, Err(error)) => {
                tracing::error!(article_id = %article_id, %error, "payload serialization failed");
                return false;
            }
        };

        let state = ActionState::tried(
            TransactionId::provisional(),
            ARTICLE_UPDATE,
            article_id.value(),
            business_data,
            Some(original_data),
            self.policy.effective_max(),
        );
        if let Err(error) = self.states.insert(state).await {
            tracing::error!(article_id = %article_id, %error, "Try rejected: state insert failed");
            return false;
        }

        match self.article.update_article(article_id, update).await {
            Ok(updated) => {
                tracing::info!(article_id = %article_id, version = updated.version, "article updated");
                metrics::counter!("tcc_try_total", "action" => ARTICLE_UPDATE).increment(1);
                true
            }
            Err(error) => {
                tracing::error!(article_id = %article_id, %error, "Try rejected: business write failed");
                if let Err(purge_error) = self
                    .states
                    .remove_by_business_key(ARTICLE_UPDATE, article_id.value())
                    .await
                {
                    tracing::error!(article_id = %article_id, %purge_error, "Tried record purge failed");
                }
                false
            }
        }
    }

    async fn write_still_in_effect(&self, state: &ActionState) -> bool {
        let Some(snapshot) = Self::snapshot(state) else {
            return false;
        };
        let article_id = ArticleId::new(state.business_key);
        match self.article.get_article(article_id).await {
            Ok(Some(article)) => article.version == snapshot.version + 1,
            Ok(None) => false,
            Err(error) => {
                tracing::error!(
                    article_id = %article_id,
                    %error,
                    "version check failed; assuming rollback stands"
                );
                false
            }
        }
    }

    fn snapshot(state: &ActionState) -> Option<ArticleSnapshot> {
        let value = state.original_data.clone()?;
        match serde_json::from_value(value) {
            Ok(snapshot) => Some(snapshot),
            Err(error) => {
                tracing::error!(
                    transaction_id = %state.transaction_id,
                    %error,
                    "snapshot deserialization failed"
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
                ARTICLE_UPDATE,
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

        if !flipped {
            return matches!(
                self.states.get(ctx.transaction_id, ARTICLE_UPDATE).await,
                Ok(Some(state)) if state.status == ActionStatus::Committed
            );
        }

        metrics::counter!("tcc_confirm_total", "action" => ARTICLE_UPDATE).increment(1);

        // The commit stands regardless of whether the refresh reaches the
        // cache.
        let article_id = ArticleId::new(ctx.business_key);
        if let Err(error) = self.cache.refresh_article(article_id).await {
            tracing::warn!(article_id = %article_id, %error, "cache refresh failed");
        }
        true
    }

    async fn rollback(&self, ctx: &ActionContext, state: &ActionState) -> bool {
        match Self::snapshot(state) {
            Some(snapshot) => {
                let article_id = ArticleId::new(state.business_key);
                if let Err(error) = self.article.restore_article(article_id, snapshot).await {
                    tracing::error!(
                        transaction_id = %ctx.transaction_id,
                        article_id = %article_id,
                        %error,
                        "restore failed; requesting redelivery"
                    );
                    return false;
                }
            }
            None => {
                tracing::warn!(
                    transaction_id = %ctx.transaction_id,
                    "no snapshot recorded; skipping the inverse write"
                );
            }
        }

        let flipped = match self
            .states
            .update_status(
                ctx.transaction_id,
                ARTICLE_UPDATE,
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
            metrics::counter!("tcc_cancel_total", "action" => ARTICLE_UPDATE).increment(1);
            return true;
        }
        matches!(
            self.states.get(ctx.transaction_id, ARTICLE_UPDATE).await,
            Ok(Some(state)) if state.status == ActionStatus::Rollbacked
        )
    }
}

#[async_trait]
impl BranchAction for ArticleUpdateAction {
    fn action_name(&self) -> &'static str {
        ARTICLE_UPDATE
    }

    #[tracing::instrument(skip(self, ctx), fields(transaction_id = %ctx.transaction_id))]
    async fn confirm(&self, ctx: &ActionContext) -> bool {
        let state = match self
            .states
            .adopt(ctx.transaction_id, ARTICLE_UPDATE, ctx.business_key)
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
                    ARTICLE_UPDATE,
                    ctx.business_key,
                    USER_LAST_LOGIN,
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
                        ARTICLE_UPDATE,
                        ctx.business_key,
                        USER_LAST_LOGIN,
                        ctx.sibling_key,
                    )
                    .await
                {
                    GateDecision::Proceed => self.commit(ctx).await,
                    GateDecision::Retry => false,
                    GateDecision::Converged => self.cancel(ctx).await,
                }
            }
            ActionStatus::Failed => {
                self.enforcer
                    .handle_own_failed(
                        ctx.transaction_id,
                        ARTICLE_UPDATE,
                        ctx.business_key,
                        USER_LAST_LOGIN,
                        ctx.sibling_key,
                    )
                    .await
            }
            ActionStatus::Rollbacked => {
                let in_effect = self.write_still_in_effect(&state).await;
                self.enforcer
                    .handle_rollbacked(ctx.transaction_id, ARTICLE_UPDATE, in_effect)
                    .await
            }
        }
    }

    #[tracing::instrument(skip(self, ctx), fields(transaction_id = %ctx.transaction_id))]
    async fn cancel(&self, ctx: &ActionContext) -> bool {
        let state = match self
            .states
            .adopt(ctx.transaction_id, ARTICLE_UPDATE, ctx.business_key)
            .await
        {
            Ok(state) => state,
            Err(error) => {
                tracing::error!(transaction_id = %ctx.transaction_id, %error, "state lookup failed");
                return false;
            }
        };

        let Some(state) = state else {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BranchRegistry;
    use resources::{InMemoryArticleResource, RecordingCacheRefresher};
    use store::memory::InMemoryActionStateStore;

    fn action() -> (
        Arc<InMemoryArticleResource>,
        Arc<RecordingCacheRefresher>,
        Arc<InMemoryActionStateStore>,
        ArticleUpdateAction,
    ) {
        let article = Arc::new(InMemoryArticleResource::new());
        let cache = Arc::new(RecordingCacheRefresher::new());
        let states = Arc::new(InMemoryActionStateStore::new());
        let registry = Arc::new(BranchRegistry::new());
        let enforcer = Arc::new(CrossBranchEnforcer::new(states.clone(), registry));
        let action = ArticleUpdateAction::new(
            article.clone(),
            cache.clone(),
            states.clone(),
            enforcer,
            RetryPolicy::default(),
        );
        (article, cache, states, action)
    }

    fn title_update(title: &str) -> ArticleUpdate {
        ArticleUpdate {
            title: Some(title.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn try_applies_update_and_persists_snapshot() {
        let (article, _cache, states, action) = action();
        let id = ArticleId::new(5);
        article.insert_article(id, "old", "body");

        assert!(action.try_update_article(id, title_update("new")).await);
        assert_eq!(
            article.get_article(id).await.unwrap().unwrap().title,
            "new"
        );

        let state = states
            .find_by_business_key(ARTICLE_UPDATE, 5)
            .await
            .unwrap()
            .unwrap();
        let snapshot: ArticleSnapshot =
            serde_json::from_value(state.original_data.unwrap()).unwrap();
        assert_eq!(snapshot.title, "old");
        assert_eq!(snapshot.version, 1);
    }

    #[tokio::test]
    async fn failed_try_purges_record() {
        let (article, _cache, states, action) = action();
        let id = ArticleId::new(5);
        article.insert_article(id, "old", "body");
        article.set_fail_on_update(true);

        assert!(!action.try_update_article(id, title_update("new")).await);
        assert!(states
            .find_by_business_key(ARTICLE_UPDATE, 5)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn confirm_refreshes_cache_once() {
        let (article, cache, _states, action) = action();
        let id = ArticleId::new(5);
        article.insert_article(id, "old", "body");
        assert!(action.try_update_article(id, title_update("new")).await);

        let ctx = ActionContext::new(TransactionId::new(), 5, 1);
        assert!(action.confirm(&ctx).await);
        assert!(action.confirm(&ctx).await);
        // Idempotent re-entry returns the cached result without a second
        // refresh.
        assert_eq!(cache.refreshed(), vec![id]);
    }

    #[tokio::test]
    async fn cancel_restores_snapshot() {
        let (article, _cache, _states, action) = action();
        let id = ArticleId::new(5);
        article.insert_article(id, "old", "body");
        assert!(action.try_update_article(id, title_update("new")).await);

        let ctx = ActionContext::new(TransactionId::new(), 5, 1);
        assert!(action.cancel(&ctx).await);

        let record = article.get_article(id).await.unwrap().unwrap();
        assert_eq!(record.title, "old");
        assert_eq!(article.restore_count(), 1);
    }

    #[tokio::test]
    async fn forced_cancel_rolls_back_a_committed_branch() {
        let (article, _cache, states, action) = action();
        let id = ArticleId::new(5);
        article.insert_article(id, "old", "body");
        assert!(action.try_update_article(id, title_update("new")).await);

        let xid = TransactionId::new();
        let ctx = ActionContext::new(xid, 5, 1);
        assert!(action.confirm(&ctx).await);

        // A forced Cancel drags the branch out of Committed.
        assert!(action.cancel(&ctx).await);
        let state = states.get(xid, ARTICLE_UPDATE).await.unwrap().unwrap();
        assert_eq!(state.status, ActionStatus::Rollbacked);
        let record = article.get_article(id).await.unwrap().unwrap();
        assert_eq!(record.title, "old");
    }

    #[tokio::test]
    async fn cancel_without_try_is_null_rollback() {
        let (article, _cache, _states, action) = action();
        let ctx = ActionContext::new(TransactionId::new(), 5, 1);
        assert!(action.cancel(&ctx).await);
        assert_eq!(article.restore_count(), 0);
    }
}
