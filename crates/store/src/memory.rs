//! In-memory store implementations.
//!
//! These back the tests and the default wiring; production deployments
//! swap in durable implementations behind the same traits. All
//! check-and-set operations run under a single write lock, so each trait
//! method is atomic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{TransactionId, UserId};
use tokio::sync::RwLock;

use crate::action::{ActionState, ActionStateStore, ActionStatus};
use crate::error::{Result, StoreError};
use crate::oplog::{OperationLogRecord, OperationLogStore, OperationStatus};
use crate::txlog::{
    CompensationStatus, LocalStatus, MessageStatus, TransactionLogRecord, TransactionLogStore,
};

type ActionKey = (TransactionId, String);

/// In-memory action state store with a primary index on
/// `(transaction_id, action_name)` and a linear secondary lookup by
/// `(action_name, business_key)`.
#[derive(Clone, Default)]
pub struct InMemoryActionStateStore {
    states: Arc<RwLock<HashMap<ActionKey, ActionState>>>,
}

impl InMemoryActionStateStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of records stored.
    pub async fn record_count(&self) -> usize {
        self.states.read().await.len()
    }
}

#[async_trait]
impl ActionStateStore for InMemoryActionStateStore {
    async fn insert(&self, state: ActionState) -> Result<()> {
        let mut states = self.states.write().await;
        let key = (state.transaction_id, state.action_name.clone());
        if states.contains_key(&key) {
            return Err(StoreError::DuplicateState {
                transaction_id: state.transaction_id,
                action_name: state.action_name,
            });
        }
        states.insert(key, state);
        Ok(())
    }

    async fn get(
        &self,
        transaction_id: TransactionId,
        action_name: &str,
    ) -> Result<Option<ActionState>> {
        let states = self.states.read().await;
        Ok(states.get(&(transaction_id, action_name.to_string())).cloned())
    }

    async fn find_by_business_key(
        &self,
        action_name: &str,
        business_key: u64,
    ) -> Result<Option<ActionState>> {
        let states = self.states.read().await;
        Ok(states
            .values()
            .find(|s| s.action_name == action_name && s.business_key == business_key)
            .cloned())
    }

    async fn adopt(
        &self,
        transaction_id: TransactionId,
        action_name: &str,
        business_key: u64,
    ) -> Result<Option<ActionState>> {
        let mut states = self.states.write().await;
        let primary = (transaction_id, action_name.to_string());
        if let Some(state) = states.get(&primary) {
            return Ok(Some(state.clone()));
        }

        // Provisional-key record saved by Try before the real transaction
        // id was known; migrate it under the real id.
        let provisional = states
            .iter()
            .find(|(_, s)| s.action_name == action_name && s.business_key == business_key)
            .map(|(k, _)| k.clone());

        if let Some(old_key) = provisional {
            let mut state = states.remove(&old_key).expect("key just observed");
            tracing::info!(
                provisional_id = %old_key.0,
                %transaction_id,
                action = action_name,
                "migrating action state to real transaction id"
            );
            state.transaction_id = transaction_id;
            states.insert(primary, state.clone());
            return Ok(Some(state));
        }

        Ok(None)
    }

    async fn update_status(
        &self,
        transaction_id: TransactionId,
        action_name: &str,
        expected: &[ActionStatus],
        new_status: ActionStatus,
    ) -> Result<bool> {
        let mut states = self.states.write().await;
        match states.get_mut(&(transaction_id, action_name.to_string())) {
            Some(state) if expected.contains(&state.status) => {
                state.status = new_status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_retry(
        &self,
        transaction_id: TransactionId,
        action_name: &str,
    ) -> Result<Option<(u32, u32)>> {
        let mut states = self.states.write().await;
        Ok(states
            .get_mut(&(transaction_id, action_name.to_string()))
            .map(|state| {
                state.retry_count += 1;
                (state.retry_count, state.max_retry_count)
            }))
    }

    async fn mark_failed(
        &self,
        transaction_id: TransactionId,
        action_name: &str,
        business_key: u64,
        reason: &str,
        max_retry_count: u32,
    ) -> Result<()> {
        let mut states = self.states.write().await;
        let key = (transaction_id, action_name.to_string());
        match states.get_mut(&key) {
            Some(state) => {
                state.status = ActionStatus::Failed;
                state.fail_reason = Some(reason.to_string());
            }
            None => {
                states.insert(
                    key,
                    ActionState::failed(
                        transaction_id,
                        action_name,
                        business_key,
                        reason,
                        max_retry_count,
                    ),
                );
            }
        }
        Ok(())
    }

    async fn remove_by_business_key(&self, action_name: &str, business_key: u64) -> Result<()> {
        let mut states = self.states.write().await;
        let key = states
            .iter()
            .find(|(_, s)| s.action_name == action_name && s.business_key == business_key)
            .map(|(k, _)| k.clone());
        if let Some(key) = key {
            states.remove(&key);
        }
        Ok(())
    }

    async fn states_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<ActionState>> {
        let states = self.states.read().await;
        Ok(states
            .values()
            .filter(|s| s.transaction_id == transaction_id)
            .cloned()
            .collect())
    }
}

/// In-memory transaction log store.
#[derive(Clone, Default)]
pub struct InMemoryTransactionLogStore {
    rows: Arc<RwLock<HashMap<TransactionId, TransactionLogRecord>>>,
}

impl InMemoryTransactionLogStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of rows stored.
    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl TransactionLogStore for InMemoryTransactionLogStore {
    async fn insert(&self, record: TransactionLogRecord) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.insert(record.transaction_id, record);
        Ok(())
    }

    async fn get(&self, transaction_id: TransactionId) -> Result<Option<TransactionLogRecord>> {
        let rows = self.rows.read().await;
        Ok(rows.get(&transaction_id).cloned())
    }

    async fn update_message_status(
        &self,
        transaction_id: TransactionId,
        status: MessageStatus,
    ) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&transaction_id)
            .ok_or(StoreError::TransactionLogNotFound(transaction_id))?;
        row.message_status = status;
        row.updated_time = Utc::now();
        Ok(())
    }

    async fn update_local_status(
        &self,
        transaction_id: TransactionId,
        status: LocalStatus,
    ) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&transaction_id)
            .ok_or(StoreError::TransactionLogNotFound(transaction_id))?;
        row.local_status = status;
        row.updated_time = Utc::now();
        Ok(())
    }

    async fn set_error(&self, transaction_id: TransactionId, message: &str) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&transaction_id)
            .ok_or(StoreError::TransactionLogNotFound(transaction_id))?;
        row.error_message = Some(message.to_string());
        row.updated_time = Utc::now();
        Ok(())
    }

    async fn mark_compensated(
        &self,
        transaction_id: TransactionId,
        outcome: CompensationStatus,
    ) -> Result<bool> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&transaction_id)
            .ok_or(StoreError::TransactionLogNotFound(transaction_id))?;
        if row.compensation == CompensationStatus::Succeeded {
            return Ok(false);
        }
        row.compensation = outcome;
        row.updated_time = Utc::now();
        Ok(true)
    }

    async fn needing_compensation(&self, grace: Duration) -> Result<Vec<TransactionLogRecord>> {
        let cutoff = Utc::now() - grace;
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|r| r.needs_compensation() && r.updated_time < cutoff)
            .cloned()
            .collect())
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, r| r.created_time >= cutoff);
        Ok(before - rows.len())
    }

    async fn unresolved_count(&self) -> Result<usize> {
        let rows = self.rows.read().await;
        Ok(rows.values().filter(|r| r.needs_compensation()).count())
    }
}

/// In-memory operation log store.
#[derive(Clone, Default)]
pub struct InMemoryOperationLogStore {
    rows: Arc<RwLock<Vec<OperationLogRecord>>>,
}

impl InMemoryOperationLogStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of rows stored.
    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl OperationLogStore for InMemoryOperationLogStore {
    async fn insert(&self, record: OperationLogRecord) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.push(record);
        Ok(())
    }

    async fn get(
        &self,
        transaction_id: TransactionId,
        user_id: UserId,
    ) -> Result<Option<OperationLogRecord>> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .find(|r| r.transaction_id == transaction_id && r.user_id == user_id)
            .cloned())
    }

    async fn update_status(
        &self,
        transaction_id: TransactionId,
        status: OperationStatus,
    ) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .iter_mut()
            .find(|r| r.transaction_id == transaction_id)
            .ok_or(StoreError::OperationLogNotFound(transaction_id))?;
        row.operation_status = status;
        row.updated_time = Utc::now();
        Ok(())
    }

    async fn set_error(&self, transaction_id: TransactionId, message: &str) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .iter_mut()
            .find(|r| r.transaction_id == transaction_id)
            .ok_or(StoreError::OperationLogNotFound(transaction_id))?;
        row.error_message = Some(message.to_string());
        row.updated_time = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ArticleId;

    fn tried_state(xid: TransactionId, action: &str, key: u64) -> ActionState {
        ActionState::tried(
            xid,
            action,
            key,
            serde_json::json!({"key": key}),
            Some(serde_json::json!({"version": 1})),
            3,
        )
    }

    #[tokio::test]
    async fn insert_and_get_by_primary_key() {
        let store = InMemoryActionStateStore::new();
        let xid = TransactionId::new();
        store.insert(tried_state(xid, "user_last_login_time", 1)).await.unwrap();

        let state = store.get(xid, "user_last_login_time").await.unwrap().unwrap();
        assert_eq!(state.business_key, 1);
        assert_eq!(state.status, ActionStatus::Tried);
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = InMemoryActionStateStore::new();
        let xid = TransactionId::new();
        store.insert(tried_state(xid, "a", 1)).await.unwrap();

        let result = store.insert(tried_state(xid, "a", 1)).await;
        assert!(matches!(result, Err(StoreError::DuplicateState { .. })));
    }

    #[tokio::test]
    async fn find_by_business_key() {
        let store = InMemoryActionStateStore::new();
        store
            .insert(tried_state(TransactionId::provisional(), "article_update", 5))
            .await
            .unwrap();

        let state = store.find_by_business_key("article_update", 5).await.unwrap();
        assert!(state.is_some());
        assert!(store.find_by_business_key("article_update", 6).await.unwrap().is_none());
        assert!(store.find_by_business_key("other_action", 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn adopt_migrates_provisional_record() {
        let store = InMemoryActionStateStore::new();
        let provisional = TransactionId::provisional();
        store.insert(tried_state(provisional, "user_last_login_time", 1)).await.unwrap();

        let real = TransactionId::new();
        let state = store.adopt(real, "user_last_login_time", 1).await.unwrap().unwrap();
        assert_eq!(state.transaction_id, real);

        // The provisional key is gone; the real key now hits directly.
        assert!(store.get(provisional, "user_last_login_time").await.unwrap().is_none());
        assert!(store.get(real, "user_last_login_time").await.unwrap().is_some());
        assert_eq!(store.record_count().await, 1);
    }

    #[tokio::test]
    async fn adopt_misses_when_no_record_exists() {
        let store = InMemoryActionStateStore::new();
        let state = store.adopt(TransactionId::new(), "a", 1).await.unwrap();
        assert!(state.is_none());
    }

    #[tokio::test]
    async fn update_status_is_a_compare_and_set() {
        let store = InMemoryActionStateStore::new();
        let xid = TransactionId::new();
        store.insert(tried_state(xid, "a", 1)).await.unwrap();

        // Wrong expectation: no transition.
        let moved = store
            .update_status(xid, "a", &[ActionStatus::Failed], ActionStatus::Committed)
            .await
            .unwrap();
        assert!(!moved);
        assert_eq!(store.get(xid, "a").await.unwrap().unwrap().status, ActionStatus::Tried);

        // Matching expectation: transition happens exactly once.
        let moved = store
            .update_status(xid, "a", &[ActionStatus::Tried], ActionStatus::Committed)
            .await
            .unwrap();
        assert!(moved);
        let again = store
            .update_status(xid, "a", &[ActionStatus::Tried], ActionStatus::Committed)
            .await
            .unwrap();
        assert!(!again);
    }

    #[tokio::test]
    async fn increment_retry_is_monotonic() {
        let store = InMemoryActionStateStore::new();
        let xid = TransactionId::new();
        store.insert(tried_state(xid, "a", 1)).await.unwrap();

        assert_eq!(store.increment_retry(xid, "a").await.unwrap(), Some((1, 3)));
        assert_eq!(store.increment_retry(xid, "a").await.unwrap(), Some((2, 3)));
        assert_eq!(store.increment_retry(xid, "a").await.unwrap(), Some((3, 3)));
        assert_eq!(store.increment_retry(xid, "a").await.unwrap(), Some((4, 3)));

        assert!(store.increment_retry(TransactionId::new(), "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mark_failed_upserts_marker_with_zero_retries() {
        let store = InMemoryActionStateStore::new();
        let xid = TransactionId::new();

        store.mark_failed(xid, "a", 1, "no Tried record", 3).await.unwrap();
        let state = store.get(xid, "a").await.unwrap().unwrap();
        assert_eq!(state.status, ActionStatus::Failed);
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.fail_reason.as_deref(), Some("no Tried record"));
    }

    #[tokio::test]
    async fn mark_failed_keeps_existing_snapshots() {
        let store = InMemoryActionStateStore::new();
        let xid = TransactionId::new();
        store.insert(tried_state(xid, "a", 1)).await.unwrap();
        store.increment_retry(xid, "a").await.unwrap();

        store.mark_failed(xid, "a", 1, "sibling failed", 3).await.unwrap();
        let state = store.get(xid, "a").await.unwrap().unwrap();
        assert_eq!(state.status, ActionStatus::Failed);
        assert_eq!(state.retry_count, 1);
        assert!(state.original_data.is_some());
    }

    #[tokio::test]
    async fn remove_by_business_key_purges_the_record() {
        let store = InMemoryActionStateStore::new();
        let xid = TransactionId::provisional();
        store.insert(tried_state(xid, "a", 1)).await.unwrap();

        store.remove_by_business_key("a", 1).await.unwrap();
        assert!(store.get(xid, "a").await.unwrap().is_none());
        assert!(store.find_by_business_key("a", 1).await.unwrap().is_none());

        // Removing a missing key is a no-op.
        store.remove_by_business_key("a", 1).await.unwrap();
    }

    #[tokio::test]
    async fn states_for_transaction_returns_all_branches() {
        let store = InMemoryActionStateStore::new();
        let xid = TransactionId::new();
        store.insert(tried_state(xid, "user_last_login_time", 1)).await.unwrap();
        store.insert(tried_state(xid, "article_update", 5)).await.unwrap();
        store.insert(tried_state(TransactionId::new(), "article_update", 6)).await.unwrap();

        let states = store.states_for_transaction(xid).await.unwrap();
        assert_eq!(states.len(), 2);
    }

    fn txlog_row(xid: TransactionId) -> TransactionLogRecord {
        TransactionLogRecord::preparing(
            xid,
            "article-update",
            "update",
            serde_json::json!({}),
            UserId::new(1),
            ArticleId::new(5),
        )
    }

    #[tokio::test]
    async fn txlog_insert_update_and_select() {
        let store = InMemoryTransactionLogStore::new();
        let xid = TransactionId::new();
        store.insert(txlog_row(xid)).await.unwrap();

        store.update_local_status(xid, LocalStatus::Committed).await.unwrap();
        store.update_message_status(xid, MessageStatus::Rollback).await.unwrap();
        store.set_error(xid, "consumer failed").await.unwrap();

        let row = store.get(xid).await.unwrap().unwrap();
        assert_eq!(row.local_status, LocalStatus::Committed);
        assert_eq!(row.message_status, MessageStatus::Rollback);
        assert_eq!(row.error_message.as_deref(), Some("consumer failed"));

        // Within the grace period the row is not yet selected.
        let selected = store.needing_compensation(Duration::minutes(2)).await.unwrap();
        assert!(selected.is_empty());

        // With no grace period it is.
        let selected = store.needing_compensation(Duration::zero()).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(store.unresolved_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn txlog_mark_compensated_guard() {
        let store = InMemoryTransactionLogStore::new();
        let xid = TransactionId::new();
        store.insert(txlog_row(xid)).await.unwrap();
        store.update_local_status(xid, LocalStatus::Committed).await.unwrap();
        store.update_message_status(xid, MessageStatus::Rollback).await.unwrap();

        // A failed attempt leaves the row eligible.
        assert!(store.mark_compensated(xid, CompensationStatus::Failed).await.unwrap());
        assert_eq!(store.unresolved_count().await.unwrap(), 1);

        // Success seals the row.
        assert!(store.mark_compensated(xid, CompensationStatus::Succeeded).await.unwrap());
        assert_eq!(store.unresolved_count().await.unwrap(), 0);

        // Further attempts are refused.
        assert!(!store.mark_compensated(xid, CompensationStatus::Failed).await.unwrap());
        assert!(!store.mark_compensated(xid, CompensationStatus::Succeeded).await.unwrap());
    }

    #[tokio::test]
    async fn txlog_purge_is_independent_of_compensation_state() {
        let store = InMemoryTransactionLogStore::new();
        let xid = TransactionId::new();
        let mut row = txlog_row(xid);
        row.created_time = Utc::now() - Duration::days(40);
        row.local_status = LocalStatus::Committed;
        row.message_status = MessageStatus::Rollback;
        store.insert(row).await.unwrap();
        store.insert(txlog_row(TransactionId::new())).await.unwrap();

        let deleted = store.purge_older_than(Utc::now() - Duration::days(30)).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.row_count().await, 1);
        assert!(store.get(xid).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oplog_insert_get_and_update() {
        let store = InMemoryOperationLogStore::new();
        let xid = TransactionId::new();
        let mut record =
            OperationLogRecord::in_progress(xid, UserId::new(1), ArticleId::new(5), "UPDATE_ARTICLE");
        record.old_data = Some(serde_json::json!({"lastLoginTime": "2026-01-01T00:00:00Z"}));
        store.insert(record).await.unwrap();

        let row = store.get(xid, UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(row.operation_status, OperationStatus::InProgress);
        assert!(row.old_data.is_some());

        store.update_status(xid, OperationStatus::Compensated).await.unwrap();
        store.set_error(xid, "compensated after consumer failure").await.unwrap();
        let row = store.get(xid, UserId::new(1)).await.unwrap().unwrap();
        assert_eq!(row.operation_status, OperationStatus::Compensated);
        assert!(row.error_message.is_some());

        assert!(store.get(xid, UserId::new(2)).await.unwrap().is_none());
    }
}
