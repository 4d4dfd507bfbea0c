//! Per-branch action state for the Try/Confirm/Cancel protocol.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::TransactionId;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Lifecycle status of one branch action.
///
/// State transitions:
/// ```text
/// Tried ──┬──► Committed
///         └──► Failed ──(retry budget exhausted, forced Cancel)──► Rollbacked
/// Tried ──► Rollbacked
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionStatus {
    /// Try completed; the business write has already happened.
    Tried,

    /// Confirm finalized the branch (terminal state).
    Committed,

    /// Cancel reversed the branch (terminal state).
    Rollbacked,

    /// Confirm was rejected; the branch is waiting for the bounded
    /// forced-rollback loop to converge.
    Failed,
}

impl ActionStatus {
    /// Returns true if this is a terminal state.
    ///
    /// Re-entry on a terminal state returns the cached result and never
    /// re-executes a side effect.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Committed | ActionStatus::Rollbacked)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Tried => "Tried",
            ActionStatus::Committed => "Committed",
            ActionStatus::Rollbacked => "Rollbacked",
            ActionStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One persisted record per (transaction id, action name).
///
/// `business_data` describes the intended new state and is used to
/// reconstruct Confirm parameters; `original_data` is the pre-image used
/// to reverse the write in Cancel. Try may save the record under a
/// provisional transaction id before the branch learns the real one; the
/// store migrates it on the first adopt-lookup carrying the real id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionState {
    pub transaction_id: TransactionId,
    pub branch_id: u64,
    pub action_name: String,
    pub business_key: u64,
    pub status: ActionStatus,
    pub business_data: serde_json::Value,
    pub original_data: Option<serde_json::Value>,
    pub retry_count: u32,
    pub max_retry_count: u32,
    pub fail_reason: Option<String>,
    pub create_time: DateTime<Utc>,
}

impl ActionState {
    /// Creates a fresh `Tried` record, as persisted by a successful Try.
    pub fn tried(
        transaction_id: TransactionId,
        action_name: impl Into<String>,
        business_key: u64,
        business_data: serde_json::Value,
        original_data: Option<serde_json::Value>,
        max_retry_count: u32,
    ) -> Self {
        Self {
            transaction_id,
            branch_id: 0,
            action_name: action_name.into(),
            business_key,
            status: ActionStatus::Tried,
            business_data,
            original_data,
            retry_count: 0,
            max_retry_count,
            fail_reason: None,
            create_time: Utc::now(),
        }
    }

    /// Creates a `Failed` marker, as written by a rejected Confirm.
    pub fn failed(
        transaction_id: TransactionId,
        action_name: impl Into<String>,
        business_key: u64,
        reason: impl Into<String>,
        max_retry_count: u32,
    ) -> Self {
        Self {
            transaction_id,
            branch_id: 0,
            action_name: action_name.into(),
            business_key,
            status: ActionStatus::Failed,
            business_data: serde_json::Value::Null,
            original_data: None,
            retry_count: 0,
            max_retry_count,
            fail_reason: Some(reason.into()),
            create_time: Utc::now(),
        }
    }

    /// Returns true while the retry budget allows another attempt.
    pub fn can_retry(&self) -> bool {
        self.retry_count <= self.max_retry_count
    }
}

/// Persistent key-value store for per-branch action state.
///
/// All transitions are atomic check-and-set operations keyed by
/// `(transaction_id, action_name)` or `(action_name, business_key)`;
/// callers must never implement read-then-write on top of it. Every
/// method is safe under at-least-once, concurrent invocation.
#[async_trait]
pub trait ActionStateStore: Send + Sync {
    /// Inserts a new record. Fails with `DuplicateState` if a live record
    /// already exists for the primary key.
    async fn insert(&self, state: ActionState) -> Result<()>;

    /// Looks a record up by the primary key.
    async fn get(
        &self,
        transaction_id: TransactionId,
        action_name: &str,
    ) -> Result<Option<ActionState>>;

    /// Looks a record up by the secondary (action name, business key) index.
    async fn find_by_business_key(
        &self,
        action_name: &str,
        business_key: u64,
    ) -> Result<Option<ActionState>>;

    /// Primary lookup with business-key fallback.
    ///
    /// When the primary key misses but the secondary index hits, the
    /// record was saved under a provisional transaction id; the store
    /// migrates it to the real id before returning it. This is the merge
    /// step of the two-level index.
    async fn adopt(
        &self,
        transaction_id: TransactionId,
        action_name: &str,
        business_key: u64,
    ) -> Result<Option<ActionState>>;

    /// Atomically moves the record to `new_status` if its current status
    /// is one of `expected`. Returns whether the transition happened.
    async fn update_status(
        &self,
        transaction_id: TransactionId,
        action_name: &str,
        expected: &[ActionStatus],
        new_status: ActionStatus,
    ) -> Result<bool>;

    /// Atomically increments the retry counter.
    ///
    /// Returns the new `(retry_count, max_retry_count)` pair, or `None`
    /// if no record exists.
    async fn increment_retry(
        &self,
        transaction_id: TransactionId,
        action_name: &str,
    ) -> Result<Option<(u32, u32)>>;

    /// Upserts a `Failed` marker with the given reason and zero retries.
    ///
    /// An existing record keeps its snapshots and retry counter; only its
    /// status and reason change.
    async fn mark_failed(
        &self,
        transaction_id: TransactionId,
        action_name: &str,
        business_key: u64,
        reason: &str,
        max_retry_count: u32,
    ) -> Result<()>;

    /// Removes a record by the secondary index.
    ///
    /// Only the Try-failure purge uses this; the protocol never otherwise
    /// deletes state.
    async fn remove_by_business_key(&self, action_name: &str, business_key: u64) -> Result<()>;

    /// Returns all branch records of one transaction, for diagnostics.
    async fn states_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<ActionState>>;
}
