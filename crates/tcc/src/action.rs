//! The two-phase branch action contract.

use async_trait::async_trait;
use common::TransactionId;

/// Context passed by the external coordinator to Confirm and Cancel.
///
/// Unlike Try, these calls carry the real global transaction id; the
/// business key lets the branch fall back to the secondary state index
/// when Try saved its record under a provisional id. The sibling key
/// identifies the partner branch's record for the confirm-time gate.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext {
    pub transaction_id: TransactionId,
    pub business_key: u64,
    pub sibling_key: u64,
}

impl ActionContext {
    /// Creates a context for a confirm/cancel invocation.
    pub fn new(transaction_id: TransactionId, business_key: u64, sibling_key: u64) -> Self {
        Self {
            transaction_id,
            business_key,
            sibling_key,
        }
    }
}

/// One participant's contribution to a cross-service transaction.
///
/// Implementations must be safe under at-least-once delivery: any
/// method may be invoked multiple times, concurrently or in sequence,
/// for the same key. The returned `bool` is the protocol-level answer to
/// the external coordinator: `false` asks for redelivery, `true` ends
/// the coordinator's retry loop for this branch. Errors never escape;
/// they are logged and mapped to `false`.
///
/// Try is not part of this trait: its parameters are branch-specific and
/// the orchestration entry point invokes it on the concrete types. Only
/// Confirm and Cancel are dispatched through the
/// [`registry`](crate::registry::BranchRegistry).
#[async_trait]
pub trait BranchAction: Send + Sync {
    /// The stable action name identifying this branch in the state store.
    fn action_name(&self) -> &'static str;

    /// Finalizes the branch. Never performs the business write; the
    /// write already happened at Try time.
    async fn confirm(&self, ctx: &ActionContext) -> bool;

    /// Reverses the branch by restoring the pre-image captured at Try
    /// time. A Cancel without a prior Try succeeds as a no-op.
    async fn cancel(&self, ctx: &ActionContext) -> bool;
}
