//! Persistent state for the cross-service consistency core.
//!
//! Three stores live here:
//! - the [`ActionStateStore`] holding one record per branch action of a
//!   TCC transaction,
//! - the [`TransactionLogStore`] pairing each transactional message send
//!   with its local-transaction outcome,
//! - the [`OperationLogStore`] holding pre-image/post-image audit rows
//!   that compensation uses for its reverse write.
//!
//! All state transitions are expressed as atomic operations inside the
//! store; callers never read-then-write.

pub mod action;
pub mod error;
pub mod memory;
pub mod oplog;
pub mod txlog;

pub use action::{ActionState, ActionStateStore, ActionStatus};
pub use error::{Result, StoreError};
pub use memory::{InMemoryActionStateStore, InMemoryOperationLogStore, InMemoryTransactionLogStore};
pub use oplog::{OperationLogRecord, OperationLogStore, OperationStatus};
pub use txlog::{
    CompensationStatus, LocalStatus, MessageStatus, TransactionLogRecord, TransactionLogStore,
};
