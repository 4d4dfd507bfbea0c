//! Broker abstraction for half-message delivery.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::TransactionId;

use crate::error::{MessagingError, Result};
use crate::message::HalfMessage;

/// The external message broker, reduced to the three operations the
/// transactional producer needs.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Stages a half message, invisible to consumers.
    async fn send_half(&self, message: HalfMessage) -> Result<()>;

    /// Makes the staged message visible.
    async fn commit(&self, transaction_id: TransactionId) -> Result<()>;

    /// Discards the staged message.
    async fn rollback(&self, transaction_id: TransactionId) -> Result<()>;
}

#[derive(Default)]
struct InMemoryBrokerState {
    half: HashMap<TransactionId, HalfMessage>,
    visible: Vec<HalfMessage>,
    discarded: Vec<TransactionId>,
    fail_on_send: bool,
    drop_decisions: bool,
}

/// In-memory broker for testing.
///
/// `set_drop_decisions` simulates a lost commit/rollback decision: the
/// call appears to succeed but the half message stays pending, which is
/// the situation the broker's check-back resolves through
/// `check_local_transaction`.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<RwLock<InMemoryBrokerState>>,
}

impl InMemoryBroker {
    /// Creates a new empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the broker to refuse half messages.
    pub fn set_fail_on_send(&self, fail: bool) {
        self.state.write().unwrap().fail_on_send = fail;
    }

    /// Configures the broker to lose commit/rollback decisions.
    pub fn set_drop_decisions(&self, drop: bool) {
        self.state.write().unwrap().drop_decisions = drop;
    }

    /// Messages made visible to consumers, in commit order.
    pub fn visible(&self) -> Vec<HalfMessage> {
        self.state.read().unwrap().visible.clone()
    }

    /// Transaction ids whose messages were discarded.
    pub fn discarded(&self) -> Vec<TransactionId> {
        self.state.read().unwrap().discarded.clone()
    }

    /// Half messages still awaiting a decision.
    pub fn pending(&self) -> Vec<HalfMessage> {
        self.state.read().unwrap().half.values().cloned().collect()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn send_half(&self, message: HalfMessage) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.fail_on_send {
            return Err(MessagingError::Broker("broker refused half message".to_string()));
        }
        state.half.insert(message.transaction_id, message);
        Ok(())
    }

    async fn commit(&self, transaction_id: TransactionId) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.drop_decisions {
            return Ok(());
        }
        let message = state
            .half
            .remove(&transaction_id)
            .ok_or_else(|| MessagingError::Broker(format!("no half message for {transaction_id}")))?;
        state.visible.push(message);
        Ok(())
    }

    async fn rollback(&self, transaction_id: TransactionId) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.drop_decisions {
            return Ok(());
        }
        if state.half.remove(&transaction_id).is_some() {
            state.discarded.push(transaction_id);
        }
        Ok(())
    }
}
