//! Shared types for the cross-service consistency core.

pub mod types;

pub use types::{ArticleId, TransactionId, UserId};
