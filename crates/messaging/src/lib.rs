//! Transactional messaging for the user/article update.
//!
//! The producer stages a half message, runs the local last-login write
//! under a Transaction Log row, and then tells the broker to commit or
//! roll the message back. Lost decisions are recovered through the
//! broker's check-back, answered purely from the log row. Rows whose
//! local write committed while the message rolled back are repaired by
//! the compensation service, swept periodically by the scheduler.

pub mod broker;
pub mod compensation;
pub mod config;
pub mod error;
pub mod message;
pub mod producer;
pub mod scheduler;

pub use broker::{InMemoryBroker, MessageBroker};
pub use compensation::CompensationService;
pub use config::SchedulerConfig;
pub use error::MessagingError;
pub use message::{ArticleUpdateMessage, HalfMessage, ARTICLE_UPDATE_TAG, ARTICLE_UPDATE_TOPIC};
pub use producer::{LocalTransactionState, TransactionalProducer, UserLoginSnapshot};
pub use scheduler::{CompensationScheduler, SweepStats};
