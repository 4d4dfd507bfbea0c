//! Try-Confirm-Cancel coordination for the user/article cross-service
//! update.
//!
//! The business effect happens at Try time; Confirm and Cancel only
//! finalize or reverse it. Each branch persists its state in the
//! [`store::ActionStateStore`] so that Confirm and Cancel stay
//! idempotent under at-least-once redelivery, null rollbacks succeed as
//! no-ops, and a Confirm arriving without a prior Try is refused instead
//! of silently succeeding.
//!
//! Before finalizing, each branch inspects its sibling's state and, on
//! detected failure, drives a bounded retry loop that ends in a forced
//! Cancel of the sibling, so both branches converge to the same terminal
//! status.

pub mod action;
pub mod article_action;
pub mod branches;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod registry;
pub mod user_action;

pub use action::{ActionContext, BranchAction};
pub use article_action::ArticleUpdateAction;
pub use config::RetryPolicy;
pub use enforcer::{CrossBranchEnforcer, GateDecision};
pub use error::TccError;
pub use monitor::{ConsistencyMonitor, ConsistencyReport, RepairOutcome};
pub use orchestrator::TccOrchestrator;
pub use registry::BranchRegistry;
pub use user_action::{UserLoginAction, UserPreImage};
