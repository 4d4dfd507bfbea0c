//! Resource collaborators consumed by the consistency core.
//!
//! The user and article resources are independently owned services; this
//! crate only defines their client-side contracts plus in-memory
//! implementations with failure injection for tests. Every successful
//! write bumps the record's monotonic `version`, which the defensive
//! Confirm reconciliation uses instead of wall-clock comparison.

pub mod article;
pub mod cache;
pub mod error;
pub mod user;

pub use article::{
    ArticleRecord, ArticleResource, ArticleSnapshot, ArticleUpdate, InMemoryArticleResource,
};
pub use cache::{CacheRefresher, NoopCacheRefresher, RecordingCacheRefresher};
pub use error::{ResourceError, Result};
pub use user::{InMemoryUserResource, UserRecord, UserResource};
