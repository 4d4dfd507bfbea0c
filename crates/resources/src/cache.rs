//! Best-effort downstream cache refresh.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::ArticleId;

/// Downstream projection/cache refresh invoked after the article branch
/// commits. Best-effort: failures are logged by the caller and never
/// affect protocol correctness.
#[async_trait]
pub trait CacheRefresher: Send + Sync {
    /// Asks the downstream projection to re-read the article.
    async fn refresh_article(&self, id: ArticleId) -> crate::Result<()>;
}

/// Refresher that does nothing.
#[derive(Debug, Clone, Default)]
pub struct NoopCacheRefresher;

#[async_trait]
impl CacheRefresher for NoopCacheRefresher {
    async fn refresh_article(&self, _id: ArticleId) -> crate::Result<()> {
        Ok(())
    }
}

/// Refresher that records refreshed ids, for tests.
#[derive(Debug, Clone, Default)]
pub struct RecordingCacheRefresher {
    refreshed: Arc<RwLock<Vec<ArticleId>>>,
}

impl RecordingCacheRefresher {
    /// Creates a new recording refresher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ids refreshed so far.
    pub fn refreshed(&self) -> Vec<ArticleId> {
        self.refreshed.read().unwrap().clone()
    }
}

#[async_trait]
impl CacheRefresher for RecordingCacheRefresher {
    async fn refresh_article(&self, id: ArticleId) -> crate::Result<()> {
        self.refreshed.write().unwrap().push(id);
        Ok(())
    }
}
