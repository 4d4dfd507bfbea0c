//! Article resource trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::ArticleId;
use serde::{Deserialize, Serialize};

use crate::error::{ResourceError, Result};

/// An article record as exposed by the article service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub id: ArticleId,
    pub title: String,
    pub content: String,
    pub category_id: Option<u64>,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub update_time: DateTime<Utc>,
    /// Monotonic sequence number bumped by every write.
    pub version: u64,
}

impl ArticleRecord {
    /// Captures the fields that Cancel needs to reverse an update.
    pub fn snapshot(&self) -> ArticleSnapshot {
        ArticleSnapshot {
            title: self.title.clone(),
            content: self.content.clone(),
            category_id: self.category_id,
            summary: self.summary.clone(),
            tags: self.tags.clone(),
            version: self.version,
        }
    }
}

/// Pre-image of an article, persisted as `original_data` at Try time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleSnapshot {
    pub title: String,
    pub content: String,
    pub category_id: Option<u64>,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub version: u64,
}

/// Fields to change in an article update; `None` leaves a field alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArticleUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub category_id: Option<u64>,
    pub summary: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Client-side contract of the article service.
#[async_trait]
pub trait ArticleResource: Send + Sync {
    /// Loads an article by id.
    async fn get_article(&self, id: ArticleId) -> Result<Option<ArticleRecord>>;

    /// Applies the given field changes. Returns the updated record.
    async fn update_article(&self, id: ArticleId, update: ArticleUpdate) -> Result<ArticleRecord>;

    /// Restores an article to a previously captured snapshot (the
    /// inverse write used by Cancel).
    async fn restore_article(&self, id: ArticleId, snapshot: ArticleSnapshot) -> Result<()>;
}

#[derive(Debug, Default)]
struct InMemoryArticleState {
    articles: HashMap<ArticleId, ArticleRecord>,
    fail_on_update: bool,
    fail_on_restore: bool,
    update_count: usize,
    restore_count: usize,
}

/// In-memory article resource for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryArticleResource {
    state: Arc<RwLock<InMemoryArticleState>>,
}

impl InMemoryArticleResource {
    /// Creates a new empty article resource.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an article record.
    pub fn insert_article(&self, id: ArticleId, title: impl Into<String>, content: impl Into<String>) {
        let mut state = self.state.write().unwrap();
        state.articles.insert(
            id,
            ArticleRecord {
                id,
                title: title.into(),
                content: content.into(),
                category_id: None,
                summary: None,
                tags: Vec::new(),
                update_time: Utc::now(),
                version: 1,
            },
        );
    }

    /// Configures the resource to fail the next update calls.
    pub fn set_fail_on_update(&self, fail: bool) {
        self.state.write().unwrap().fail_on_update = fail;
    }

    /// Configures the resource to fail the next restore calls.
    pub fn set_fail_on_restore(&self, fail: bool) {
        self.state.write().unwrap().fail_on_restore = fail;
    }

    /// Number of successful updates.
    pub fn update_count(&self) -> usize {
        self.state.read().unwrap().update_count
    }

    /// Number of successful restores (inverse writes).
    pub fn restore_count(&self) -> usize {
        self.state.read().unwrap().restore_count
    }
}

#[async_trait]
impl ArticleResource for InMemoryArticleResource {
    async fn get_article(&self, id: ArticleId) -> Result<Option<ArticleRecord>> {
        let state = self.state.read().unwrap();
        Ok(state.articles.get(&id).cloned())
    }

    async fn update_article(&self, id: ArticleId, update: ArticleUpdate) -> Result<ArticleRecord> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_update {
            return Err(ResourceError::WriteFailed("article service rejected the write".to_string()));
        }

        let article = state
            .articles
            .get_mut(&id)
            .ok_or_else(|| ResourceError::NotFound(format!("article {id}")))?;

        if let Some(title) = update.title {
            article.title = title;
        }
        if let Some(content) = update.content {
            article.content = content;
        }
        if let Some(category_id) = update.category_id {
            article.category_id = Some(category_id);
        }
        if let Some(summary) = update.summary {
            article.summary = Some(summary);
        }
        if let Some(tags) = update.tags {
            article.tags = tags;
        }
        article.update_time = Utc::now();
        article.version += 1;
        let updated = article.clone();
        state.update_count += 1;
        Ok(updated)
    }

    async fn restore_article(&self, id: ArticleId, snapshot: ArticleSnapshot) -> Result<()> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_restore {
            return Err(ResourceError::WriteFailed("article service rejected the restore".to_string()));
        }

        let article = state
            .articles
            .get_mut(&id)
            .ok_or_else(|| ResourceError::NotFound(format!("article {id}")))?;

        article.title = snapshot.title;
        article.content = snapshot.content;
        article.category_id = snapshot.category_id;
        article.summary = snapshot.summary;
        article.tags = snapshot.tags;
        article.update_time = Utc::now();
        article.version += 1;
        state.restore_count += 1;
        Ok(())
    }
}
