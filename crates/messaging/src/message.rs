//! Message payloads for the article-update topic.

use chrono::{DateTime, Utc};
use common::{ArticleId, TransactionId, UserId};
use serde::{Deserialize, Serialize};

/// Topic carrying article-update messages.
pub const ARTICLE_UPDATE_TOPIC: &str = "article-update";

/// Tag for plain update messages on the topic.
pub const ARTICLE_UPDATE_TAG: &str = "update";

/// Business payload of one article update, produced alongside the
/// user's last-login write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleUpdateMessage {
    pub user_id: UserId,
    pub article_id: ArticleId,
    pub title: Option<String>,
    pub content: Option<String>,
    pub category_id: Option<u64>,
    pub summary: Option<String>,
    pub tags: Vec<String>,
    pub operation_type: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ArticleUpdateMessage {
    /// Creates a message with the required identifiers and defaults for
    /// everything else.
    pub fn new(user_id: UserId, article_id: ArticleId) -> Self {
        Self {
            user_id,
            article_id,
            title: None,
            content: None,
            category_id: None,
            summary: None,
            tags: Vec::new(),
            operation_type: "UPDATE_ARTICLE".to_string(),
            client_ip: None,
            user_agent: None,
            timestamp: Utc::now(),
        }
    }
}

/// A prepared (half) message: staged at the broker but invisible to
/// consumers until the producer's decision arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HalfMessage {
    pub transaction_id: TransactionId,
    pub topic: String,
    pub tag: String,
    pub body: serde_json::Value,
}

impl HalfMessage {
    /// Wraps an article-update payload under the given transaction id.
    pub fn article_update(
        transaction_id: TransactionId,
        body: serde_json::Value,
    ) -> Self {
        Self {
            transaction_id,
            topic: ARTICLE_UPDATE_TOPIC.to_string(),
            tag: ARTICLE_UPDATE_TAG.to_string(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_defaults() {
        let message = ArticleUpdateMessage::new(UserId::new(1), ArticleId::new(5));
        assert_eq!(message.operation_type, "UPDATE_ARTICLE");
        assert!(message.title.is_none());
        assert!(message.tags.is_empty());
    }

    #[test]
    fn half_message_carries_topic_and_tag() {
        let half = HalfMessage::article_update(TransactionId::new(), serde_json::json!({}));
        assert_eq!(half.topic, ARTICLE_UPDATE_TOPIC);
        assert_eq!(half.tag, ARTICLE_UPDATE_TAG);
    }
}
