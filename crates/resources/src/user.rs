//! User resource trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::UserId;
use serde::{Deserialize, Serialize};

use crate::error::{ResourceError, Result};

/// A user record as exposed by the user service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub last_login_time: Option<DateTime<Utc>>,
    pub update_time: DateTime<Utc>,
    /// Monotonic sequence number bumped by every write.
    pub version: u64,
}

/// Client-side contract of the user service.
#[async_trait]
pub trait UserResource: Send + Sync {
    /// Loads a user by id.
    async fn get_user(&self, id: UserId) -> Result<Option<UserRecord>>;

    /// Sets the user's last login time to now. Returns the updated record.
    async fn update_last_login_time(&self, id: UserId) -> Result<UserRecord>;

    /// Restores the user's last login time to an earlier value (the
    /// inverse write used by Cancel and compensation).
    async fn restore_last_login_time(
        &self,
        id: UserId,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

#[derive(Debug, Default)]
struct InMemoryUserState {
    users: HashMap<UserId, UserRecord>,
    fail_on_update: bool,
    fail_on_restore: bool,
    update_count: usize,
    restore_count: usize,
}

/// In-memory user resource for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryUserResource {
    state: Arc<RwLock<InMemoryUserState>>,
}

impl InMemoryUserResource {
    /// Creates a new empty user resource.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a user record.
    pub fn insert_user(
        &self,
        id: UserId,
        username: impl Into<String>,
        last_login_time: Option<DateTime<Utc>>,
    ) {
        let mut state = self.state.write().unwrap();
        state.users.insert(
            id,
            UserRecord {
                id,
                username: username.into(),
                last_login_time,
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

    /// Number of successful last-login updates.
    pub fn update_count(&self) -> usize {
        self.state.read().unwrap().update_count
    }

    /// Number of successful restores (inverse writes).
    pub fn restore_count(&self) -> usize {
        self.state.read().unwrap().restore_count
    }
}

#[async_trait]
impl UserResource for InMemoryUserResource {
    async fn get_user(&self, id: UserId) -> Result<Option<UserRecord>> {
        let state = self.state.read().unwrap();
        Ok(state.users.get(&id).cloned())
    }

    async fn update_last_login_time(&self, id: UserId) -> Result<UserRecord> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_update {
            return Err(ResourceError::WriteFailed("user service rejected the write".to_string()));
        }

        let user = state
            .users
            .get_mut(&id)
            .ok_or_else(|| ResourceError::NotFound(format!("user {id}")))?;

        let now = Utc::now();
        user.last_login_time = Some(now);
        user.update_time = now;
        user.version += 1;
        let updated = user.clone();
        state.update_count += 1;
        Ok(updated)
    }

    async fn restore_last_login_time(
        &self,
        id: UserId,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_restore {
            return Err(ResourceError::WriteFailed("user service rejected the restore".to_string()));
        }

        let user = state
            .users
            .get_mut(&id)
            .ok_or_else(|| ResourceError::NotFound(format!("user {id}")))?;

        user.last_login_time = timestamp;
        user.update_time = Utc::now();
        user.version += 1;
        state.restore_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_and_restore_roundtrip() {
        let resource = InMemoryUserResource::new();
        let id = UserId::new(1);
        let original = Utc::now() - chrono::Duration::days(1);
        resource.insert_user(id, "alice", Some(original));

        let updated = resource.update_last_login_time(id).await.unwrap();
        assert!(updated.last_login_time.unwrap() > original);
        assert_eq!(updated.version, 2);

        resource.restore_last_login_time(id, Some(original)).await.unwrap();
        let user = resource.get_user(id).await.unwrap().unwrap();
        assert_eq!(user.last_login_time, Some(original));
        assert_eq!(user.version, 3);
        assert_eq!(resource.restore_count(), 1);
    }

    #[tokio::test]
    async fn update_missing_user_fails() {
        let resource = InMemoryUserResource::new();
        let result = resource.update_last_login_time(UserId::new(99)).await;
        assert!(matches!(result, Err(ResourceError::NotFound(_))));
        assert_eq!(resource.update_count(), 0);
    }

    #[tokio::test]
    async fn fail_on_update_leaves_record_untouched() {
        let resource = InMemoryUserResource::new();
        let id = UserId::new(1);
        resource.insert_user(id, "alice", None);
        resource.set_fail_on_update(true);

        let result = resource.update_last_login_time(id).await;
        assert!(matches!(result, Err(ResourceError::WriteFailed(_))));

        let user = resource.get_user(id).await.unwrap().unwrap();
        assert!(user.last_login_time.is_none());
        assert_eq!(user.version, 1);
    }

    #[tokio::test]
    async fn restore_to_none_clears_login_time() {
        let resource = InMemoryUserResource::new();
        let id = UserId::new(1);
        resource.insert_user(id, "alice", None);
        resource.update_last_login_time(id).await.unwrap();

        resource.restore_last_login_time(id, None).await.unwrap();
        let user = resource.get_user(id).await.unwrap().unwrap();
        assert!(user.last_login_time.is_none());
    }
}
