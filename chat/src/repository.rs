//! Persistence boundary for presence rows, queued offline messages and block
//! lists, plus an in-memory implementation for single-node use and tests.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::{ChatError, RepositoryError};
use crate::message::Message;
use crate::router::OfflineDispatcher;

/// Presence row: which node holds the user's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserOnline {
    pub user_id: String,
    pub host: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn add_user_online(
        &self,
        user_id: &str,
        host: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn delete_user_online(&self, user_id: &str) -> Result<(), RepositoryError>;

    /// `None` when the user is not connected to any node.
    async fn get_user_online(&self, user_id: &str) -> Result<Option<UserOnline>, RepositoryError>;

    /// Takes the messages queued for `user_id` while it was offline.
    async fn get_messages_offline(&self, user_id: &str) -> Result<Vec<Message>, RepositoryError>;

    /// Whether `user_id` has blocked `blocked_id`.
    async fn is_blocked_user(&self, user_id: &str, blocked_id: &str)
        -> Result<bool, RepositoryError>;
}

#[derive(Debug, Default)]
pub struct MemoryRepository {
    online: DashMap<String, UserOnline>,
    offline: DashMap<String, Vec<Message>>,
    blocked: DashMap<String, HashSet<String>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_offline(&self, message: Message) {
        self.offline
            .entry(message.to().to_owned())
            .or_default()
            .push(message);
    }

    pub fn queued_for(&self, user_id: &str) -> usize {
        self.offline.get(user_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn block(&self, user_id: &str, blocked_id: &str) {
        self.blocked
            .entry(user_id.to_owned())
            .or_default()
            .insert(blocked_id.to_owned());
    }

    pub fn unblock(&self, user_id: &str, blocked_id: &str) {
        if let Some(mut blocked) = self.blocked.get_mut(user_id) {
            blocked.remove(blocked_id);
        }
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn add_user_online(
        &self,
        user_id: &str,
        host: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        self.online.insert(
            user_id.to_owned(),
            UserOnline {
                user_id: user_id.to_owned(),
                host: host.to_owned(),
                created_at,
            },
        );
        Ok(())
    }

    async fn delete_user_online(&self, user_id: &str) -> Result<(), RepositoryError> {
        self.online.remove(user_id);
        Ok(())
    }

    async fn get_user_online(&self, user_id: &str) -> Result<Option<UserOnline>, RepositoryError> {
        Ok(self.online.get(user_id).map(|row| row.clone()))
    }

    async fn get_messages_offline(&self, user_id: &str) -> Result<Vec<Message>, RepositoryError> {
        Ok(self
            .offline
            .remove(user_id)
            .map(|(_, queue)| queue)
            .unwrap_or_default())
    }

    async fn is_blocked_user(
        &self,
        user_id: &str,
        blocked_id: &str,
    ) -> Result<bool, RepositoryError> {
        Ok(self
            .blocked
            .get(user_id)
            .map(|blocked| blocked.contains(blocked_id))
            .unwrap_or(false))
    }
}

/// Single-node offline delivery: park the message until its recipient
/// connects again.
#[async_trait]
impl OfflineDispatcher for MemoryRepository {
    async fn send(&self, message: Message) -> Result<(), ChatError> {
        tracing::debug!(user_id = %message.to(), message_id = %message.id(), "Queued offline message");
        self.queue_offline(message);
        Ok(())
    }
}
