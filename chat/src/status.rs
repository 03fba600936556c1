//! Presence transitions: persisted first, announced second.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::EventBus;
use crate::error::ChatError;
use crate::message::UserStatus;
use crate::repository::Repository;

/// Payload published on the presence topic, keyed by user id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: String,
    pub host: String,
    pub status: UserStatus,
    pub at: DateTime<Utc>,
}

pub struct StatusManager {
    repository: Arc<dyn Repository>,
    bus: Arc<dyn EventBus>,
    topic: String,
}

impl StatusManager {
    pub fn new(
        repository: Arc<dyn Repository>,
        bus: Arc<dyn EventBus>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            repository,
            bus,
            topic: topic.into(),
        }
    }

    /// Records the transition keyed by `host`, so other nodes can tell where
    /// the socket lives, then publishes it. A persistence failure aborts the
    /// change; a publish failure is only logged.
    pub async fn handle_status(
        &self,
        user_id: &str,
        host: &str,
        status: UserStatus,
    ) -> Result<(), ChatError> {
        let at = Utc::now();
        match status {
            UserStatus::Online => self.repository.add_user_online(user_id, host, at).await?,
            UserStatus::Offline => self.repository.delete_user_online(user_id).await?,
        }
        tracing::info!(user_id = %user_id, host = %host, status = %status, "Presence changed");

        let event = PresenceEvent {
            user_id: user_id.to_owned(),
            host: host.to_owned(),
            status,
            at,
        };
        let published = match serde_json::to_vec(&event) {
            Ok(payload) => self
                .bus
                .dispatch(&self.topic, user_id, payload)
                .await
                .map_err(ChatError::from),
            Err(e) => Err(ChatError::Bus(e.into())),
        };
        if let Err(e) = published {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to publish presence event");
        }
        Ok(())
    }
}
