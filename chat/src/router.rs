//! Delivery decisions for messages the dispatch loop could not hand to a live
//! connection: group fan-out, offline hand-off, and flushing queued messages
//! to a user that just connected.

use std::sync::Arc;

use async_trait::async_trait;

use crate::chat::ChatHandle;
use crate::error::ChatError;
use crate::message::Message;
use crate::repository::Repository;

/// Fans a group message out to the group's members.
#[async_trait]
pub trait GroupDispatcher: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), ChatError>;
}

/// Persists or forwards a direct message whose recipient is not connected to
/// this node.
#[async_trait]
pub trait OfflineDispatcher: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), ChatError>;
}

pub struct MessageRouter {
    repository: Arc<dyn Repository>,
    groups: Arc<dyn GroupDispatcher>,
    offline: Arc<dyn OfflineDispatcher>,
}

impl MessageRouter {
    pub fn new(
        repository: Arc<dyn Repository>,
        groups: Arc<dyn GroupDispatcher>,
        offline: Arc<dyn OfflineDispatcher>,
    ) -> Self {
        Self {
            repository,
            groups,
            offline,
        }
    }

    /// Fallback path for a message that was not written to a local connection.
    pub async fn handle_message(&self, message: Message) -> Result<(), ChatError> {
        if message.is_group_message() {
            return self.groups.send(message).await;
        }
        if self.is_blocked(&message).await? {
            return Ok(());
        }

        match self.repository.get_user_online(message.to()).await? {
            Some(online) => tracing::debug!(
                user_id = %message.to(),
                host = %online.host,
                message_id = %message.id(),
                "Recipient not connected here, handing message off"
            ),
            None => tracing::debug!(
                user_id = %message.to(),
                message_id = %message.id(),
                "Recipient offline, handing message off"
            ),
        }
        self.offline.send(message).await
    }

    /// True when the recipient of a direct message blocked its sender. Group
    /// messages are never considered blocked here.
    pub async fn is_blocked(&self, message: &Message) -> Result<bool, ChatError> {
        if message.is_group_message() {
            return Ok(false);
        }
        let blocked = self
            .repository
            .is_blocked_user(message.to(), message.from())
            .await?;
        if blocked {
            tracing::debug!(
                user_id = %message.to(),
                sender = %message.from(),
                message_id = %message.id(),
                "Dropping message from blocked sender"
            );
        }
        Ok(blocked)
    }

    /// Pushes every message queued for `user_id` back through the dispatch
    /// loop, the same path live traffic takes.
    pub async fn send_messages_offline(
        &self,
        user_id: &str,
        chat: &ChatHandle,
    ) -> Result<usize, ChatError> {
        let queued = self.repository.get_messages_offline(user_id).await?;
        let count = queued.len();
        for message in queued {
            chat.send_message(message).await?;
        }
        if count > 0 {
            tracing::debug!(user_id = %user_id, count, "Flushed offline messages");
        }
        Ok(count)
    }
}
