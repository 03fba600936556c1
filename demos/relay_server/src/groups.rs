use async_trait::async_trait;
use courier_chat::{ChatError, GroupDispatcher, Message};

/// Group fan-out lives in another service; this node only logs what it would
/// hand over.
pub struct LoggingGroups;

#[async_trait]
impl GroupDispatcher for LoggingGroups {
    async fn send(&self, message: Message) -> Result<(), ChatError> {
        tracing::info!(
            group = %message.group(),
            from = %message.from(),
            message_id = %message.id(),
            "Group message handed off"
        );
        Ok(())
    }
}
