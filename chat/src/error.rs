use std::io;

/// A required envelope field is missing. Variants are listed in the order
/// [`Message::validate`](crate::Message::validate) checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message id is required")]
    MissingId,
    #[error("message sender is required")]
    MissingFrom,
    #[error("message recipient or group is required")]
    MissingRecipient,
    #[error("message date is required")]
    MissingDate,
    #[error("message content type is required")]
    MissingContentType,
    #[error("message content is required")]
    MissingContent,
}

/// Framing, decoding or socket failure. Always fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("frame exceeds the maximum length")]
    FrameTooLong,
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("event bus closed")]
    Closed,
    #[error("event encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("connection of {connection} tried to send as {claimed}")]
    Spoofing { connection: String, claimed: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("dispatch loop is not accepting commands")]
    ClosedChannel,
    #[error(transparent)]
    Persistence(#[from] RepositoryError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("observer: {0}")]
    Observer(String),
    #[error("request timed out")]
    Timeout,
}

impl ChatError {
    /// True when the connection that produced the error can no longer be used.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Short stable name, used as the kind of published error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Spoofing { .. } => "spoofing",
            Self::Transport(_) => "transport",
            Self::ClosedChannel => "closed_channel",
            Self::Persistence(_) => "persistence",
            Self::Bus(_) => "bus",
            Self::Observer(_) => "observer",
            Self::Timeout => "timeout",
        }
    }
}

impl From<io::Error> for ChatError {
    fn from(value: io::Error) -> Self {
        Self::Transport(TransportError::Io(value))
    }
}
