//! Chat envelope exchanged between clients and the delivery core.

use std::fmt;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Content carried by control frames acknowledging a delivered message.
pub const ACK_CONTENT: &str = "sent";

bitflags! {
    /// Kinds of envelope content. A message is expected to carry a single flag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContentType: u8 {
        const ACK = 0x1;
        const TEXT = 0x2;
        const MEDIA = 0x4;
        const STATUS = 0x8;
        const ERROR = 0x80;
    }
}

impl ContentType {
    /// Name of the first declared flag contained in `self`, or `""` if none.
    pub fn as_str(&self) -> &'static str {
        self.iter_names().next().map(|(name, _)| name).unwrap_or("")
    }

    /// Parses a wire name such as `"ACK"`.
    pub fn parse(name: &str) -> Option<Self> {
        Self::from_name(name.trim())
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserStatus {
    Online,
    Offline,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable chat envelope.
///
/// Fields decode leniently (absent fields become empty) so that a malformed
/// client envelope reaches [`Message::validate`] and can be answered with an
/// `ERROR` frame instead of being treated as a broken transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    to: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    group: String,
    #[serde(default)]
    date: Option<DateTime<Utc>>,
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    content: String,
}

impl Message {
    /// Builds and validates a client message stamped with the current time.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        group: impl Into<String>,
        content_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let from = from.into();
        let date = Utc::now();
        let message = Self {
            id: message_id(&from, &date),
            from,
            to: to.into(),
            group: group.into(),
            date: Some(date),
            content_type: content_type.into(),
            content: content.into(),
        };
        message.validate()?;
        Ok(message)
    }

    /// System generated frame answering the message identified by `id`.
    /// Control frames have no sender and are not validated.
    pub fn control(
        id: impl Into<String>,
        to: impl Into<String>,
        content_type: ContentType,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            from: String::new(),
            to: to.into(),
            group: String::new(),
            date: Some(Utc::now()),
            content_type: content_type.as_str().to_owned(),
            content: content.into(),
        }
    }

    pub fn ack(id: impl Into<String>, to: impl Into<String>) -> Self {
        Self::control(id, to, ContentType::ACK, ACK_CONTENT)
    }

    pub fn error(id: impl Into<String>, to: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::control(id, to, ContentType::ERROR, reason)
    }

    /// Checks required fields in order: id, from, to/group, date, content
    /// type, content. Setting both `to` and `group` is accepted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if is_blank(&self.id) {
            return Err(ValidationError::MissingId);
        }
        if is_blank(&self.from) {
            return Err(ValidationError::MissingFrom);
        }
        if is_blank(&self.to) && !self.is_group_message() {
            return Err(ValidationError::MissingRecipient);
        }
        if self.date.is_none() {
            return Err(ValidationError::MissingDate);
        }
        if is_blank(&self.content_type) {
            return Err(ValidationError::MissingContentType);
        }
        if is_blank(&self.content) {
            return Err(ValidationError::MissingContent);
        }
        Ok(())
    }

    pub fn is_group_message(&self) -> bool {
        !is_blank(&self.group)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.date
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// The content type as a known flag, if the wire name is one.
    pub fn kind(&self) -> Option<ContentType> {
        ContentType::parse(&self.content_type)
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Hex SHA-256 of the sender and the second the message was created. Two
/// messages from one sender within the same second share an id.
pub fn message_id(from: &str, at: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(from.as_bytes());
    hasher.update(at.timestamp().to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}
