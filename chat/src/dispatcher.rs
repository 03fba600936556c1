//! Single funnel for asynchronous failures.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::EventBus;
use crate::error::ChatError;

/// Payload published on the error topic, keyed by error kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

pub struct ErrorDispatcher {
    bus: Arc<dyn EventBus>,
    topic: String,
}

impl ErrorDispatcher {
    pub fn new(bus: Arc<dyn EventBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
        }
    }

    /// Logs `error` and publishes it. Never fails.
    pub async fn send(&self, error: ChatError) {
        let kind = error.kind();
        match &error {
            ChatError::Spoofing { .. } | ChatError::Transport(_) => {
                tracing::warn!(kind, error = %error, "Connection error")
            }
            _ => tracing::error!(kind, error = %error, "Delivery error"),
        }

        let event = ErrorEvent {
            kind: kind.to_owned(),
            message: error.to_string(),
            at: Utc::now(),
        };
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode error event");
                return;
            }
        };
        if let Err(e) = self.bus.dispatch(&self.topic, kind, payload).await {
            tracing::warn!(error = %e, "Failed to publish error event");
        }
    }
}
