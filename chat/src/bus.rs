//! Event bus boundary used to propagate presence changes and errors to other
//! services, with a process-local implementation.

use std::sync::Arc;

use async_trait::async_trait;
use courier_rt::sync::broadcast;
use courier_rt::{self as rt, CancellationToken};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::BusError;

const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub key: String,
    pub value: Vec<u8>,
}

pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn dispatch(&self, topic: &str, key: &str, value: Vec<u8>) -> Result<(), BusError>;

    /// Delivers every event published on `topic` to `callback` until
    /// `cancellation_token` is cancelled.
    async fn subscribe(
        &self,
        cancellation_token: CancellationToken,
        group_id: &str,
        topic: &str,
        callback: EventCallback,
    ) -> Result<(), BusError>;
}

/// In-process bus: one broadcast channel per topic. Publishing with no
/// subscribers succeeds and the event is dropped.
#[derive(Debug)]
pub struct LocalBus {
    topics: DashMap<String, broadcast::Sender<Event>>,
    cancellation_token: CancellationToken,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self {
            topics: DashMap::new(),
            cancellation_token: CancellationToken::new(),
        }
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ends every subscription and rejects further dispatches.
    pub fn close(&self) {
        self.cancellation_token.cancel();
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Event> {
        self.topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for LocalBus {
    async fn dispatch(&self, topic: &str, key: &str, value: Vec<u8>) -> Result<(), BusError> {
        if self.cancellation_token.is_cancelled() {
            return Err(BusError::Closed);
        }
        let event = Event {
            topic: topic.to_owned(),
            key: key.to_owned(),
            value,
        };
        if self.sender(topic).send(event).is_err() {
            tracing::trace!(topic, "No subscribers for event");
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        cancellation_token: CancellationToken,
        group_id: &str,
        topic: &str,
        callback: EventCallback,
    ) -> Result<(), BusError> {
        if self.cancellation_token.is_cancelled() {
            return Err(BusError::Closed);
        }
        let mut rx = self.sender(topic).subscribe();
        let bus_token = self.cancellation_token.clone();
        let group_id = group_id.to_owned();
        let topic = topic.to_owned();
        rt::spawn(async move {
            loop {
                let received = rt::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = bus_token.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(group_id = %group_id, topic = %topic, skipped, "Subscriber lagging, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!(group_id = %group_id, topic = %topic, "Subscription ended");
        });
        Ok(())
    }
}
