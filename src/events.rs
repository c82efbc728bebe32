use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{LatencySample, ScanResult};

/// Buffered events per subscriber before a slow one starts losing the oldest.
pub const CHANNEL_CAPACITY: usize = 256;

/// A notification pushed to live viewers.
///
/// Serialises as `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
    Status(String),
    Result(Box<ScanResult>),
    Error(String),
    Latency(LatencySample),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Status(_) => "status",
            Event::Result(_) => "result",
            Event::Error(_) => "error",
            Event::Latency(_) => "latency",
        }
    }
}

/// Fan-out of [`Event`]s to every current subscriber.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// dropped, and a subscriber that joins late only sees what comes after.
#[derive(Debug, Clone)]
pub struct EventChannel {
    tx: broadcast::Sender<Arc<Event>>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        let name = event.name();
        match self.tx.send(Arc::new(event)) {
            Ok(n) => trace!(event = name, subscribers = n, "published"),
            Err(_) => trace!(event = name, "published with no subscribers"),
        }
    }

    pub fn status(&self, message: impl Into<String>) {
        self.publish(Event::Status(message.into()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}
