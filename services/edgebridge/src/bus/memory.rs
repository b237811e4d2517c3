//! In-process message bus
//!
//! Records every publication and lets tests inject inbound messages. Used by
//! the integration tests and by `--validate` style dry runs.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use super::{BusError, BusEvent, InboundMessage, MessageBus};

/// One recorded publication
#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Published {
    /// Payload parsed as JSON, `Null` if it is not JSON
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    published: Vec<Published>,
    fail_publishes: bool,
}

/// Recording bus; clones share the same log
#[derive(Debug, Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<MemoryState>>,
    published: Arc<Notify>,
    inbound: mpsc::UnboundedSender<BusEvent>,
}

impl MemoryBus {
    /// Create the bus and the event stream the gateway consumes
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BusEvent>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(Mutex::new(MemoryState::default())),
                published: Arc::new(Notify::new()),
                inbound,
            },
            rx,
        )
    }

    /// Deliver a message as if it arrived from the broker
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let _ = self
            .inbound
            .send(BusEvent::Message(InboundMessage::new(topic, payload)));
    }

    pub fn inject_json(&self, topic: &str, payload: &Value) {
        self.inject(topic, payload.to_string());
    }

    /// Signal a (re)connection
    pub fn connect(&self) {
        let _ = self.inbound.send(BusEvent::Connected);
    }

    /// Make every following publish fail
    pub fn fail_publishes(&self, fail: bool) {
        self.state.lock().fail_publishes = fail;
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().published.clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<Published> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    /// Wait until at least `count` messages were published on `topic`
    pub async fn wait_for(&self, topic: &str, count: usize) -> Vec<Published> {
        loop {
            let notified = self.published.notified();
            let matching = self.published_on(topic);
            if matching.len() >= count {
                return matching;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError> {
        {
            let mut state = self.state.lock();
            if state.fail_publishes {
                return Err(BusError::Publish {
                    topic: topic.to_string(),
                    reason: "memory bus set to fail".to_string(),
                });
            }
            state.published.push(Published {
                topic: topic.to_string(),
                payload,
                retain,
            });
        }
        self.published.notify_waiters();
        Ok(())
    }
}
