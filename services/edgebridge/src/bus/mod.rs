//! Message bus boundary
//!
//! The gateway talks to the outside world only through [`MessageBus`].
//! Delivery itself belongs to the bus client. Inbound messages arrive on an
//! mpsc channel handed out when the bus is created.

pub mod memory;
pub mod messages;
pub mod mqtt;
pub mod topics;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{MemoryBus, Published};
pub use mqtt::MqttBus;
pub use topics::Topics;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("not connected to broker")]
    NotConnected,

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// A raw message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Bus events delivered to the gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// (Re)connected to the broker; subscriptions are in place
    Connected,
    Message(InboundMessage),
}

/// Outbound side of the message bus
#[async_trait]
pub trait MessageBus: Send + Sync + std::fmt::Debug {
    /// Publish `payload` on `topic`
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BusError>;

    /// Leave the broker cleanly
    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}
