//! Message broker seam
//!
//! - [`MessageSource`]: one consumer-group subscription with explicit
//!   acknowledgement of resolved messages
//! - [`DeadLetterPublisher`]: producer bound to the dead-letter topic
//!
//! [`kafka`] talks to a real cluster; [`memory`] keeps topics in process.

pub mod kafka;
pub mod memory;

pub use kafka::{KafkaDeadLetterPublisher, KafkaSource};
pub use memory::MemoryTopic;

use crate::domain::{AttemptEnvelope, MessageHeader};
use crate::error::Result;
use async_trait::async_trait;

/// Where a message sits in its topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl std::fmt::Display for MessagePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// Message received from a topic, bytes untouched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub key: Option<Vec<u8>>,
    /// `None` for a tombstone record
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<MessageHeader>,
    pub position: MessagePosition,
}

impl InboundMessage {
    /// Body to parse; a tombstone reads as empty and fails parsing
    pub fn body(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }

    /// Dead-letter view of this message, carrying every received header
    pub fn envelope(&self) -> AttemptEnvelope {
        AttemptEnvelope::from_parts(self.key.clone(), self.payload.clone(), self.headers.clone())
    }
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next message
    async fn recv(&self) -> Result<InboundMessage>;

    /// Mark a message as resolved so its offset can be committed
    async fn ack(&self, message: &InboundMessage) -> Result<()>;

    /// Flush acknowledged positions before the loop exits
    async fn shutdown(&self) -> Result<()>;
}

#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publish and wait for the broker to confirm the write
    async fn publish(&self, envelope: &AttemptEnvelope) -> Result<()>;
}
