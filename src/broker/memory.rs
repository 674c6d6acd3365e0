//! In-process topic used by tests and local runs.
//!
//! A [`MemoryTopic`] is a single-partition FIFO that can act both as a
//! [`MessageSource`] and as a [`DeadLetterPublisher`]. Every publish is
//! recorded with the (tokio) instant it happened so tests can observe
//! headers and backoff timing from outside the worker.

use super::{DeadLetterPublisher, InboundMessage, MessagePosition, MessageSource};
use crate::domain::{AttemptEnvelope, MessageHeader};
use crate::error::{AuditError, Result};
use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

/// A message written through [`DeadLetterPublisher::publish`]
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub envelope: AttemptEnvelope,
    pub at: Instant,
}

pub struct MemoryTopic {
    name: String,
    sender: mpsc::UnboundedSender<InboundMessage>,
    receiver: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    next_offset: AtomicI64,
    published: Mutex<Vec<PublishedMessage>>,
    acked: Mutex<Vec<MessagePosition>>,
    publish_down: AtomicBool,
}

impl MemoryTopic {
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            sender,
            receiver: Mutex::new(receiver),
            next_offset: AtomicI64::new(0),
            published: Mutex::new(Vec::new()),
            acked: Mutex::new(Vec::new()),
            publish_down: AtomicBool::new(false),
        }
    }

    /// Append a message as an external producer would
    pub fn produce(
        &self,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        headers: Vec<MessageHeader>,
    ) -> Result<MessagePosition> {
        let position = MessagePosition {
            topic: self.name.clone(),
            partition: 0,
            offset: self.next_offset.fetch_add(1, Ordering::SeqCst),
        };

        self.sender
            .send(InboundMessage {
                key,
                payload,
                headers,
                position: position.clone(),
            })
            .map_err(|_| AuditError::Internal(format!("topic {} is closed", self.name)))?;
        Ok(position)
    }

    /// Append a keyless message without headers
    pub fn push(&self, payload: impl Into<Vec<u8>>) -> Result<MessagePosition> {
        self.produce(None, Some(payload.into()), Vec::new())
    }

    /// Make subsequent publishes fail as if the broker were unreachable
    pub fn set_publish_down(&self, down: bool) {
        self.publish_down.store(down, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    pub async fn acked(&self) -> Vec<MessagePosition> {
        self.acked.lock().await.clone()
    }

    /// Messages appended so far, published and produced alike
    pub fn produced(&self) -> i64 {
        self.next_offset.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for MemoryTopic {
    async fn recv(&self) -> Result<InboundMessage> {
        self.receiver
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| AuditError::Internal(format!("topic {} is closed", self.name)))
    }

    async fn ack(&self, message: &InboundMessage) -> Result<()> {
        self.acked.lock().await.push(message.position.clone());
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DeadLetterPublisher for MemoryTopic {
    async fn publish(&self, envelope: &AttemptEnvelope) -> Result<()> {
        if self.publish_down.load(Ordering::SeqCst) {
            return Err(AuditError::Kafka(KafkaError::MessageProduction(
                RDKafkaErrorCode::BrokerTransportFailure,
            )));
        }

        self.published.lock().await.push(PublishedMessage {
            envelope: envelope.clone(),
            at: Instant::now(),
        });
        self.produce(
            envelope.key.clone(),
            envelope.payload.clone(),
            envelope.headers.clone(),
        )?;
        Ok(())
    }
}
