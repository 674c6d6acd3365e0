//! Kafka adapters built on rdkafka
//!
//! Offsets follow the at-least-once pattern: auto-commit is on, but the
//! automatic offset store is off, so only positions passed to
//! [`MessageSource::ack`] are ever committed.

use super::{DeadLetterPublisher, InboundMessage, MessagePosition, MessageSource};
use crate::config::KafkaConfig;
use crate::domain::{AttemptEnvelope, MessageHeader};
use crate::error::{AuditError, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tracing::{debug, info};

fn base_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", config.broker_list().join(","));
    client
}

/// Consumer-group subscription to a single topic
pub struct KafkaSource {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaSource {
    /// Create the consumer, probe the cluster and subscribe.
    ///
    /// Fails when the broker cannot be reached within
    /// `metadata_timeout_ms`, so a misconfigured process exits at boot.
    pub async fn connect(config: &KafkaConfig, group_id: &str, topic: &str) -> Result<Self> {
        let consumer: StreamConsumer = base_client_config(config)
            .set("group.id", group_id)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                config.auto_commit_interval_ms.to_string(),
            )
            // Offsets are stored only once a message's fate is resolved
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()?;

        let probe_topic = topic.to_string();
        let timeout = config.metadata_timeout();
        let consumer = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(Some(&probe_topic), timeout)
                .map(|_| consumer)
        })
        .await
        .map_err(|e| AuditError::Internal(format!("metadata probe panicked: {e}")))??;

        consumer.subscribe(&[topic])?;
        info!("Subscribed to {} (group: {})", topic, group_id);

        Ok(Self {
            consumer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn recv(&self) -> Result<InboundMessage> {
        let msg = self.consumer.recv().await?;

        let headers = msg
            .headers()
            .map(|hs| {
                hs.iter()
                    .map(|h| MessageHeader {
                        key: h.key.to_string(),
                        value: h.value.map(<[u8]>::to_vec),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(InboundMessage {
            key: msg.key().map(<[u8]>::to_vec),
            payload: msg.payload().map(<[u8]>::to_vec),
            headers,
            position: MessagePosition {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
            },
        })
    }

    async fn ack(&self, message: &InboundMessage) -> Result<()> {
        let position = &message.position;
        // The committed offset is the next one to read
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            &position.topic,
            position.partition,
            Offset::Offset(position.offset + 1),
        )?;
        self.consumer.store_offsets(&tpl)?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => {
                info!("Committed consumer offsets for {}", self.topic);
                Ok(())
            }
            // Nothing stored since the last auto-commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {
                debug!("No pending offsets to commit for {}", self.topic);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Producer writing to the dead-letter topic with `acks=all`
pub struct KafkaDeadLetterPublisher {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl KafkaDeadLetterPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = base_client_config(config)
            .set("acks", "all")
            .set("message.timeout.ms", config.send_timeout_ms.to_string())
            .create()?;

        Ok(Self {
            producer,
            topic: config.dead_letter_topic.clone(),
            send_timeout: config.send_timeout(),
        })
    }
}

#[async_trait]
impl DeadLetterPublisher for KafkaDeadLetterPublisher {
    async fn publish(&self, envelope: &AttemptEnvelope) -> Result<()> {
        let mut headers = OwnedHeaders::new();
        for header in &envelope.headers {
            headers = headers.insert(Header {
                key: header.key.as_str(),
                value: header.value.as_deref(),
            });
        }

        let mut record = FutureRecord::<[u8], [u8]>::to(&self.topic).headers(headers);
        if let Some(payload) = envelope.payload.as_deref() {
            record = record.payload(payload);
        }
        if let Some(key) = envelope.key.as_deref() {
            record = record.key(key);
        }

        let (partition, offset) = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| AuditError::Kafka(e))?;

        debug!(
            "Published to {}[{}]@{} (attempts: {})",
            self.topic,
            partition,
            offset,
            envelope.attempts()
        );
        Ok(())
    }
}
