//! Audit pipeline
//!
//! Two independent loops:
//! - [`PrimaryConsumer`] reads the main topic and either audits an event or
//!   forwards its original bytes to the dead-letter topic
//! - [`RetryWorker`] reads the dead-letter topic, retries with exponential
//!   backoff and parks events that exhaust their attempts
//!
//! The loops share no memory. Retry state lives in the `x-attempts` header.
//!
//! A message whose every fallback failed is retried in place: the loop does
//! not fetch past it, so no later offset is stored ahead of it.

pub mod primary;
pub mod retry;

pub use primary::PrimaryConsumer;
pub use retry::{RetryPolicy, RetryWorker};

use crate::broker::{InboundMessage, MessageSource};
use crate::coordination::ShutdownToken;
use crate::domain::ReceivedEvent;
use crate::error::Result;
use crate::services::LoopMetrics;
use crate::store::AuditSink;
use std::time::Duration;
use tracing::warn;

/// Pause after a broker read error before fetching again
pub(crate) const READ_ERROR_PAUSE: Duration = Duration::from_millis(500);

/// Pause before handling a stranded message again
pub(crate) const STRANDED_PAUSE: Duration = Duration::from_secs(1);

/// Final fate of one fetched message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Audit row written
    Persisted,
    /// Forwarded to the dead-letter topic without an attempt header
    DeadLettered,
    /// Republished to the dead-letter topic with `attempts`
    Rescheduled { attempts: u32 },
    /// Written to the parking table with `attempts`
    Parked { attempts: u32 },
    /// Parking failed; republished unchanged with `attempts`
    Requeued { attempts: u32 },
    /// Shutdown interrupted the backoff; left for redelivery
    Deferred,
    /// Every fallback failed; left for redelivery
    Stranded,
}

impl Disposition {
    /// Whether the message is safely somewhere and its offset may advance
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Disposition::Deferred | Disposition::Stranded)
    }
}

/// Parse the raw bytes and append one audit row. Returns the event type.
pub async fn persist(sink: &dyn AuditSink, raw: &[u8]) -> Result<String> {
    let received = ReceivedEvent::parse(raw)?;
    sink.insert(received.event_type(), received.raw()).await?;
    Ok(received.event_type().to_string())
}

/// Sleep unless shutdown comes first. Returns false when interrupted.
pub(crate) async fn pause(delay: Duration, shutdown: &mut ShutdownToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Count the outcome and store the offset of resolved messages
pub(crate) async fn settle(
    source: &dyn MessageSource,
    message: &InboundMessage,
    disposition: Disposition,
    metrics: &LoopMetrics,
) {
    metrics.record(disposition);
    if !disposition.is_resolved() {
        return;
    }

    if let Err(e) = source.ack(message).await {
        warn!("Failed to store offset for {}: {}", message.position, e);
    }
}
