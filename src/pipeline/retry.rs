//! Dead-letter retry worker
//!
//! Re-attempts persistence of dead-lettered events. A failed attempt either
//! sleeps `initial_backoff * 2^attempts` and republishes the event with
//! `x-attempts + 1`, or, once the budget is spent, parks it for manual
//! remediation. The worker keeps no state between messages.

use super::{pause, persist, settle, Disposition, READ_ERROR_PAUSE, STRANDED_PAUSE};
use crate::broker::{DeadLetterPublisher, InboundMessage, MessageSource};
use crate::config::RetryConfig;
use crate::coordination::ShutdownToken;
use crate::domain::AttemptEnvelope;
use crate::services::LoopMetrics;
use crate::store::{AuditSink, ParkingStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Attempt budget and backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Persistence attempts made by the retry worker before parking
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Delay before republishing a message that has failed `attempts` times
    /// before this one. Strictly exponential, no jitter, no cap; saturates at
    /// `Duration::MAX` once the product no longer fits.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        2u32.checked_pow(attempts)
            .and_then(|factor| self.initial_backoff.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// True when the attempt that just failed was the last one allowed
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts.saturating_add(1) >= self.max_attempts
    }
}

pub struct RetryWorker {
    source: Arc<dyn MessageSource>,
    sink: Arc<dyn AuditSink>,
    dead_letters: Arc<dyn DeadLetterPublisher>,
    parking: Arc<dyn ParkingStore>,
    policy: RetryPolicy,
    metrics: Arc<LoopMetrics>,
}

impl RetryWorker {
    pub fn new(
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn AuditSink>,
        dead_letters: Arc<dyn DeadLetterPublisher>,
        parking: Arc<dyn ParkingStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            source,
            sink,
            dead_letters,
            parking,
            policy,
            metrics: Arc::new(LoopMetrics::new("retry")),
        }
    }

    pub fn metrics(&self) -> Arc<LoopMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Consume the dead-letter topic until the token fires
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        self.metrics.set_running(true);
        info!(
            "Retry worker started (max_attempts: {}, initial_backoff: {:?})",
            self.policy.max_attempts, self.policy.initial_backoff
        );

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.source.recv() => received,
            };

            match received {
                Ok(message) => {
                    self.metrics.inc_received();
                    let mut disposition = self.handle(&message, &mut shutdown).await;
                    while disposition == Disposition::Stranded {
                        warn!(
                            "Holding {} until it can be republished or parked",
                            message.position
                        );
                        if !pause(STRANDED_PAUSE, &mut shutdown).await {
                            break;
                        }
                        disposition = self.handle(&message, &mut shutdown).await;
                    }

                    settle(self.source.as_ref(), &message, disposition, &self.metrics).await;
                    if !disposition.is_resolved() {
                        break;
                    }
                }
                Err(e) => {
                    self.metrics.inc_read_errors();
                    error!("Failed to read from dead-letter topic: {}", e);
                    if !pause(READ_ERROR_PAUSE, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.source.shutdown().await {
            warn!("Failed to commit dead-letter offsets on shutdown: {}", e);
        }
        self.metrics.set_running(false);
        self.metrics.log_status();
        info!("Retry worker stopped");
    }

    /// Decide the fate of one dead-lettered message, sleeping through the
    /// backoff when a retry is due. Does not touch the read position.
    pub async fn handle(
        &self,
        message: &InboundMessage,
        shutdown: &mut ShutdownToken,
    ) -> Disposition {
        let envelope = message.envelope();
        let attempts = envelope.attempts();
        let attempt = attempts.saturating_add(1);

        let error = match persist(self.sink.as_ref(), message.body()).await {
            Ok(evt_type) => {
                info!(
                    "Audited {} from {} after {} failed attempts",
                    evt_type, message.position, attempts
                );
                return Disposition::Persisted;
            }
            Err(e) => e,
        };

        if self.policy.is_exhausted(attempts) {
            warn!(
                kind = error.kind(),
                "Attempt {}/{} failed for {}: {}; parking event",
                attempt,
                self.policy.max_attempts,
                message.position,
                error
            );
            return self.park_exhausted(message, &envelope, shutdown).await;
        }

        let delay = self.policy.backoff_for(attempts);
        warn!(
            kind = error.kind(),
            "Attempt {}/{} failed for {}: {}; retrying in {:?}",
            attempt,
            self.policy.max_attempts,
            message.position,
            error,
            delay
        );

        if !pause(delay, shutdown).await {
            info!(
                "Shutdown during backoff; {} left for redelivery",
                message.position
            );
            return Disposition::Deferred;
        }

        let next = envelope.next_attempt();
        match self.dead_letters.publish(&next).await {
            Ok(()) => Disposition::Rescheduled {
                attempts: next.attempts(),
            },
            Err(e) => {
                error!(
                    "Republish failed for {}: {}; parking event",
                    message.position, e
                );
                self.park(message, envelope.payload.as_deref(), attempt).await
            }
        }
    }

    /// Park after the final attempt. If parking itself fails, wait and put
    /// the envelope back unchanged so the event is not dropped.
    async fn park_exhausted(
        &self,
        message: &InboundMessage,
        envelope: &AttemptEnvelope,
        shutdown: &mut ShutdownToken,
    ) -> Disposition {
        let attempts = envelope.attempts();
        let disposition = self
            .park(message, envelope.payload.as_deref(), attempts.saturating_add(1))
            .await;
        if disposition != Disposition::Stranded {
            return disposition;
        }

        if !pause(self.policy.backoff_for(attempts), shutdown).await {
            return Disposition::Deferred;
        }

        match self.dead_letters.publish(envelope).await {
            Ok(()) => {
                warn!(
                    "Requeued {} with attempts={} after parking failure",
                    message.position, attempts
                );
                Disposition::Requeued { attempts }
            }
            Err(e) => {
                error!(
                    "Requeue failed for {}: {}; leaving offset uncommitted",
                    message.position, e
                );
                Disposition::Stranded
            }
        }
    }

    async fn park(
        &self,
        message: &InboundMessage,
        payload: Option<&[u8]>,
        attempts: u32,
    ) -> Disposition {
        match self.parking.park(payload, attempts).await {
            Ok(()) => {
                warn!(
                    "Parked event from {} after {} attempts",
                    message.position, attempts
                );
                Disposition::Parked { attempts }
            }
            Err(e) => {
                error!("Parking failed for {}: {}", message.position, e);
                Disposition::Stranded
            }
        }
    }
}
