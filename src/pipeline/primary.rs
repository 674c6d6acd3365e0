//! Main-topic consumer
//!
//! Single pass per message: audit it, or hand the original bytes to the
//! dead-letter topic and move on. There is no retry here, so one poisoned
//! message never stalls the live stream.

use super::{pause, persist, settle, Disposition, READ_ERROR_PAUSE, STRANDED_PAUSE};
use crate::broker::{DeadLetterPublisher, InboundMessage, MessageSource};
use crate::coordination::ShutdownToken;
use crate::domain::AttemptEnvelope;
use crate::services::LoopMetrics;
use crate::store::{AuditSink, ParkingStore};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct PrimaryConsumer {
    source: Arc<dyn MessageSource>,
    sink: Arc<dyn AuditSink>,
    dead_letters: Arc<dyn DeadLetterPublisher>,
    parking: Arc<dyn ParkingStore>,
    metrics: Arc<LoopMetrics>,
}

impl PrimaryConsumer {
    pub fn new(
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn AuditSink>,
        dead_letters: Arc<dyn DeadLetterPublisher>,
        parking: Arc<dyn ParkingStore>,
    ) -> Self {
        Self {
            source,
            sink,
            dead_letters,
            parking,
            metrics: Arc::new(LoopMetrics::new("primary")),
        }
    }

    pub fn metrics(&self) -> Arc<LoopMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Consume until the token fires. Cancellation is a clean exit.
    pub async fn run(&self, mut shutdown: ShutdownToken) {
        self.metrics.set_running(true);
        info!("Primary consumer started");

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.source.recv() => received,
            };

            match received {
                Ok(message) => {
                    self.metrics.inc_received();
                    let mut disposition = self.handle(&message).await;
                    while disposition == Disposition::Stranded {
                        warn!(
                            "Holding {} until it can be dead-lettered or parked",
                            message.position
                        );
                        if !pause(STRANDED_PAUSE, &mut shutdown).await {
                            break;
                        }
                        disposition = self.handle(&message).await;
                    }

                    settle(self.source.as_ref(), &message, disposition, &self.metrics).await;
                    if !disposition.is_resolved() {
                        break;
                    }
                }
                Err(e) => {
                    self.metrics.inc_read_errors();
                    error!("Failed to read from main topic: {}", e);
                    if !pause(READ_ERROR_PAUSE, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.source.shutdown().await {
            warn!("Failed to commit main-topic offsets on shutdown: {}", e);
        }
        self.metrics.set_running(false);
        self.metrics.log_status();
        info!("Primary consumer stopped");
    }

    /// Decide the fate of one message. Does not touch the read position.
    pub async fn handle(&self, message: &InboundMessage) -> Disposition {
        let error = match persist(self.sink.as_ref(), message.body()).await {
            Ok(evt_type) => {
                debug!("Audited {} from {}", evt_type, message.position);
                return Disposition::Persisted;
            }
            Err(e) => e,
        };

        warn!(
            kind = error.kind(),
            "Dead-lettering event from {}: {}", message.position, error
        );

        let envelope = AttemptEnvelope::first_entry(message.key.clone(), message.payload.clone());
        match self.dead_letters.publish(&envelope).await {
            Ok(()) => Disposition::DeadLettered,
            Err(e) => {
                error!(
                    "Dead-letter publish failed for {}: {}; parking event",
                    message.position, e
                );
                self.park_fallback(message).await
            }
        }
    }

    async fn park_fallback(&self, message: &InboundMessage) -> Disposition {
        match self.parking.park(message.payload.as_deref(), 1).await {
            Ok(()) => {
                warn!("Parked event from {} after 1 attempt", message.position);
                Disposition::Parked { attempts: 1 }
            }
            Err(e) => {
                error!(
                    "Parking failed for {}: {}; leaving offset uncommitted",
                    message.position, e
                );
                Disposition::Stranded
            }
        }
    }
}
