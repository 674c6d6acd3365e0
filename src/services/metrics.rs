use crate::pipeline::Disposition;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use tracing::info;

/// Counters for one consumer loop
///
/// Each loop owns its own instance; the health server only reads them.
pub struct LoopMetrics {
    name: &'static str,
    running: AtomicBool,
    /// Messages fetched from the topic
    pub received: AtomicU64,
    /// Events written to the audit table
    pub persisted: AtomicU64,
    /// Events forwarded to the dead-letter topic by the primary consumer
    pub dead_lettered: AtomicU64,
    /// Events republished with an incremented attempt counter
    pub rescheduled: AtomicU64,
    /// Events written to the parking table
    pub parked: AtomicU64,
    /// Events requeued unchanged because parking failed
    pub requeued: AtomicU64,
    /// Messages left unacknowledged (cancelled backoff or every path failed)
    pub unresolved: AtomicU64,
    /// Broker read errors
    pub read_errors: AtomicU64,
    consecutive_read_errors: AtomicU64,
    /// Unix millis of the last fetched message, 0 when none yet
    last_message_ms: AtomicI64,
}

/// Point-in-time copy of [`LoopMetrics`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub name: String,
    pub running: bool,
    pub received: u64,
    pub persisted: u64,
    pub dead_lettered: u64,
    pub rescheduled: u64,
    pub parked: u64,
    pub requeued: u64,
    pub unresolved: u64,
    pub read_errors: u64,
    pub consecutive_read_errors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
}

impl LoopMetrics {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
            received: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            rescheduled: AtomicU64::new(0),
            parked: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            unresolved: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            consecutive_read_errors: AtomicU64::new(0),
            last_message_ms: AtomicI64::new(0),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn inc_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.consecutive_read_errors.store(0, Ordering::Relaxed);
        self.last_message_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn inc_read_errors(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn consecutive_read_errors(&self) -> u64 {
        self.consecutive_read_errors.load(Ordering::Relaxed)
    }

    /// Count the outcome of one message
    pub fn record(&self, disposition: Disposition) {
        let counter = match disposition {
            Disposition::Persisted => &self.persisted,
            Disposition::DeadLettered => &self.dead_lettered,
            Disposition::Rescheduled { .. } => &self.rescheduled,
            Disposition::Parked { .. } => &self.parked,
            Disposition::Requeued { .. } => &self.requeued,
            Disposition::Deferred | Disposition::Stranded => &self.unresolved,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_ms = self.last_message_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            name: self.name.to_string(),
            running: self.is_running(),
            received: self.received.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            rescheduled: self.rescheduled.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            consecutive_read_errors: self.consecutive_read_errors(),
            last_message_at: if last_ms > 0 {
                Utc.timestamp_millis_opt(last_ms).single()
            } else {
                None
            },
        }
    }

    /// Log a one-line summary
    pub fn log_status(&self) {
        let s = self.snapshot();
        info!(
            "{}: received={} persisted={} dead_lettered={} rescheduled={} parked={} requeued={} unresolved={} read_errors={}",
            s.name,
            s.received,
            s.persisted,
            s.dead_lettered,
            s.rescheduled,
            s.parked,
            s.requeued,
            s.unresolved,
            s.read_errors
        );
    }
}
