//! Durable stores of the audit pipeline
//!
//! - [`AuditSink`]: append one audit row per successfully handled event
//! - [`ParkingStore`]: terminal overflow for events that exhausted their retries
//!
//! Neither store retries internally; delivery reliability belongs to the
//! consumers in [`crate::pipeline`].

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresAuditStore;

use crate::error::Result;
use async_trait::async_trait;

/// Append-only audit capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append `(evt_type, payload)`; failures are returned unmodified
    async fn insert(&self, evt_type: &str, payload: &[u8]) -> Result<()>;
}

/// Terminal storage for events that could not be persisted
#[async_trait]
pub trait ParkingStore: Send + Sync {
    /// `payload` is `None` for a tombstone
    async fn park(&self, payload: Option<&[u8]>, attempts: u32) -> Result<()>;
}
