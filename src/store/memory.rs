//! In-process store used by tests and local runs.
//!
//! Failures can be injected to simulate an unavailable datastore.

use super::{AuditSink, ParkingStore};
use crate::domain::{AuditRecord, ParkedRecord};
use crate::error::{AuditError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InsertFailures {
    None,
    Next(u32),
    Always,
}

/// Audit and parking tables kept in memory
pub struct MemoryStore {
    audit: Mutex<Vec<AuditRecord>>,
    parked: Mutex<Vec<ParkedRecord>>,
    insert_failures: Mutex<InsertFailures>,
    parking_down: AtomicBool,
    insert_calls: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            audit: Mutex::new(Vec::new()),
            parked: Mutex::new(Vec::new()),
            insert_failures: Mutex::new(InsertFailures::None),
            parking_down: AtomicBool::new(false),
            insert_calls: AtomicU64::new(0),
        }
    }

    /// Fail the next `count` inserts, then recover
    pub async fn fail_next_inserts(&self, count: u32) {
        *self.insert_failures.lock().await = InsertFailures::Next(count);
    }

    /// Fail every insert until [`MemoryStore::heal`] is called
    pub async fn fail_all_inserts(&self) {
        *self.insert_failures.lock().await = InsertFailures::Always;
    }

    pub async fn heal(&self) {
        *self.insert_failures.lock().await = InsertFailures::None;
    }

    pub fn set_parking_down(&self, down: bool) {
        self.parking_down.store(down, Ordering::SeqCst);
    }

    /// Number of insert calls, failed ones included
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub async fn audit_records(&self) -> Vec<AuditRecord> {
        self.audit.lock().await.clone()
    }

    pub async fn parked_records(&self) -> Vec<ParkedRecord> {
        self.parked.lock().await.clone()
    }

    async fn should_fail_insert(&self) -> bool {
        let mut failures = self.insert_failures.lock().await;
        match *failures {
            InsertFailures::None => false,
            InsertFailures::Always => true,
            InsertFailures::Next(0) => {
                *failures = InsertFailures::None;
                false
            }
            InsertFailures::Next(n) => {
                *failures = InsertFailures::Next(n - 1);
                true
            }
        }
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn insert(&self, evt_type: &str, payload: &[u8]) -> Result<()> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail_insert().await {
            return Err(AuditError::Database(sqlx::Error::PoolTimedOut));
        }

        self.audit.lock().await.push(AuditRecord {
            evt_type: evt_type.to_string(),
            payload: payload.to_vec(),
            received_at: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl ParkingStore for MemoryStore {
    async fn park(&self, payload: Option<&[u8]>, attempts: u32) -> Result<()> {
        if self.parking_down.load(Ordering::SeqCst) {
            return Err(AuditError::Database(sqlx::Error::PoolTimedOut));
        }

        self.parked.lock().await.push(ParkedRecord {
            payload: payload.map(<[u8]>::to_vec),
            attempts,
            parked_at: Utc::now(),
        });
        Ok(())
    }
}
