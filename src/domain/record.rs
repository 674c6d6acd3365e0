use chrono::{DateTime, Utc};

/// Row of the audit table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub evt_type: String,
    pub payload: Vec<u8>,
    /// Assigned by the store
    pub received_at: DateTime<Utc>,
}

/// Row of the parking table; needs manual remediation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParkedRecord {
    /// `None` when the parked message was a tombstone
    pub payload: Option<Vec<u8>>,
    pub attempts: u32,
    /// Assigned by the store
    pub parked_at: DateTime<Utc>,
}
