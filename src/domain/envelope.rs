//! Dead-letter envelope
//!
//! The attempt counter travels with the message as the `x-attempts` header.
//! Nothing about a message's retry history is kept in process memory.

/// Header carrying the number of failed persistence attempts
pub const ATTEMPTS_HEADER: &str = "x-attempts";

/// Broker message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl MessageHeader {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }
}

/// Message as published to the dead-letter topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptEnvelope {
    pub key: Option<Vec<u8>>,
    /// `None` for a tombstone; kept as such through every republish
    pub payload: Option<Vec<u8>>,
    pub headers: Vec<MessageHeader>,
}

impl AttemptEnvelope {
    /// Envelope for an event entering the dead-letter topic for the first
    /// time: original key and bytes, no attempt header.
    pub fn first_entry(key: Option<Vec<u8>>, payload: Option<Vec<u8>>) -> Self {
        Self {
            key,
            payload,
            headers: Vec::new(),
        }
    }

    pub fn from_parts(
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        headers: Vec<MessageHeader>,
    ) -> Self {
        Self {
            key,
            payload,
            headers,
        }
    }

    /// Failed attempts recorded so far. Absent or unparsable headers count as 0.
    pub fn attempts(&self) -> u32 {
        self.headers
            .iter()
            .find(|h| h.key == ATTEMPTS_HEADER)
            .and_then(|h| h.value.as_deref())
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Copy of this envelope with the attempt counter advanced by one
    pub fn next_attempt(&self) -> Self {
        self.clone().with_attempts(self.attempts().saturating_add(1))
    }

    /// Set the attempt header, replacing an existing one in place
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        let value = attempts.to_string().into_bytes();
        match self.headers.iter_mut().find(|h| h.key == ATTEMPTS_HEADER) {
            Some(header) => header.value = Some(value),
            None => self.headers.push(MessageHeader::new(ATTEMPTS_HEADER, value)),
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_entry_has_no_attempts() {
        let envelope = AttemptEnvelope::first_entry(None, Some(b"{oops}".to_vec()));
        assert!(envelope.headers.is_empty());
        assert_eq!(envelope.attempts(), 0);
    }

    #[test]
    fn test_next_attempt_increments_by_one() {
        let first = AttemptEnvelope::first_entry(Some(b"item-1".to_vec()), Some(b"{}".to_vec()));
        let second = first.next_attempt();
        let third = second.next_attempt();

        assert_eq!(second.attempts(), 1);
        assert_eq!(third.attempts(), 2);
        assert_eq!(third.headers.len(), 1);
        assert_eq!(third.headers[0].value.as_deref(), Some(&b"2"[..]));
        assert_eq!(third.payload, first.payload);
        assert_eq!(third.key, first.key);
    }

    #[test]
    fn test_other_headers_are_preserved() {
        let envelope = AttemptEnvelope::from_parts(
            None,
            Some(b"{}".to_vec()),
            vec![
                MessageHeader::new("traceparent", "00-abc-def-01"),
                MessageHeader::new(ATTEMPTS_HEADER, "3"),
            ],
        );

        let next = envelope.next_attempt();
        assert_eq!(next.attempts(), 4);
        assert_eq!(next.headers[0], MessageHeader::new("traceparent", "00-abc-def-01"));
        assert_eq!(next.headers.len(), 2);
    }

    #[test]
    fn test_unparsable_header_counts_as_zero() {
        let garbage = AttemptEnvelope::from_parts(
            None,
            None,
            vec![MessageHeader::new(ATTEMPTS_HEADER, "three")],
        );
        assert_eq!(garbage.attempts(), 0);

        let padded = AttemptEnvelope::from_parts(
            None,
            None,
            vec![MessageHeader::new(ATTEMPTS_HEADER, " 2 ")],
        );
        assert_eq!(padded.attempts(), 2);

        let empty = AttemptEnvelope::from_parts(
            None,
            None,
            vec![MessageHeader {
                key: ATTEMPTS_HEADER.to_string(),
                value: None,
            }],
        );
        assert_eq!(empty.attempts(), 0);
    }

    #[test]
    fn test_tombstone_stays_null_across_attempts() {
        let tombstone = AttemptEnvelope::first_entry(Some(b"item-9".to_vec()), None);
        let next = tombstone.next_attempt().next_attempt();
        assert_eq!(next.payload, None);
        assert_eq!(next.attempts(), 2);
    }

    #[test]
    fn test_saturates_at_max_header() {
        let envelope = AttemptEnvelope::from_parts(
            None,
            None,
            vec![MessageHeader::new(ATTEMPTS_HEADER, u32::MAX.to_string())],
        );
        assert_eq!(envelope.attempts(), u32::MAX);
        assert_eq!(envelope.next_attempt().attempts(), u32::MAX);
    }
}
