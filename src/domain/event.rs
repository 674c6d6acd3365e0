use serde::Deserialize;

use crate::error::Result;

/// Item change event as published by the item service
///
/// Only `type` is required. `item` and `id` are kept as opaque JSON so that
/// unknown shapes never reject an otherwise auditable event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ItemEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub item: Option<serde_json::Value>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

/// Parsed view of a message that still borrows the exact bytes received
#[derive(Debug, Clone)]
pub struct ReceivedEvent<'a> {
    raw: &'a [u8],
    event: ItemEvent,
}

impl<'a> ReceivedEvent<'a> {
    /// Parse the message body; the raw slice is kept untouched
    pub fn parse(raw: &'a [u8]) -> Result<Self> {
        let event = serde_json::from_slice(raw)?;
        Ok(Self { raw, event })
    }

    pub fn event_type(&self) -> &str {
        &self.event.event_type
    }

    pub fn event(&self) -> &ItemEvent {
        &self.event
    }

    /// Bytes exactly as received from the broker
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }
}
