pub mod envelope;
pub mod event;
pub mod record;

pub use envelope::{AttemptEnvelope, MessageHeader, ATTEMPTS_HEADER};
pub use event::{ItemEvent, ReceivedEvent};
pub use record::{AuditRecord, ParkedRecord};
