pub mod broker;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod pipeline;
pub mod services;
pub mod store;

pub use broker::{DeadLetterPublisher, InboundMessage, MessagePosition, MessageSource};
pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownSignal, ShutdownToken};
pub use domain::{AttemptEnvelope, ItemEvent, ATTEMPTS_HEADER};
pub use error::{AuditError, Result};
pub use pipeline::{Disposition, PrimaryConsumer, RetryPolicy, RetryWorker};
pub use store::{AuditSink, ParkingStore};
