use thiserror::Error;

/// Main error type for the audit pipeline
#[derive(Error, Debug)]
pub enum AuditError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Broker errors
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    // Payload errors
    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Startup failure with the step that failed attached as context
    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl AuditError {
    /// True when the failure came from parsing the event body rather than
    /// from the datastore or broker. Used for log classification only.
    pub fn is_malformed(&self) -> bool {
        matches!(self, AuditError::MalformedPayload(_))
    }

    /// Short label for structured logs and counters
    pub fn kind(&self) -> &'static str {
        match self {
            AuditError::Config(_) | AuditError::InvalidConfig(_) => "config",
            AuditError::Database(_) | AuditError::Migration(_) => "database",
            AuditError::Kafka(_) => "broker",
            AuditError::MalformedPayload(_) => "malformed_payload",
            AuditError::Io(_) => "io",
            AuditError::Internal(_) | AuditError::Other(_) => "internal",
        }
    }
}

/// Result type alias for AuditError
pub type Result<T> = std::result::Result<T, AuditError>;
