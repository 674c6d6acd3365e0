use super::{AuditSink, ParkingStore};
use crate::config::DatabaseConfig;
use crate::error::Result;
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

/// PostgreSQL storage for audit and parking rows
///
/// The pool is shared by both consumer loops; every call is a single
/// statement with no surrounding transaction.
#[derive(Clone)]
pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    /// Connect and verify the datastore is reachable
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        info!(
            "Connected to PostgreSQL (max_connections: {})",
            config.max_connections
        );
        Ok(Self { pool })
    }

    /// Run embedded migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl AuditSink for PostgresAuditStore {
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    async fn insert(&self, evt_type: &str, payload: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app.item_audit (evt_type, payload)
            VALUES ($1, $2)
            "#,
        )
        .bind(evt_type)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ParkingStore for PostgresAuditStore {
    #[instrument(skip(self, payload), fields(payload_len = payload.map_or(0, <[u8]>::len)))]
    async fn park(&self, payload: Option<&[u8]>, attempts: u32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app.item_audit_parking (payload, attempts)
            VALUES ($1, $2)
            "#,
        )
        .bind(payload)
        .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
