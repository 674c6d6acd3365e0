//! Health check HTTP server
//!
//! Provides liveness and readiness probes for process supervision and a
//! Prometheus metrics endpoint built from the loop counters.

use crate::coordination::ShutdownToken;
use crate::services::{LoopMetrics, MetricsSnapshot};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Read errors in a row before a loop is reported as degraded
const DEGRADED_AFTER_READ_ERRORS: u64 = 3;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Component health check result
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub metrics: MetricsSnapshot,
}

/// Overall system health response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
}

/// Shared state for health server
pub struct HealthState {
    started_at: DateTime<Utc>,
    loops: Vec<Arc<LoopMetrics>>,
}

impl HealthState {
    pub fn new(loops: Vec<Arc<LoopMetrics>>) -> Self {
        Self {
            started_at: Utc::now(),
            loops,
        }
    }

    fn component(metrics: &LoopMetrics) -> ComponentHealth {
        let snapshot = metrics.snapshot();
        let (status, message) = if !snapshot.running {
            (HealthStatus::Unhealthy, Some("Not running".to_string()))
        } else if snapshot.consecutive_read_errors >= DEGRADED_AFTER_READ_ERRORS {
            (
                HealthStatus::Degraded,
                Some(format!(
                    "{} consecutive broker read errors",
                    snapshot.consecutive_read_errors
                )),
            )
        } else {
            (HealthStatus::Healthy, None)
        };

        ComponentHealth {
            status,
            message,
            metrics: snapshot,
        }
    }

    /// Get overall health status; the worst component wins
    pub fn get_health(&self) -> HealthResponse {
        let components: Vec<ComponentHealth> =
            self.loops.iter().map(|m| Self::component(m)).collect();

        let status = if components
            .iter()
            .any(|c| c.status == HealthStatus::Unhealthy)
        {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthResponse {
            status,
            timestamp: Utc::now(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
            components,
        }
    }
}

/// Build the router; exposed for tests
pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health check server
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Serve until the shutdown token fires
    pub async fn run(&self, mut shutdown: ShutdownToken) -> crate::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router(Arc::clone(&self.state)))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        info!("Health server stopped");
        Ok(())
    }
}

/// Full health check endpoint
async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health();
    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK, // Still return 200 for degraded
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

/// Liveness probe - is the process alive?
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness probe - are the consumer loops running?
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    match state.get_health().status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health();
    let mut body = format!(
        "# HELP item_auditor_uptime_seconds Uptime in seconds\n\
         # TYPE item_auditor_uptime_seconds counter\n\
         item_auditor_uptime_seconds {}\n",
        health.uptime_seconds
    );

    let counters: [(&str, &str, fn(&MetricsSnapshot) -> u64); 8] = [
        ("received_total", "Messages fetched", |s| s.received),
        ("persisted_total", "Events written to the audit table", |s| s.persisted),
        ("dead_lettered_total", "Events sent to the dead-letter topic", |s| s.dead_lettered),
        ("rescheduled_total", "Events republished for retry", |s| s.rescheduled),
        ("parked_total", "Events written to the parking table", |s| s.parked),
        ("requeued_total", "Events requeued after a parking failure", |s| s.requeued),
        ("unresolved_total", "Messages left unacknowledged", |s| s.unresolved),
        ("read_errors_total", "Broker read errors", |s| s.read_errors),
    ];

    for (name, help, value) in counters {
        let _ = writeln!(body, "\n# HELP item_auditor_{name} {help}");
        let _ = writeln!(body, "# TYPE item_auditor_{name} counter");
        for component in &health.components {
            let _ = writeln!(
                body,
                "item_auditor_{name}{{loop=\"{}\"}} {}",
                component.metrics.name,
                value(&component.metrics)
            );
        }
    }

    let _ = writeln!(body, "\n# HELP item_auditor_loop_up Loop running (1) or stopped (0)");
    let _ = writeln!(body, "# TYPE item_auditor_loop_up gauge");
    for component in &health.components {
        let _ = writeln!(
            body,
            "item_auditor_loop_up{{loop=\"{}\"}} {}",
            component.metrics.name,
            u8::from(component.metrics.running)
        );
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        body,
    )
}
