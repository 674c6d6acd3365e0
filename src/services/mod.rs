pub mod health;
pub mod metrics;

pub use health::{
    router, ComponentHealth, HealthResponse, HealthServer, HealthState, HealthStatus,
};
pub use metrics::{LoopMetrics, MetricsSnapshot};
