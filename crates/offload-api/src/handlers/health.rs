//! Health endpoint for probes and load monitoring.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use offload_delivery::DeliveryStats;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::server::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service health status
    pub status: HealthStatus,
    /// Tasks waiting for a worker
    pub queue_depth: usize,
    /// Queue capacity
    pub queue_capacity: usize,
    /// Workers currently processing a task
    pub active_workers: usize,
    /// Configured pool size
    pub worker_count: usize,
    /// Whether new work is accepted
    pub accepting: bool,
    /// Whether the store answered
    pub db_connected: bool,
    /// Seconds since the process started
    pub uptime_seconds: u64,
    /// Callback delivery counters
    pub deliveries: DeliveryCounters,
}

/// Overall health status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Serving, but the queue is full or shutdown has begun
    Degraded,
    /// The store is unreachable
    Unhealthy,
}

/// Delivery engine counters.
#[derive(Debug, Serialize)]
pub struct DeliveryCounters {
    /// Sequences currently running
    pub in_flight: u64,
    /// Sequences that ended delivered
    pub delivered: u64,
    /// Individual failed attempts
    pub failed_attempts: u64,
    /// Sequences that exhausted retries
    pub exhausted: u64,
    /// Sequences rejected by delivery-time validation
    pub rejected: u64,
    /// Sequences abandoned at shutdown
    pub abandoned: u64,
}

impl From<DeliveryStats> for DeliveryCounters {
    fn from(stats: DeliveryStats) -> Self {
        Self {
            in_flight: stats.in_flight,
            delivered: stats.delivered,
            failed_attempts: stats.failed_attempts,
            exhausted: stats.exhausted,
            rejected: stats.rejected,
            abandoned: stats.abandoned,
        }
    }
}

/// Reports queue depth, worker activity, and store connectivity.
///
/// Answers 200 unless the store is unreachable, in which case 503.
#[instrument(name = "health_check", skip_all)]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let health = state.pipeline.health().await;

    let status = if !health.store_healthy {
        HealthStatus::Unhealthy
    } else if !health.accepting || health.queue_depth >= health.queue_capacity {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    };
    debug!(?status, queue_depth = health.queue_depth, "health check");

    let code = match status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };

    let body = HealthResponse {
        status,
        queue_depth: health.queue_depth,
        queue_capacity: health.queue_capacity,
        active_workers: health.active_workers,
        worker_count: health.worker_count,
        accepting: health.accepting,
        db_connected: health.store_healthy,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        deliveries: health.delivery.into(),
    };

    (code, Json(body)).into_response()
}
