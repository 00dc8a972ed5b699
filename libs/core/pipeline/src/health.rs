//! Health check handlers for pipeline workers.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness checks (`/health`, `/healthz`)
//! - Readiness checks (`/ready`, `/readyz`)
//! - Queue monitoring (`/queues`)
//! - Prometheus metrics (`/metrics`)

use axum::{
    Json,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::metrics;
use crate::queue::QueueStatus;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
    /// Queues feeding the worker's processors.
    pub queues: Vec<Arc<dyn QueueStatus>>,
}

impl HealthState {
    pub fn new(app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            app_version: app_version.into(),
            queues: Vec::new(),
        }
    }

    /// Report `queue` on `/queues` and gate readiness on it.
    pub fn with_queue(mut self, queue: Arc<dyn QueueStatus>) -> Self {
        self.queues.push(queue);
        self
    }
}

/// Health response for liveness checks.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Status (always "healthy" if responding).
    pub status: &'static str,
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
}

/// Point-in-time view of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReport {
    pub name: String,
    pub stopped: bool,
    pub depth: usize,
    pub capacity: usize,
}

impl QueueReport {
    fn of(queue: &dyn QueueStatus) -> Self {
        Self {
            name: queue.name().to_string(),
            stopped: queue.is_stopped(),
            depth: queue.len(),
            capacity: queue.capacity(),
        }
    }
}

fn reports(state: &HealthState) -> Vec<QueueReport> {
    state.queues.iter().map(|queue| QueueReport::of(queue.as_ref())).collect()
}

/// Liveness check handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness check handler.
///
/// Not ready once any registered queue has been stopped, which happens
/// during shutdown.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let queues = reports(&state);
    let ready = queues.iter().all(|queue| !queue.stopped);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "checks": {
                "queues": queues
            }
        })),
    )
}

/// Queue depth and capacity for monitoring.
pub async fn queues_handler(State(state): State<HealthState>) -> Json<Vec<QueueReport>> {
    Json(reports(&state))
}

/// Prometheus metrics endpoint handler.
///
/// Returns metrics in Prometheus text format for scraping.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create a standard health router.
///
/// - `/health`, `/healthz` - Liveness check
/// - `/ready`, `/readyz` - Readiness check
/// - `/queues` - Queue monitoring
/// - `/metrics` - Prometheus metrics
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/queues", get(queues_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
