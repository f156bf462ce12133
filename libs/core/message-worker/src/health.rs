//! Health check handlers for message workers.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness checks (`/health`, `/healthz`)
//! - Readiness checks (`/ready`, `/readyz`), ready only while the loop is running
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
use crate::worker::{LoopState, MessageWorker};

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Worker whose loop state drives readiness.
    pub worker: Arc<MessageWorker>,
    /// Application name.
    pub app_name: String,
    /// Application version.
    pub app_version: String,
}

impl HealthState {
    pub fn new(
        worker: Arc<MessageWorker>,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            worker,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
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
/// Ready while the consumption loop is `running`; 503 in every other state.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let loop_state = state.worker.state();
    let body = json!({
        "status": if loop_state == LoopState::Running { "ready" } else { "not_ready" },
        "checks": {
            "worker": state.worker.descriptor().worker(),
            "loop": loop_state.as_ref(),
            "subscriptions": state.worker.open_subscriptions(),
        }
    });

    if loop_state == LoopState::Running {
        Ok((StatusCode::OK, Json(body)))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}

/// Prometheus metrics endpoint handler.
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
/// - `/metrics` - Prometheus metrics
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
