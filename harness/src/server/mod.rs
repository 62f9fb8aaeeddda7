//! HTTP exposition of benchmark metrics
//!
//! The harness itself has no network surface; this router only lets an
//! external Prometheus scrape the counters and histograms recorded while the
//! suites run.

use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Shared state of the metrics endpoints
#[derive(Clone)]
pub struct MetricsState {
    handle: PrometheusHandle,
    started_at: Arc<Instant>,
}

impl MetricsState {
    pub fn new(handle: PrometheusHandle) -> Self {
        Self {
            handle,
            started_at: Arc::new(Instant::now()),
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

async fn health(State(state): State<MetricsState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}

/// Endpoint to expose metrics in Prometheus format
async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    state.handle.render()
}

pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics/prometheus", get(prometheus_metrics))
        .with_state(MetricsState::new(handle))
}
