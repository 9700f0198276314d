//! Status HTTP Server for modplay
//!
//! Exposes health and metrics via HTTP endpoints for monitoring tools.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::emulator::Emulator;
use crate::metrics::{MetricsSnapshot, SharedMetrics};
use crate::store::CacheStore;

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address {0}")]
    InvalidAddress(String),

    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    /// `ok` when storage answers, `degraded` otherwise
    pub status: String,
    pub version: String,
    pub emulator_available: bool,
    pub storage_backend: String,
}

/// Shared state behind the status routes
#[derive(Clone)]
pub struct StatusState {
    pub metrics: SharedMetrics,
    pub store: Arc<CacheStore>,
    pub emulator: Arc<dyn Emulator>,
}

/// Handler for GET /health
///
/// Answers 200 when the storage backend is reachable and 503 otherwise. A
/// missing emulator is reported but does not fail the check.
async fn get_health(State(state): State<StatusState>) -> (StatusCode, Json<HealthReport>) {
    let storage_ok = state.store.health_check().await.is_ok();
    let report = HealthReport {
        status: if storage_ok { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        emulator_available: state.emulator.is_available(),
        storage_backend: state.store.backend_name().to_string(),
    };
    let code = if storage_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

/// Handler for GET /metrics
/// Returns the current MetricsSnapshot as JSON
async fn get_metrics(State(state): State<StatusState>) -> Json<MetricsSnapshot> {
    let snapshot = state.metrics.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with health and metrics endpoints
pub fn create_status_router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .with_state(state)
}

/// Runs the status HTTP server on `bind`
///
/// # Arguments
/// * `bind` - Listen address such as `127.0.0.1:7878`
/// * `state` - Metrics, store and emulator to report on
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if server fails to start
pub async fn run_status_server(bind: &str, state: StatusState) -> Result<(), ServerError> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind.to_string()))?;
    let app = create_status_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Status server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
