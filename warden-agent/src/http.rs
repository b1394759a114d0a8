//! Admin HTTP surface for the agent.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use warden_core::metrics::Metrics;
use warden_model::{ArtifactId, HostId};

use crate::monitor::ThresholdMonitor;
use crate::rollback::RollbackCoordinator;
use crate::table::{ProbeTable, UnloadOutcome};
use crate::telemetry::RecentTelemetry;

/// Read-mostly state shared with the handlers.
#[derive(Clone)]
pub struct AppState {
    pub host_id: HostId,
    pub started_at: DateTime<Utc>,
    pub table: Arc<ProbeTable>,
    pub monitor: Arc<ThresholdMonitor>,
    pub rollbacks: Arc<RollbackCoordinator>,
    pub recent_telemetry: RecentTelemetry,
    pub metrics: Arc<Metrics>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").field("host_id", &self.host_id).finish()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/version", get(version))
        .route("/programs", get(programs))
        .route("/rollbacks", get(rollbacks).post(request_rollback))
        .route("/telemetry", get(telemetry))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let counts = state.table.counts().await;
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(json!({
        "host_id": state.host_id,
        "uptime_secs": uptime,
        "probes": counts,
        "thresholds": state.monitor.thresholds().await,
    }))
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.metrics.snapshot()))
}

async fn version() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn programs(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.table.snapshot().await))
}

async fn rollbacks(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.rollbacks.history().await))
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    artifact_id: ArtifactId,
    #[serde(default)]
    reason: String,
}

async fn request_rollback(
    State(state): State<AppState>,
    Json(request): Json<RollbackRequest>,
) -> (StatusCode, Json<Value>) {
    let reason = if request.reason.is_empty() {
        "admin rollback"
    } else {
        request.reason.as_str()
    };
    let outcome = state.rollbacks.request(&request.artifact_id, reason).await;
    match outcome {
        UnloadOutcome::Unloaded | UnloadOutcome::InFlight => {
            (StatusCode::OK, Json(json!({"outcome": "ok"})))
        }
        UnloadOutcome::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({"outcome": "not_found", "artifact_id": request.artifact_id})),
        ),
    }
}

async fn telemetry(State(state): State<AppState>) -> Json<Value> {
    let recent: Vec<_> = {
        let ring = state
            .recent_telemetry
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        ring.iter().cloned().collect()
    };
    Json(json!(recent))
}
