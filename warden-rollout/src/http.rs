//! Admin HTTP surface for the rollout orchestrator.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use warden_core::metrics::Metrics;
use warden_model::{RequestId, RolloutThresholds};

use crate::aggregate::AggregateView;
use crate::scheduler::{ApplyRequest, RollbackRequest, RolloutScheduler};

#[derive(Clone)]
pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub scheduler: Arc<RolloutScheduler>,
    pub aggregate: Arc<AggregateView>,
    pub metrics: Arc<Metrics>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/version", get(version))
        .route("/apply/ebpf", get(list_active).post(apply))
        .route("/apply/ebpf/{request_id}", get(rollout_status))
        .route("/apply/ebpf/{request_id}/rollback", post(rollback))
        .route("/telemetry", get(telemetry))
        .route("/config/thresholds", post(set_thresholds))
        .route("/config/observation-window", post(set_observation_window))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let active = state.scheduler.list_active().await;
    Json(json!({
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "active_rollouts": active.len(),
        "observation_window_secs": state.scheduler.observation_window().await.as_secs(),
        "thresholds": state.scheduler.thresholds().await,
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

async fn list_active(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.scheduler.list_active().await))
}

async fn apply(
    State(state): State<AppState>,
    Json(request): Json<ApplyRequest>,
) -> (StatusCode, Json<Value>) {
    match state.scheduler.apply(request).await {
        Ok(snapshot) => (StatusCode::ACCEPTED, Json(json!(snapshot))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string(), "kind": e.kind()})),
        ),
    }
}

async fn rollout_status(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let Some(request_id) = RequestId::parse(&request_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "malformed request id"})),
        );
    };
    match state.scheduler.status(&request_id).await {
        Some(snapshot) => (StatusCode::OK, Json(json!(snapshot))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no such rollout"})),
        ),
    }
}

async fn rollback(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(request): Json<RollbackRequest>,
) -> (StatusCode, Json<Value>) {
    let Some(request_id) = RequestId::parse(&request_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "malformed request id"})),
        );
    };
    match state.scheduler.rollback(&request_id, request).await {
        Ok(outcomes) => {
            let results: Vec<Value> = outcomes
                .iter()
                .map(|o| json!({"target_id": o.target_id, "state": o.state}))
                .collect();
            (StatusCode::OK, Json(json!({"request_id": request_id, "results": results})))
        }
        Err(e) => {
            let code = match e.kind() {
                "not_found" => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_REQUEST,
            };
            (code, Json(json!({"error": e.to_string(), "kind": e.kind()})))
        }
    }
}

async fn telemetry(State(state): State<AppState>) -> Json<Value> {
    Json(state.aggregate.snapshot())
}

async fn set_thresholds(
    State(state): State<AppState>,
    Json(thresholds): Json<RolloutThresholds>,
) -> (StatusCode, Json<Value>) {
    match state.scheduler.set_thresholds(thresholds).await {
        Ok(()) => (StatusCode::OK, Json(json!({"applied": true}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string(), "kind": e.kind()})),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ObservationWindowRequest {
    observation_window_secs: u64,
}

async fn set_observation_window(
    State(state): State<AppState>,
    Json(request): Json<ObservationWindowRequest>,
) -> (StatusCode, Json<Value>) {
    match state
        .scheduler
        .set_observation_window(Duration::from_secs(request.observation_window_secs))
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({"applied": true}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string(), "kind": e.kind()})),
        ),
    }
}
