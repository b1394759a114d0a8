//! Admin HTTP surface for the correlator.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use warden_core::metrics::Metrics;
use warden_model::{HostId, OverrideId, RuleId, RuleOverride, Severity};

use crate::config_stream::LiveConfig;
use crate::findings::FindingStore;
use crate::overrides::OverrideStore;
use crate::snapshot::SnapshotHolder;

#[derive(Clone)]
pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub snapshots: Arc<SnapshotHolder>,
    pub overrides: Arc<OverrideStore>,
    pub findings: Arc<FindingStore>,
    pub live: Arc<LiveConfig>,
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
        .route("/rules", get(rules))
        .route("/overrides", get(list_overrides).post(create_override))
        .route("/overrides/{id}", delete(delete_override))
        .route("/findings", get(findings))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.snapshots.current();
    let stats = state.findings.stats();
    let tunables = state.live.get();
    Json(json!({
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "rule_snapshot_version": snapshot.version,
        "rules": snapshot.rules.len(),
        "findings_stored": state.findings.len(),
        "findings_emitted": stats.emitted,
        "findings_deduplicated": stats.deduplicated,
        "tunables": {
            "rule_window_secs": tunables.rule_window.as_secs(),
            "label_ttl_secs": tunables.label_ttl.as_secs(),
            "debounce_ms": tunables.debounce.as_millis() as u64,
            "max_findings": tunables.max_findings,
            "dedupe_cap": tunables.dedupe_cap,
            "never_block_labels": tunables.never_block_labels,
        },
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

async fn rules(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.snapshots.current();
    let rules: Vec<_> = snapshot.rules.iter().map(|c| &c.rule).collect();
    Json(json!({
        "version": snapshot.version,
        "rules": rules,
    }))
}

async fn list_overrides(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.overrides.list()))
}

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    rule_id: RuleId,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    severity: Option<Severity>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    lifetime_secs: Option<u64>,
    #[serde(default)]
    description: Option<String>,
}

async fn create_override(
    State(state): State<AppState>,
    Json(request): Json<OverrideRequest>,
) -> (StatusCode, Json<Value>) {
    let now = Utc::now();
    let entry = RuleOverride {
        id: OverrideId::new(),
        rule_id: request.rule_id,
        enabled: request.enabled,
        severity: request.severity,
        confidence: request.confidence,
        lifetime_secs: request.lifetime_secs,
        description: request.description,
        created_at: now,
        updated_at: now,
    };
    match state.overrides.upsert(entry) {
        Ok(id) => (StatusCode::CREATED, Json(json!({"id": id}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string(), "kind": e.kind()})),
        ),
    }
}

async fn delete_override(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<Value>) {
    let Some(id) = OverrideId::parse(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "malformed override id"})),
        );
    };
    if state.overrides.remove(&id) {
        (StatusCode::OK, Json(json!({"removed": id})))
    } else {
        (StatusCode::NOT_FOUND, Json(json!({"error": "no such override"})))
    }
}

#[derive(Debug, Deserialize)]
struct FindingsQuery {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    min_severity: Option<String>,
}

async fn findings(
    State(state): State<AppState>,
    Query(query): Query<FindingsQuery>,
) -> (StatusCode, Json<Value>) {
    let host = query.host.map(|h| HostId::new(h));
    let min_severity = match query.min_severity.as_deref() {
        Some(raw) => match Severity::parse(raw) {
            Ok(severity) => Some(severity),
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": e.to_string()})),
                );
            }
        },
        None => None,
    };
    (
        StatusCode::OK,
        Json(json!(state.findings.query(host.as_ref(), min_severity))),
    )
}
