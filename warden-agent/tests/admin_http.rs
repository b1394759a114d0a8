//! Admin surface tests over a live listener, driving the full runtime.

use std::sync::Arc;
use std::time::Duration;

use warden_agent::http::{self, AppState};
use warden_agent::runtime::AgentRuntime;
use warden_config::AgentConfig;
use warden_core::bus::{Bus, InProcBus};
use warden_core::catalog::MemoryCatalog;
use warden_core::clock::SystemClock;
use warden_core::kernel::FakeKernelLoader;
use warden_core::signature::{HmacSha256Verifier, sha256_hex, sign};
use warden_model::{ArtifactDescriptor, ArtifactId, HostId, ThresholdConfig};

const SIGNING_KEY: &str = "admin-test-key";

fn config(cache_dir: &std::path::Path) -> AgentConfig {
    AgentConfig {
        host_id: HostId::from("admin-host"),
        registry_url: "http://localhost:1".into(),
        // The reconciler ticks once at startup; keep it from re-polling
        // (and re-loading what the test rolls back) mid-assertion.
        poll_interval: Duration::from_secs(3600),
        bus_url: "unused".into(),
        cache_dir: cache_dir.to_path_buf(),
        max_programs: 8,
        default_lifetime: Duration::from_secs(3600),
        telemetry_subject: "telemetry".into(),
        http_port: 0,
        signing_key: SIGNING_KEY.into(),
        telemetry_queue_capacity: 64,
        heartbeat_interval: Duration::from_secs(60),
        rollback_check_interval: Duration::from_millis(100),
        thresholds: ThresholdConfig::default(),
    }
}

fn descriptor(id: &str, bytes: &[u8]) -> ArtifactDescriptor {
    ArtifactDescriptor {
        id: ArtifactId::from(id),
        name: format!("probe-{id}"),
        version: "1.0.0".into(),
        size: bytes.len() as u64,
        checksum: sha256_hex(bytes),
        signature: sign(bytes, SIGNING_KEY),
        parameters: serde_json::json!({}),
        lifetime_secs: None,
    }
}

#[tokio::test]
async fn admin_surface_reports_programs_and_handles_rollbacks() {
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.assign(
        &HostId::from("admin-host"),
        descriptor("adm-1", b"obj-adm-1"),
        b"obj-adm-1".to_vec(),
    );

    let runtime = AgentRuntime {
        config: config(cache_dir.path()),
        bus: Arc::new(InProcBus::new(64)) as Arc<dyn Bus>,
        catalog,
        verifier: Arc::new(HmacSha256Verifier),
        loader: Arc::new(FakeKernelLoader::new()),
        clock: Arc::new(SystemClock::new()),
    };
    let handle = runtime.start().await.expect("start");

    let state = AppState {
        host_id: handle.host_id.clone(),
        started_at: handle.started_at,
        table: Arc::clone(&handle.table),
        monitor: Arc::clone(&handle.monitor),
        rollbacks: Arc::clone(&handle.rollbacks),
        recent_telemetry: Arc::clone(&handle.recent_telemetry),
        metrics: Arc::clone(&handle.metrics),
    };
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, http::router(state)).await;
    });
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    // The poll loop ticks at startup; wait for the load to land.
    for _ in 0..50 {
        if handle.table.active_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let health = client.get(format!("{base}/healthz")).send().await.expect("healthz");
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.expect("body"), "ok");

    let programs: serde_json::Value = client
        .get(format!("{base}/programs"))
        .send()
        .await
        .expect("programs")
        .json()
        .await
        .expect("json");
    assert_eq!(programs.as_array().expect("array").len(), 1);
    assert_eq!(programs[0]["artifact_id"], "adm-1");
    assert_eq!(programs[0]["status"], "running");

    let status: serde_json::Value = client
        .get(format!("{base}/status"))
        .send()
        .await
        .expect("status")
        .json()
        .await
        .expect("json");
    assert_eq!(status["host_id"], "admin-host");
    assert_eq!(status["probes"]["running"], 1);

    // Rollback of an unknown artifact: 404, recorded, non-fatal.
    let missing = client
        .post(format!("{base}/rollbacks"))
        .json(&serde_json::json!({"artifact_id": "ghost", "reason": "oops"}))
        .send()
        .await
        .expect("rollback");
    assert_eq!(missing.status(), 404);

    // Rollback of the loaded artifact empties the table.
    let ok = client
        .post(format!("{base}/rollbacks"))
        .json(&serde_json::json!({"artifact_id": "adm-1", "reason": "operator"}))
        .send()
        .await
        .expect("rollback");
    assert_eq!(ok.status(), 200);
    assert_eq!(handle.table.active_count().await, 0);

    let history: serde_json::Value = client
        .get(format!("{base}/rollbacks"))
        .send()
        .await
        .expect("history")
        .json()
        .await
        .expect("json");
    assert_eq!(history.as_array().expect("array").len(), 2);

    let version: serde_json::Value = client
        .get(format!("{base}/version"))
        .send()
        .await
        .expect("version")
        .json()
        .await
        .expect("json");
    assert_eq!(version["name"], "warden-agent");

    handle.shutdown().await;
}
