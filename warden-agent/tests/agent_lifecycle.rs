//! End-to-end lifecycle tests for the agent core, driven by the
//! deterministic capability fakes and a hand-cranked clock.

use std::sync::Arc;
use std::time::Duration;

use warden_agent::cache::ArtifactCache;
use warden_agent::monitor::ThresholdMonitor;
use warden_agent::reconciler::Reconciler;
use warden_agent::rollback::RollbackCoordinator;
use warden_agent::table::{ProbeTable, UnloadOutcome};
use warden_agent::telemetry;
use warden_core::bus::{Bus, InProcBus};
use warden_core::catalog::MemoryCatalog;
use warden_core::clock::ManualClock;
use warden_core::kernel::FakeKernelLoader;
use warden_core::metrics::Metrics;
use warden_core::signature::{HmacSha256Verifier, sha256_hex, sign};
use warden_model::{
    ArtifactDescriptor, ArtifactId, HostId, RollbackReason, Telemetry, TelemetryCounters,
    TelemetryGauges, ThresholdConfig,
};
use tokio_util::sync::CancellationToken;

const SIGNING_KEY: &str = "test-signing-key";

struct Harness {
    clock: Arc<ManualClock>,
    catalog: Arc<MemoryCatalog>,
    loader: Arc<FakeKernelLoader>,
    bus: Arc<InProcBus>,
    table: Arc<ProbeTable>,
    reconciler: Reconciler,
    monitor: ThresholdMonitor,
    rollbacks: RollbackCoordinator,
    metrics: Arc<Metrics>,
    _cache_dir: tempfile::TempDir,
    _publisher_cancel: CancellationToken,
}

fn host() -> HostId {
    HostId::from("web-1")
}

fn descriptor(id: &str, bytes: &[u8], lifetime_secs: Option<u64>) -> ArtifactDescriptor {
    ArtifactDescriptor {
        id: ArtifactId::from(id),
        name: format!("probe-{id}"),
        version: "1.0.0".into(),
        size: bytes.len() as u64,
        checksum: sha256_hex(bytes),
        signature: sign(bytes, SIGNING_KEY),
        parameters: serde_json::json!({}),
        lifetime_secs,
    }
}

fn sample(artifact: &str, cpu: f64) -> Telemetry {
    Telemetry {
        artifact_id: ArtifactId::from(artifact),
        host_id: host(),
        timestamp: chrono::Utc::now(),
        counters: TelemetryCounters::default(),
        gauges: TelemetryGauges {
            cpu_percent: cpu,
            ..TelemetryGauges::default()
        },
        verifier_message: None,
    }
}

async fn harness(thresholds: ThresholdConfig) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let catalog = Arc::new(MemoryCatalog::new());
    let loader = Arc::new(FakeKernelLoader::new());
    let bus = Arc::new(InProcBus::new(64));
    let metrics = Arc::new(Metrics::new());
    let cache_dir = tempfile::tempdir().expect("tempdir");

    let (sender, publisher, _recent) = telemetry::channel(
        64,
        host(),
        Arc::clone(&bus) as Arc<dyn Bus>,
        "telemetry".into(),
        Arc::clone(&metrics),
    );
    let publisher_cancel = CancellationToken::new();
    tokio::spawn(publisher.run(publisher_cancel.clone()));

    let table = Arc::new(ProbeTable::new(
        Arc::clone(&clock) as _,
        Arc::clone(&loader) as _,
        sender.clone(),
        Arc::clone(&metrics),
    ));
    let reconciler = Reconciler::new(
        host(),
        Duration::from_secs(30),
        4,
        Duration::from_secs(3600),
        SIGNING_KEY.into(),
        Arc::clone(&catalog) as _,
        Arc::new(HmacSha256Verifier),
        Arc::clone(&loader) as _,
        Arc::clone(&table),
        ArtifactCache::new(cache_dir.path().to_path_buf()).expect("cache"),
        sender.clone(),
        Arc::clone(&metrics),
    );
    let monitor = ThresholdMonitor::new(
        thresholds,
        Arc::clone(&table),
        Arc::clone(&clock) as _,
        Arc::clone(&metrics),
    );
    let rollbacks = RollbackCoordinator::new(
        Arc::clone(&table),
        Arc::clone(&clock) as _,
        Arc::clone(&metrics),
    );

    Harness {
        clock,
        catalog,
        loader,
        bus,
        table,
        reconciler,
        monitor,
        rollbacks,
        metrics,
        _cache_dir: cache_dir,
        _publisher_cancel: publisher_cancel,
    }
}

#[tokio::test]
async fn lifetime_expiry_empties_the_table() {
    let h = harness(ThresholdConfig::default()).await;
    h.catalog
        .assign(&host(), descriptor("a1", b"obj-a1", Some(5)), b"obj-a1".to_vec());

    h.reconciler.tick().await;
    assert_eq!(h.table.active_count().await, 1);

    h.clock.advance(Duration::from_secs(6));
    let expired = h.table.expired().await;
    assert_eq!(expired, vec![ArtifactId::from("a1")]);
    for id in expired {
        h.table.unload(&id, RollbackReason::Expired, None).await;
    }

    assert_eq!(h.table.active_count().await, 0);
    assert!(h.loader.attached_handles().is_empty());
    assert_eq!(h.loader.detach_count(), 1);
    assert_eq!(h.metrics.get("probes_unloaded_total"), 1);
}

#[tokio::test]
async fn sustained_cpu_breach_unloads_after_action_delay() {
    let thresholds = ThresholdConfig {
        max_cpu_percent: 80.0,
        action_delay_secs: 2,
        ..ThresholdConfig::default()
    };
    let h = harness(thresholds).await;
    h.catalog
        .assign(&host(), descriptor("a2", b"obj-a2", None), b"obj-a2".to_vec());
    h.reconciler.tick().await;

    h.monitor.observe(sample("a2", 85.0)).await;
    // Breach held for the full action delay.
    h.clock.advance(Duration::from_secs(2));
    h.monitor.observe(sample("a2", 85.0)).await;
    h.monitor.sweep().await;

    assert_eq!(h.table.active_count().await, 0);
    assert_eq!(h.metrics.get("threshold_unloads"), 1);
}

#[tokio::test]
async fn transient_spike_clears_the_intent() {
    let thresholds = ThresholdConfig {
        max_cpu_percent: 80.0,
        action_delay_secs: 5,
        ..ThresholdConfig::default()
    };
    let h = harness(thresholds).await;
    h.catalog
        .assign(&host(), descriptor("a3", b"obj-a3", None), b"obj-a3".to_vec());
    h.reconciler.tick().await;

    h.monitor.observe(sample("a3", 85.0)).await;
    h.clock.advance(Duration::from_secs(1));
    h.monitor.observe(sample("a3", 10.0)).await;
    h.clock.advance(Duration::from_secs(5));
    h.monitor.sweep().await;

    assert_eq!(h.table.active_count().await, 1);
    assert_eq!(h.metrics.get("threshold_unloads"), 0);
    assert_eq!(h.metrics.get("breach_intents_cleared"), 1);
}

#[tokio::test]
async fn load_unload_reload_round_trip() {
    let h = harness(ThresholdConfig::default()).await;
    h.catalog
        .assign(&host(), descriptor("a4", b"obj-a4", None), b"obj-a4".to_vec());

    h.reconciler.tick().await;
    assert_eq!(h.table.active_count().await, 1);

    h.table
        .unload(&ArtifactId::from("a4"), RollbackReason::Manual, None)
        .await;
    assert_eq!(h.table.active_count().await, 0);
    assert!(h.loader.attached_handles().is_empty());

    // Same artifact id loads again on the next tick.
    h.reconciler.tick().await;
    assert_eq!(h.table.active_count().await, 1);
}

#[tokio::test]
async fn unload_is_idempotent() {
    let h = harness(ThresholdConfig::default()).await;
    h.catalog
        .assign(&host(), descriptor("a5", b"obj-a5", None), b"obj-a5".to_vec());
    h.reconciler.tick().await;

    let id = ArtifactId::from("a5");
    assert_eq!(
        h.table.unload(&id, RollbackReason::Manual, None).await,
        UnloadOutcome::Unloaded
    );
    assert_eq!(
        h.table.unload(&id, RollbackReason::Manual, None).await,
        UnloadOutcome::NotFound
    );
    assert_eq!(h.loader.detach_count(), 1);
}

#[tokio::test]
async fn signature_failure_never_loads_and_never_retries() {
    let h = harness(ThresholdConfig::default()).await;
    let mut bad = descriptor("a6", b"obj-a6", None);
    bad.signature = sign(b"other bytes", SIGNING_KEY);
    h.catalog.assign(&host(), bad, b"obj-a6".to_vec());

    h.reconciler.tick().await;
    h.reconciler.tick().await;

    assert_eq!(h.table.active_count().await, 0);
    assert_eq!(h.loader.attach_count(), 0);
    // Second tick skipped the rejected bytes instead of re-verifying.
    assert_eq!(h.metrics.get("signature_rejected"), 1);
}

#[tokio::test]
async fn attach_failure_keeps_table_clean_and_retries() {
    let h = harness(ThresholdConfig::default()).await;
    h.catalog
        .assign(&host(), descriptor("a7", b"obj-a7", None), b"obj-a7".to_vec());
    h.loader.fail_attach(
        b"obj-a7",
        warden_core::kernel::LoadError::VerifierRejected {
            diagnostic: "R3 pointer leak".into(),
        },
    );

    h.reconciler.tick().await;
    assert_eq!(h.table.active_count().await, 0);
    assert_eq!(h.metrics.get("attach_failures"), 1);

    // Next poll may retry; once the loader recovers the probe loads.
    h.loader.clear_attach_failure(b"obj-a7");
    h.reconciler.tick().await;
    assert_eq!(h.table.active_count().await, 1);
}

#[tokio::test]
async fn catalog_outage_skips_tick_without_state_change() {
    let h = harness(ThresholdConfig::default()).await;
    h.catalog
        .assign(&host(), descriptor("a8", b"obj-a8", None), b"obj-a8".to_vec());
    h.reconciler.tick().await;
    assert_eq!(h.table.active_count().await, 1);

    h.catalog.set_healthy(false);
    h.catalog
        .assign(&host(), descriptor("a9", b"obj-a9", None), b"obj-a9".to_vec());
    h.reconciler.tick().await;

    assert_eq!(h.table.active_count().await, 1);
    assert_eq!(h.metrics.get("catalog_unavailable_ticks"), 1);
}

#[tokio::test]
async fn capacity_cap_defers_new_probes() {
    let h = harness(ThresholdConfig::default()).await;
    // Harness cap is 4; assign 5.
    for i in 0..5 {
        let bytes = format!("obj-cap-{i}").into_bytes();
        h.catalog
            .assign(&host(), descriptor(&format!("cap-{i}"), &bytes, None), bytes.clone());
    }
    h.reconciler.tick().await;
    assert_eq!(h.table.active_count().await, 4);
    assert!(h.metrics.get("capacity_reached") >= 1);

    // Freeing a slot lets the deferred probe in on the next tick.
    h.table
        .unload(&ArtifactId::from("cap-0"), RollbackReason::Manual, None)
        .await;
    h.reconciler.tick().await;
    assert_eq!(h.table.active_count().await, 4);
}

#[tokio::test]
async fn detach_failure_does_not_wedge_the_table() {
    let h = harness(ThresholdConfig::default()).await;
    h.catalog
        .assign(&host(), descriptor("a10", b"obj-a10", None), b"obj-a10".to_vec());
    h.reconciler.tick().await;

    h.loader.set_detach_fails(true);
    let outcome = h
        .table
        .unload(&ArtifactId::from("a10"), RollbackReason::Manual, None)
        .await;

    assert_eq!(outcome, UnloadOutcome::Unloaded);
    assert_eq!(h.table.active_count().await, 0);
    assert_eq!(h.metrics.get("detach_failures"), 1);
}

#[tokio::test]
async fn reconciliation_is_deterministic() {
    let run = || async {
        let h = harness(ThresholdConfig::default()).await;
        for (id, bytes) in [("d1", b"obj-d1".as_slice()), ("d2", b"obj-d2")] {
            h.catalog.assign(&host(), descriptor(id, bytes, Some(100)), bytes.to_vec());
        }
        h.reconciler.tick().await;
        h.catalog.unassign(&host(), &ArtifactId::from("d1"));
        h.reconciler.tick().await;
        h.clock.advance(Duration::from_secs(10));
        h.table
            .snapshot()
            .await
            .into_iter()
            .map(|p| (p.artifact_id, p.status, p.remaining_lifetime_secs))
            .collect::<Vec<_>>()
    };
    let first = run().await;
    let second = run().await;
    assert_eq!(first, second);
    // Disappearance from the catalog did not unload anything.
    assert_eq!(first.len(), 2);
}

#[tokio::test]
async fn bus_rollback_command_unloads_probe() {
    let h = harness(ThresholdConfig::default()).await;
    h.catalog
        .assign(&host(), descriptor("a11", b"obj-a11", None), b"obj-a11".to_vec());
    h.reconciler.tick().await;

    let rollbacks = Arc::new(h.rollbacks);
    let cancel = CancellationToken::new();
    let listener = tokio::spawn(Arc::clone(&rollbacks).listen(
        Arc::clone(&h.bus) as Arc<dyn Bus>,
        host(),
        cancel.clone(),
    ));
    // Give the subscription a moment to attach before publishing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    warden_core::bus::publish_json(
        h.bus.as_ref(),
        &warden_core::subjects::rollback_for(&host()),
        &warden_model::HostRollbackCommand {
            artifact_id: ArtifactId::from("a11"),
            reason: "operator request".into(),
        },
    )
    .await
    .expect("publish");

    // The listener processes asynchronously; poll briefly.
    for _ in 0..50 {
        if h.table.active_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.table.active_count().await, 0);

    let history = rollbacks.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, "ok");

    cancel.cancel();
    let _ = listener.await;
}

#[tokio::test]
async fn rollback_of_unknown_artifact_reports_not_found() {
    let h = harness(ThresholdConfig::default()).await;
    let outcome = h
        .rollbacks
        .request(&ArtifactId::from("ghost"), "operator request")
        .await;
    assert_eq!(outcome, UnloadOutcome::NotFound);
    let history = h.rollbacks.history().await;
    assert_eq!(history[0].outcome, "not_found");
}

#[tokio::test]
async fn transient_fetch_failure_retries_on_the_next_tick() {
    use warden_core::catalog::{Catalog, HostArtifacts, MockCatalog};
    use warden_core::error::CoreError;

    let wanted = descriptor("m1", b"obj-m1", None);
    let listed = wanted.clone();
    let mut catalog = MockCatalog::new();
    catalog.expect_health().returning(|| Ok(()));
    catalog.expect_for_host().returning(move |_| {
        Ok(HostArtifacts {
            artifacts: vec![listed.clone()],
            total: 1,
            next_poll_secs: None,
        })
    });
    let mut seq = mockall::Sequence::new();
    catalog
        .expect_fetch()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Err(CoreError::Catalog("registry 503".into())));
    catalog
        .expect_fetch()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(b"obj-m1".to_vec()));

    let clock = Arc::new(ManualClock::new());
    let loader = Arc::new(FakeKernelLoader::new());
    let bus = Arc::new(InProcBus::new(64));
    let metrics = Arc::new(Metrics::new());
    let cache_dir = tempfile::tempdir().expect("tempdir");
    let (sender, publisher, _recent) = telemetry::channel(
        64,
        host(),
        Arc::clone(&bus) as Arc<dyn Bus>,
        "telemetry".into(),
        Arc::clone(&metrics),
    );
    tokio::spawn(publisher.run(CancellationToken::new()));
    let table = Arc::new(ProbeTable::new(
        Arc::clone(&clock) as _,
        Arc::clone(&loader) as _,
        sender.clone(),
        Arc::clone(&metrics),
    ));
    let reconciler = Reconciler::new(
        host(),
        Duration::from_secs(30),
        4,
        Duration::from_secs(3600),
        SIGNING_KEY.into(),
        Arc::new(catalog) as Arc<dyn Catalog>,
        Arc::new(HmacSha256Verifier),
        Arc::clone(&loader) as _,
        Arc::clone(&table),
        ArtifactCache::new(cache_dir.path().to_path_buf()).expect("cache"),
        sender,
        Arc::clone(&metrics),
    );

    reconciler.tick().await;
    assert_eq!(table.active_count().await, 0);
    assert_eq!(metrics.get("fetch_failures"), 1);

    reconciler.tick().await;
    assert_eq!(table.active_count().await, 1);
    assert!(table.contains(&wanted.id).await);
}
