//! End-to-end wiring: events in on the bus, findings out on the bus.

use std::sync::Arc;
use std::time::Duration;

use warden_config::CorrelatorConfig;
use warden_core::bus::{Bus, InProcBus, publish_json};
use warden_core::clock::SystemClock;
use warden_core::subjects;
use warden_correlator::runtime::CorrelatorRuntime;
use warden_model::{Event, Finding, HostId};

fn config(rules_dir: &std::path::Path) -> CorrelatorConfig {
    CorrelatorConfig {
        http_addr: "127.0.0.1:0".parse().expect("addr"),
        bus_url: "unused".into(),
        config_api_url: None,
        max_findings: 100,
        dedupe_cap: 1000,
        rules_dir: rules_dir.to_path_buf(),
        hot_reload: false,
        debounce: Duration::from_millis(100),
        rule_window: Duration::from_secs(60),
        label_ttl: Duration::from_secs(600),
        never_block_labels: vec![],
        window_gc_interval: Duration::from_secs(5),
    }
}

const RULE: &str = "id: wire-1\n\
name: exec on the wire\n\
condition:\n\
\x20 when:\n\
\x20   event_type: process_exec\n\
outcome:\n\
\x20 severity: high\n\
\x20 confidence: 0.9\n\
dedupe:\n\
\x20 key_template: '{rule.id}:{host_id}:{timestamp}'\n\
\x20 cooldown_secs: 1\n";

#[tokio::test]
async fn event_on_the_bus_becomes_a_finding_on_the_bus() {
    let rules_dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(rules_dir.path().join("wire.yaml"), RULE).expect("write rule");

    let bus = Arc::new(InProcBus::new(64));
    let runtime = CorrelatorRuntime {
        config: config(rules_dir.path()),
        bus: Arc::clone(&bus) as Arc<dyn Bus>,
        clock: Arc::new(SystemClock::new()),
    };
    let handle = runtime.start().await.expect("start");
    assert_eq!(handle.snapshots.current().version, 1);

    let mut findings = bus.subscribe(subjects::FINDINGS).await.expect("subscribe");
    // Give the intake subscriptions a moment to attach.
    tokio::time::sleep(Duration::from_millis(100)).await;

    publish_json(
        bus.as_ref(),
        subjects::EVENTS_ENRICHED,
        &Event::new(HostId::from("wire-host"), "process_exec"),
    )
    .await
    .expect("publish");

    let message = tokio::time::timeout(Duration::from_secs(3), findings.recv())
        .await
        .expect("delivery")
        .expect("message");
    let finding: Finding = message.json().expect("decode");
    assert_eq!(finding.host_id, HostId::from("wire-host"));
    assert_eq!(finding.rule_snapshot_version, 1);
    assert_eq!(handle.findings.len(), 1);

    // A non-matching event type stays silent.
    publish_json(
        bus.as_ref(),
        subjects::EVENTS_ENRICHED,
        &Event::new(HostId::from("wire-host"), "file_open"),
    )
    .await
    .expect("publish");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.findings.len(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn config_changes_on_the_bus_update_tunables() {
    let rules_dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(rules_dir.path().join("wire.yaml"), RULE).expect("write rule");

    let bus = Arc::new(InProcBus::new(64));
    let runtime = CorrelatorRuntime {
        config: config(rules_dir.path()),
        bus: Arc::clone(&bus) as Arc<dyn Bus>,
        clock: Arc::new(SystemClock::new()),
    };
    let handle = runtime.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(100)).await;

    publish_json(
        bus.as_ref(),
        subjects::CONFIG_CHANGED,
        &serde_json::json!({
            "correlator": {
                "rule_window_secs": 120,
                "never_block_labels": ["env:exempt"],
            }
        }),
    )
    .await
    .expect("publish");

    let mut applied = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let tunables = handle.live.get();
        if tunables.rule_window == Duration::from_secs(120) {
            assert!(tunables.never_block_labels.contains("env:exempt"));
            applied = true;
            break;
        }
    }
    assert!(applied, "config change never applied");

    handle.shutdown().await;
}
