//! Rule directory loading and hot-reload tests.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use warden_core::metrics::Metrics;
use warden_correlator::loader::RuleLoader;
use warden_correlator::snapshot::SnapshotHolder;
use warden_correlator::window::WindowBuffer;
use warden_model::RuleId;

fn loader_for(dir: &std::path::Path) -> (Arc<RuleLoader>, Arc<SnapshotHolder>, Arc<Metrics>) {
    let holder = Arc::new(SnapshotHolder::new());
    let metrics = Arc::new(Metrics::new());
    let loader = Arc::new(RuleLoader::new(
        dir.to_path_buf(),
        Arc::clone(&holder),
        Arc::clone(&metrics),
    ));
    (loader, holder, metrics)
}

fn rule_yaml(id: &str, severity: &str) -> String {
    format!(
        "id: {id}\n\
         name: rule {id}\n\
         condition:\n\
         \x20 when:\n\
         \x20   event_type: process_exec\n\
         outcome:\n\
         \x20 severity: {severity}\n\
         \x20 confidence: 0.8\n"
    )
}

#[tokio::test]
async fn loads_single_and_array_documents_in_filename_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("10-single.yaml"), rule_yaml("r-a", "low")).expect("write");
    std::fs::write(
        dir.path().join("20-batch.yaml"),
        "- id: r-b\n\
         \x20 name: rule r-b\n\
         \x20 condition:\n\
         \x20   when:\n\
         \x20     event_type: file_open\n\
         \x20 outcome:\n\
         \x20   severity: medium\n\
         \x20   confidence: 0.5\n\
         - id: r-c\n\
         \x20 name: rule r-c\n\
         \x20 condition:\n\
         \x20   when:\n\
         \x20     event_type: connect\n\
         \x20 outcome:\n\
         \x20   severity: high\n\
         \x20   confidence: 0.9\n",
    )
    .expect("write");

    let (loader, holder, _) = loader_for(dir.path());
    let snapshot = loader.load_once().expect("load");
    assert_eq!(snapshot.version, 1);
    let ids: Vec<&str> = snapshot.rules.iter().map(|r| r.rule.id.as_str()).collect();
    assert_eq!(ids, vec!["r-a", "r-b", "r-c"]);
    assert_eq!(holder.current().version, 1);
}

#[tokio::test]
async fn invalid_rules_are_skipped_not_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("01-ok.yaml"), rule_yaml("r-ok", "low")).expect("write");
    // Bad severity fails deserialization; only this file is lost.
    std::fs::write(dir.path().join("02-bad.yaml"), rule_yaml("r-bad", "urgent")).expect("write");
    // Unparsable file is skipped whole.
    std::fs::write(dir.path().join("03-garbage.yaml"), ": : :").expect("write");

    let (loader, _, metrics) = loader_for(dir.path());
    let snapshot = loader.load_once().expect("load");
    assert_eq!(snapshot.rules.len(), 1);
    assert_eq!(snapshot.rules[0].rule.id, RuleId::new("r-ok"));
    assert!(metrics.get("rule_parse_errors") >= 2);
}

#[tokio::test]
async fn rule_failing_validation_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut yaml = rule_yaml("r-conf", "low");
    yaml = yaml.replace("confidence: 0.8", "confidence: 1.8");
    std::fs::write(dir.path().join("rule.yaml"), yaml).expect("write");

    let (loader, _, metrics) = loader_for(dir.path());
    assert!(loader.load_once().expect("load").rules.is_empty());
    assert_eq!(metrics.get("rules_rejected"), 1);
}

#[tokio::test]
async fn duplicate_id_later_file_wins() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("10-first.yaml"), rule_yaml("r-dup", "low")).expect("write");
    std::fs::write(dir.path().join("20-second.yaml"), rule_yaml("r-dup", "critical"))
        .expect("write");

    let (loader, _, metrics) = loader_for(dir.path());
    let snapshot = loader.load_once().expect("load");
    assert_eq!(snapshot.rules.len(), 1);
    assert_eq!(
        snapshot.rules[0].rule.outcome.severity,
        warden_model::Severity::Critical
    );
    assert_eq!(metrics.get("rule_id_collisions"), 1);
}

#[tokio::test]
async fn disabled_rules_are_dropped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut yaml = rule_yaml("r-off", "low");
    yaml.push_str("enabled: false\n");
    std::fs::write(dir.path().join("rule.yaml"), yaml).expect("write");

    let (loader, _, _) = loader_for(dir.path());
    assert!(loader.load_once().expect("load").rules.is_empty());
}

#[tokio::test]
async fn versions_increase_strictly_across_reloads() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("rule.yaml"), rule_yaml("r-v", "low")).expect("write");

    let (loader, holder, _) = loader_for(dir.path());
    loader.load_once().expect("load");
    std::fs::write(dir.path().join("rule.yaml"), rule_yaml("r-v", "high")).expect("write");
    loader.load_once().expect("load");

    let snapshot = holder.current();
    assert_eq!(snapshot.version, 2);
    assert_eq!(
        snapshot.rules[0].rule.outcome.severity,
        warden_model::Severity::High
    );
}

#[tokio::test]
async fn window_retention_tracks_largest_rule_window() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        dir.path().join("rule.yaml"),
        "id: r-window\n\
         name: rule r-window\n\
         condition:\n\
         \x20 when:\n\
         \x20   event_type: process_exec\n\
         \x20 window_secs: 900\n\
         outcome:\n\
         \x20 severity: low\n\
         \x20 confidence: 0.8\n",
    )
    .expect("write");

    let holder = Arc::new(SnapshotHolder::new());
    let metrics = Arc::new(Metrics::new());
    let window = Arc::new(WindowBuffer::new(Duration::from_secs(60)));
    let loader = RuleLoader::new(dir.path().to_path_buf(), holder, metrics)
        .resize_window(Arc::clone(&window), Duration::from_secs(60));

    loader.load_once().expect("load");
    assert_eq!(window.max_age(), Duration::from_secs(900));
}

#[tokio::test]
async fn hot_reload_publishes_a_new_snapshot_after_debounce() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("r1.yaml"), rule_yaml("r1", "low")).expect("write");

    let (loader, holder, _) = loader_for(dir.path());
    loader.load_once().expect("load");
    assert_eq!(holder.current().version, 1);

    let cancel = CancellationToken::new();
    let watcher =
        tokio::spawn(Arc::clone(&loader).watch(Duration::from_millis(100), cancel.clone()));
    // Let the watcher attach before mutating the directory.
    tokio::time::sleep(Duration::from_millis(300)).await;

    std::fs::write(dir.path().join("r1.yaml"), rule_yaml("r1", "high")).expect("write");

    let mut reloaded = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = holder.current();
        if snapshot.version >= 2 {
            assert_eq!(
                snapshot.rules[0].rule.outcome.severity,
                warden_model::Severity::High
            );
            reloaded = true;
            break;
        }
    }
    assert!(reloaded, "debounced reload never landed");

    cancel.cancel();
    let _ = watcher.await;
}
