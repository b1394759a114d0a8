//! End-to-end evaluation pipeline tests with deterministic fakes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use warden_core::bus::{Bus, InProcBus};
use warden_core::clock::ManualClock;
use warden_core::metrics::Metrics;
use warden_correlator::config_stream::{LiveConfig, Tunables};
use warden_correlator::evaluator::Evaluator;
use warden_correlator::findings::FindingStore;
use warden_correlator::labels::HostLabelsCache;
use warden_correlator::overrides::OverrideStore;
use warden_correlator::snapshot::{CompiledRule, RuleSnapshot, SnapshotHolder};
use warden_correlator::window::WindowBuffer;
use warden_model::{
    Event, EventPattern, Finding, HostId, OverrideId, Rule, RuleCondition, RuleDedupe, RuleId,
    RuleOutcome, RuleOverride, RuleSelector, Severity,
};

struct Harness {
    clock: Arc<ManualClock>,
    bus: Arc<InProcBus>,
    snapshots: Arc<SnapshotHolder>,
    overrides: Arc<OverrideStore>,
    findings: Arc<FindingStore>,
    evaluator: Evaluator,
}

fn tunables() -> Tunables {
    Tunables {
        rule_window: Duration::from_secs(60),
        label_ttl: Duration::from_secs(600),
        debounce: Duration::from_millis(100),
        max_findings: 1000,
        dedupe_cap: 1000,
        never_block_labels: HashSet::new(),
    }
}

fn harness(never_block: &[&str]) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let bus = Arc::new(InProcBus::new(64));
    let metrics = Arc::new(Metrics::new());
    let snapshots = Arc::new(SnapshotHolder::new());
    let overrides = Arc::new(OverrideStore::new(Arc::clone(&metrics)));
    let findings = Arc::new(FindingStore::new(1000, 1000));
    let mut t = tunables();
    t.never_block_labels = never_block.iter().map(|s| s.to_string()).collect();
    let live = Arc::new(LiveConfig::new(t));

    let evaluator = Evaluator {
        window: Arc::new(WindowBuffer::new(Duration::from_secs(600))),
        labels: Arc::new(HostLabelsCache::new()),
        snapshots: Arc::clone(&snapshots),
        overrides: Arc::clone(&overrides),
        findings: Arc::clone(&findings),
        live,
        clock: Arc::clone(&clock) as _,
        bus: Arc::clone(&bus) as _,
        metrics,
    };
    Harness {
        clock,
        bus,
        snapshots,
        overrides,
        findings,
        evaluator,
    }
}

fn exec_rule(id: &str, severity: Severity) -> Rule {
    Rule {
        id: RuleId::new(id),
        name: format!("exec rule {id}"),
        version: "1".into(),
        enabled: true,
        selector: RuleSelector::default(),
        condition: RuleCondition {
            when: EventPattern {
                event_type: Some("process_exec".into()),
                ..EventPattern::default()
            },
            requires_prior: None,
            window_secs: None,
        },
        outcome: RuleOutcome {
            severity,
            confidence: 0.8,
            evidence: vec!["{event_type} of {args.argv0} on {host_id}".into()],
        },
        dedupe: RuleDedupe {
            key_template: "{rule.id}:{host_id}".into(),
            cooldown_secs: 300,
        },
        lifetime_secs: 600,
    }
}

fn publish(holder: &SnapshotHolder, version: u64, rules: Vec<Rule>) {
    let compiled = rules
        .into_iter()
        .map(|r| CompiledRule::compile(r).expect("compile"))
        .collect();
    holder.publish(RuleSnapshot { version, rules: compiled });
}

fn exec_event(host: &str, argv0: &str) -> Event {
    let mut event = Event::new(HostId::from(host), "process_exec");
    event.args.insert("argv0".into(), argv0.into());
    event
}

#[tokio::test]
async fn matching_event_emits_rendered_finding() {
    let h = harness(&[]);
    publish(&h.snapshots, 1, vec![exec_rule("r1", Severity::High)]);
    let mut sink = h.bus.subscribe("findings").await.expect("subscribe");

    let emitted = h.evaluator.process(exec_event("web-1", "/usr/bin/curl")).await;
    assert_eq!(emitted.len(), 1);
    let finding = &emitted[0];
    assert_eq!(finding.rule_id, RuleId::new("r1"));
    assert_eq!(finding.rule_snapshot_version, 1);
    assert_eq!(finding.severity, Severity::High);
    assert_eq!(finding.evidence, vec!["process_exec of /usr/bin/curl on web-1"]);

    // The same finding went to the sink subject.
    let message = tokio::time::timeout(Duration::from_secs(2), sink.recv())
        .await
        .expect("delivery")
        .expect("message");
    let published: Finding = message.json().expect("decode");
    assert_eq!(published.id, finding.id);
}

#[tokio::test]
async fn non_matching_event_is_silent() {
    let h = harness(&[]);
    publish(&h.snapshots, 1, vec![exec_rule("r1", Severity::Low)]);
    let emitted = h
        .evaluator
        .process(Event::new(HostId::from("web-1"), "file_open"))
        .await;
    assert!(emitted.is_empty());
    assert!(h.findings.is_empty());
}

#[tokio::test]
async fn requires_prior_looks_back_within_the_window() {
    let h = harness(&[]);
    let mut rule = exec_rule("r-prior", Severity::Medium);
    rule.condition.requires_prior = Some(EventPattern {
        event_type: Some("package_installed".into()),
        ..EventPattern::default()
    });
    rule.condition.window_secs = Some(30);
    publish(&h.snapshots, 1, vec![rule]);

    // No prior event: no finding.
    assert!(h.evaluator.process(exec_event("web-1", "/tmp/payload")).await.is_empty());

    // Prior inside the window: finding fires.
    h.evaluator
        .process(Event::new(HostId::from("web-1"), "package_installed"))
        .await;
    h.clock.advance(Duration::from_secs(10));
    let emitted = h.evaluator.process(exec_event("web-1", "/tmp/payload")).await;
    assert_eq!(emitted.len(), 1);

    // Prior on another host does not count.
    h.evaluator
        .process(Event::new(HostId::from("db-1"), "package_installed"))
        .await;
    assert!(h.evaluator.process(exec_event("web-9", "/tmp/payload")).await.is_empty());
}

#[tokio::test]
async fn prior_outside_window_does_not_fire() {
    let h = harness(&[]);
    let mut rule = exec_rule("r-prior-2", Severity::Medium);
    rule.condition.requires_prior = Some(EventPattern {
        event_type: Some("package_installed".into()),
        ..EventPattern::default()
    });
    rule.condition.window_secs = Some(30);
    publish(&h.snapshots, 1, vec![rule]);

    h.evaluator
        .process(Event::new(HostId::from("web-1"), "package_installed"))
        .await;
    h.clock.advance(Duration::from_secs(31));
    assert!(h.evaluator.process(exec_event("web-1", "/tmp/payload")).await.is_empty());
}

#[tokio::test]
async fn dedupe_cooldown_suppresses_then_releases() {
    let h = harness(&[]);
    publish(&h.snapshots, 1, vec![exec_rule("r-dedupe", Severity::Low)]);

    assert_eq!(h.evaluator.process(exec_event("web-1", "/bin/a")).await.len(), 1);
    h.clock.advance(Duration::from_secs(100));
    // Same dedupe key within cooldown: suppressed.
    assert!(h.evaluator.process(exec_event("web-1", "/bin/b")).await.is_empty());
    // Different host renders a different key: emits.
    assert_eq!(h.evaluator.process(exec_event("web-2", "/bin/b")).await.len(), 1);
    // Past the cooldown the key releases.
    h.clock.advance(Duration::from_secs(201));
    assert_eq!(h.evaluator.process(exec_event("web-1", "/bin/c")).await.len(), 1);
    assert_eq!(h.findings.stats().deduplicated, 1);
}

#[tokio::test]
async fn label_selector_gates_by_host_labels() {
    let h = harness(&[]);
    let mut rule = exec_rule("r-labels", Severity::Low);
    rule.selector = RuleSelector {
        labels: ["env:prod".to_owned()].into(),
        ..RuleSelector::default()
    };
    publish(&h.snapshots, 1, vec![rule]);

    // Host without the label: rule not effective.
    assert!(h.evaluator.process(exec_event("web-1", "/bin/x")).await.is_empty());

    // An event carrying the label teaches the cache; same-event evaluation
    // already sees it.
    let mut labeled = exec_event("web-2", "/bin/x");
    labeled.context.insert("labels".into(), serde_json::json!("env:prod"));
    assert_eq!(h.evaluator.process(labeled).await.len(), 1);
}

#[tokio::test]
async fn never_block_label_exempts_host() {
    let h = harness(&["env:exempt"]);
    publish(&h.snapshots, 1, vec![exec_rule("r-nb", Severity::Critical)]);

    let mut event = exec_event("web-1", "/bin/x");
    event.context.insert("labels".into(), serde_json::json!("env:exempt"));
    assert!(h.evaluator.process(event).await.is_empty());
    assert!(h.findings.is_empty());
}

#[tokio::test]
async fn override_disable_then_remove_restores_findings() {
    let h = harness(&[]);
    let mut rule = exec_rule("r2", Severity::Medium);
    // Unique dedupe key per event so dedupe never masks the override.
    rule.dedupe.key_template = "{rule.id}:{timestamp}".into();
    publish(&h.snapshots, 1, vec![rule]);

    // Baseline: the rule fires.
    assert_eq!(h.evaluator.process(exec_event("web-1", "/bin/a")).await.len(), 1);

    // Disabled by override: silent.
    let now = chrono::Utc::now();
    let override_id = h
        .overrides
        .upsert(RuleOverride {
            id: OverrideId::new(),
            rule_id: RuleId::new("r2"),
            enabled: Some(false),
            severity: None,
            confidence: None,
            lifetime_secs: None,
            description: Some("quiet during incident".into()),
            created_at: now,
            updated_at: now,
        })
        .expect("upsert");
    h.clock.advance(Duration::from_secs(1));
    assert!(h.evaluator.process(exec_event("web-1", "/bin/b")).await.is_empty());

    // Removed: findings resume.
    assert!(h.overrides.remove(&override_id));
    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.evaluator.process(exec_event("web-1", "/bin/c")).await.len(), 1);
}

#[tokio::test]
async fn override_severity_shadows_rule_severity() {
    let h = harness(&[]);
    publish(&h.snapshots, 1, vec![exec_rule("r3", Severity::Low)]);

    let now = chrono::Utc::now();
    h.overrides
        .upsert(RuleOverride {
            id: OverrideId::new(),
            rule_id: RuleId::new("r3"),
            enabled: None,
            severity: Some(Severity::Critical),
            confidence: Some(1.0),
            lifetime_secs: None,
            description: None,
            created_at: now,
            updated_at: now,
        })
        .expect("upsert");

    let emitted = h.evaluator.process(exec_event("web-1", "/bin/a")).await;
    assert_eq!(emitted[0].severity, Severity::Critical);
    assert_eq!(emitted[0].confidence, 1.0);
}

#[tokio::test]
async fn replay_produces_the_same_findings() {
    let events = vec![
        exec_event("web-1", "/bin/a"),
        Event::new(HostId::from("web-1"), "file_open"),
        exec_event("web-2", "/bin/b"),
        exec_event("web-1", "/bin/c"),
    ];

    let run = |events: Vec<Event>| async {
        let h = harness(&[]);
        publish(&h.snapshots, 1, vec![exec_rule("r-replay", Severity::High)]);
        let mut out = Vec::new();
        for event in events {
            for finding in h.evaluator.process(event).await {
                out.push((finding.rule_id, finding.host_id, finding.severity));
            }
            h.clock.advance(Duration::from_secs(1));
        }
        out
    };

    let first = run(events.clone()).await;
    let second = run(events).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn malformed_event_counts_and_continues() {
    let h = harness(&[]);
    publish(&h.snapshots, 1, vec![exec_rule("r-bad", Severity::Low)]);

    let message = warden_core::bus::BusMessage {
        subject: "events.enriched".into(),
        payload: b"not json".to_vec(),
    };
    assert!(h.evaluator.process_message(&message).await.is_empty());
    assert_eq!(h.evaluator.metrics.get("invalid_events"), 1);

    // The pipeline is still healthy afterwards.
    assert_eq!(h.evaluator.process(exec_event("web-1", "/bin/a")).await.len(), 1);
}
