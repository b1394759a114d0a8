//! The evaluation pipeline: one inbound event in, zero or more deduped
//! findings out.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use warden_core::bus::{Bus, BusMessage};
use warden_core::clock::Clock;
use warden_core::metrics::Metrics;
use warden_core::subjects;
use warden_model::{Event, Finding, FindingId, FindingStatus};

use crate::config_stream::LiveConfig;
use crate::findings::FindingStore;
use crate::labels::{HostLabelsCache, extract_labels};
use crate::overrides::OverrideStore;
use crate::snapshot::SnapshotHolder;
use crate::template::render;
use crate::window::WindowBuffer;

pub struct Evaluator {
    pub window: Arc<WindowBuffer>,
    pub labels: Arc<HostLabelsCache>,
    pub snapshots: Arc<SnapshotHolder>,
    pub overrides: Arc<OverrideStore>,
    pub findings: Arc<FindingStore>,
    pub live: Arc<LiveConfig>,
    pub clock: Arc<dyn Clock>,
    pub bus: Arc<dyn Bus>,
    pub metrics: Arc<Metrics>,
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator").finish_non_exhaustive()
    }
}

impl Evaluator {
    /// Decode one bus message and process it. Malformed events count and
    /// are acked by dropping.
    pub async fn process_message(&self, message: &BusMessage) -> Vec<Finding> {
        match message.json::<Event>() {
            Ok(event) => self.process(event).await,
            Err(e) => {
                debug!(subject = %message.subject, "malformed event dropped: {e}");
                self.metrics.incr("invalid_events");
                Vec::new()
            }
        }
    }

    /// Evaluate one event against the current snapshot. Returns the
    /// findings that survived dedupe (already stored and published).
    pub async fn process(&self, event: Event) -> Vec<Finding> {
        let now = self.clock.monotonic();
        let tunables = self.live.get();
        self.metrics.incr("events_processed");

        // 1. The event joins its host's window before matching, so a rule
        //    whose prior pattern equals its when pattern sees earlier
        //    occurrences but never the current one.
        self.window.push(event.clone(), now);

        // 2. Label refresh from event context.
        let seen_labels = extract_labels(&event);
        self.labels
            .refresh(&event.host_id, &seen_labels, now, tunables.label_ttl);
        let labels = self.labels.labels_for(&event.host_id, now);

        if labels
            .iter()
            .any(|label| tunables.never_block_labels.contains(label))
        {
            self.metrics.incr("events_exempt_host");
            return Vec::new();
        }

        // 3. Resolve effective rules for (host, labels).
        let snapshot = self.snapshots.current();
        let mut emitted = Vec::new();
        for compiled in snapshot.effective_rules(&event.host_id, &labels) {
            // 4. Override layering, then condition evaluation.
            let rule = self.overrides.apply(&compiled.rule);
            if !rule.enabled {
                continue;
            }
            if !rule.condition.when.matches(&event) {
                continue;
            }
            if let Some(prior_pattern) = &rule.condition.requires_prior {
                let window = rule
                    .condition
                    .window_secs
                    .map(Duration::from_secs)
                    .unwrap_or(tunables.rule_window);
                let priors = self.window.recent_events(&event.host_id, window, now);
                let current = event.occurrence_key();
                let matched = priors
                    .iter()
                    .filter(|prior| prior.occurrence_key() != current)
                    .any(|prior| prior_pattern.matches(prior));
                if !matched {
                    continue;
                }
            }

            // 5. Render, dedupe, emit.
            let finding = Finding {
                id: FindingId::new(),
                rule_id: rule.id.clone(),
                rule_snapshot_version: snapshot.version,
                host_id: event.host_id.clone(),
                severity: rule.outcome.severity,
                confidence: rule.outcome.confidence,
                status: FindingStatus::Active,
                evidence: rule
                    .outcome
                    .evidence
                    .iter()
                    .map(|template| render(template, &event, &rule))
                    .collect(),
                created_at: self.clock.wall(),
                lifetime_secs: rule.lifetime_secs,
            };
            let dedupe_key = render(&rule.dedupe.key_template, &event, &rule);
            let cooldown = Duration::from_secs(rule.dedupe.cooldown_secs);
            if !self.findings.insert(finding.clone(), &dedupe_key, now, cooldown) {
                self.metrics.incr("findings_deduplicated");
                continue;
            }
            self.metrics.incr("findings_emitted");
            if let Err(e) =
                warden_core::bus::publish_json(self.bus.as_ref(), subjects::FINDINGS, &finding)
                    .await
            {
                warn!(kind = e.kind(), "finding publish failed: {e}");
            }
            emitted.push(finding);
        }
        emitted
    }
}
