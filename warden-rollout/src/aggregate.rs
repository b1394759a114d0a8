//! Aggregated telemetry view, fed from the `telemetry` subject.
//!
//! The scheduler evaluates observation windows against this view; the
//! rollback planner uses it to see per-target rollback acks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warden_core::bus::Bus;
use warden_core::clock::Clock;
use warden_core::metrics::Metrics;
use warden_core::subjects;
use warden_model::{ArtifactId, HostId, RolloutThresholds, Telemetry, TelemetryEnvelope, TelemetryKind};

/// Retention for raw samples; anything older than this is swept.
const SAMPLE_RETENTION: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, Copy)]
struct Sample {
    arrived: Duration,
    errors: u64,
    violations: u64,
    latency_ms: f64,
}

impl Sample {
    fn clean(&self) -> bool {
        self.errors == 0 && self.violations == 0
    }
}

#[derive(Default)]
struct State {
    samples: HashMap<HostId, VecDeque<Sample>>,
    /// `(host, artifact)` rollback acks with arrival instants.
    acks: Vec<(HostId, ArtifactId, Duration)>,
}

/// Verdict for one observation checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservationVerdict {
    Pass,
    Breach(&'static str),
}

/// Aggregate stats over one window for one target set.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowStats {
    pub samples: u64,
    pub violations: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
    pub hosts_reporting_clean: usize,
}

pub struct AggregateView {
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    state: Mutex<State>,
}

impl fmt::Debug for AggregateView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateView").finish_non_exhaustive()
    }
}

impl AggregateView {
    pub fn new(clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        Self {
            clock,
            metrics,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record one probe telemetry sample.
    pub fn record(&self, telemetry: &Telemetry) {
        let arrived = self.clock.monotonic();
        let sample = Sample {
            arrived,
            errors: telemetry.counters.errors,
            violations: telemetry.counters.violations,
            latency_ms: telemetry.gauges.latency_ms,
        };
        let mut state = self.lock();
        let ring = state.samples.entry(telemetry.host_id.clone()).or_default();
        while matches!(ring.front(), Some(s) if arrived.saturating_sub(s.arrived) > SAMPLE_RETENTION)
        {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    /// Record a rollback ack for `(host, artifact)`.
    pub fn record_ack(&self, host: HostId, artifact: ArtifactId) {
        let arrived = self.clock.monotonic();
        self.lock().acks.push((host, artifact, arrived));
    }

    /// True once an ack for `(host, artifact)` arrived at or after `since`.
    pub fn acked_since(&self, host: &HostId, artifact: &ArtifactId, since: Duration) -> bool {
        self.lock()
            .acks
            .iter()
            .any(|(h, a, at)| h == host && a == artifact && *at >= since)
    }

    /// Aggregate stats for `targets` over samples that arrived within
    /// `window` of now.
    pub fn window_stats(&self, targets: &[HostId], window: Duration) -> WindowStats {
        let now = self.clock.monotonic();
        let cutoff = now.saturating_sub(window);
        let state = self.lock();

        let mut stats = WindowStats {
            samples: 0,
            violations: 0,
            errors: 0,
            avg_latency_ms: 0.0,
            hosts_reporting_clean: 0,
        };
        let mut latency_total = 0.0;
        let target_set: HashSet<&HostId> = targets.iter().collect();
        for (host, ring) in &state.samples {
            if !target_set.contains(host) {
                continue;
            }
            let mut clean = false;
            for sample in ring.iter().filter(|s| s.arrived >= cutoff) {
                stats.samples += 1;
                stats.violations += sample.violations;
                stats.errors += sample.errors;
                latency_total += sample.latency_ms;
                clean |= sample.clean();
            }
            if clean {
                stats.hosts_reporting_clean += 1;
            }
        }
        if stats.samples > 0 {
            stats.avg_latency_ms = latency_total / stats.samples as f64;
        }
        stats
    }

    /// Evaluate one checkpoint. `final_checkpoint` additionally enforces
    /// the zero-telemetry rule and the success-rate floor, which only make
    /// sense once the window has fully elapsed.
    pub fn evaluate(
        &self,
        targets: &[HostId],
        window: Duration,
        thresholds: &RolloutThresholds,
        final_checkpoint: bool,
    ) -> ObservationVerdict {
        let stats = self.window_stats(targets, window);
        if stats.violations > thresholds.max_violations {
            return ObservationVerdict::Breach("violations");
        }
        if stats.samples > 0 {
            let error_rate = stats.errors as f64 / stats.samples as f64;
            if error_rate > thresholds.max_error_rate {
                return ObservationVerdict::Breach("error_rate");
            }
            if stats.avg_latency_ms > thresholds.max_latency_ms {
                return ObservationVerdict::Breach("latency");
            }
        }
        if final_checkpoint {
            // Silent agents are indistinguishable from unhealthy ones.
            if stats.samples == 0 {
                return ObservationVerdict::Breach("no_telemetry");
            }
            let success_rate = stats.hosts_reporting_clean as f64 / targets.len().max(1) as f64;
            if success_rate < thresholds.min_success_rate {
                return ObservationVerdict::Breach("success_rate");
            }
        }
        ObservationVerdict::Pass
    }

    /// JSON snapshot for the admin surface.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.lock();
        let hosts: Vec<_> = state
            .samples
            .iter()
            .map(|(host, ring)| {
                json!({
                    "host_id": host,
                    "samples": ring.len(),
                    "last_errors": ring.back().map(|s| s.errors),
                    "last_violations": ring.back().map(|s| s.violations),
                })
            })
            .collect();
        json!({"hosts": hosts, "acks": state.acks.len()})
    }

    /// Consume the telemetry subject until cancelled.
    pub async fn run(self: Arc<Self>, bus: Arc<dyn Bus>, cancel: CancellationToken) {
        let mut subscription = match bus.subscribe(subjects::TELEMETRY).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("telemetry subscription failed: {e}");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = subscription.recv() => {
                    let Some(message) = message else { break };
                    match message.json::<TelemetryEnvelope>() {
                        Ok(envelope) => self.ingest(envelope),
                        Err(e) => {
                            debug!("malformed telemetry dropped: {e}");
                            self.metrics.incr("malformed_telemetry");
                        }
                    }
                }
            }
        }
        debug!("aggregate view stopped");
    }

    fn ingest(&self, envelope: TelemetryEnvelope) {
        match envelope.kind {
            TelemetryKind::ProgramTelemetry => {
                match serde_json::from_value::<Telemetry>(envelope.data) {
                    Ok(telemetry) => self.record(&telemetry),
                    Err(e) => {
                        debug!("telemetry payload undecodable: {e}");
                        self.metrics.incr("malformed_telemetry");
                    }
                }
            }
            TelemetryKind::ProgramRolledBack => {
                let host = envelope.data.get("host_id").and_then(|v| v.as_str());
                let artifact = envelope.data.get("artifact_id").and_then(|v| v.as_str());
                if let (Some(host), Some(artifact)) = (host, artifact) {
                    self.record_ack(HostId::new(host), ArtifactId::new(artifact));
                }
            }
            _ => {}
        }
    }
}
