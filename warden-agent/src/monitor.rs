//! Threshold monitor: turns sustained telemetry breaches into unloads.
//!
//! A single breach opens an intent; the unload only fires once the breach
//! has held for the configured action delay, so a one-sample spike never
//! rolls a probe back.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_core::clock::Clock;
use warden_core::error::Result;
use warden_core::metrics::Metrics;
use warden_model::{ArtifactId, BreachReason, RollbackReason, Telemetry, ThresholdConfig};

use crate::table::ProbeTable;

/// Evaluate one sample against the thresholds. First breach wins, in the
/// documented order.
pub fn evaluate(telemetry: &Telemetry, config: &ThresholdConfig) -> Option<BreachReason> {
    if telemetry.counters.errors > config.max_errors {
        return Some(BreachReason::ErrorThreshold);
    }
    if telemetry.counters.violations > config.max_violations {
        return Some(BreachReason::ViolationThreshold);
    }
    if telemetry.gauges.cpu_percent > config.max_cpu_percent {
        return Some(BreachReason::HighCpu);
    }
    if telemetry.gauges.latency_ms > config.max_latency_ms {
        return Some(BreachReason::LatencyThreshold);
    }
    if telemetry.gauges.mem_kb > config.max_mem_kb {
        return Some(BreachReason::MemoryThreshold);
    }
    if telemetry.verifier_message.is_some() && config.verifier_failure_is_fatal {
        return Some(BreachReason::VerifierFailure);
    }
    None
}

fn breach_tag(reason: BreachReason) -> &'static str {
    match reason {
        BreachReason::ErrorThreshold => "error_threshold",
        BreachReason::ViolationThreshold => "violation_threshold",
        BreachReason::HighCpu => "high_cpu",
        BreachReason::LatencyThreshold => "latency_threshold",
        BreachReason::MemoryThreshold => "memory_threshold",
        BreachReason::VerifierFailure => "verifier_failure",
    }
}

#[derive(Debug, Clone, Copy)]
struct BreachIntent {
    reason: BreachReason,
    since: Duration,
}

pub struct ThresholdMonitor {
    thresholds: RwLock<ThresholdConfig>,
    intents: Mutex<HashMap<ArtifactId, BreachIntent>>,
    table: Arc<ProbeTable>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for ThresholdMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdMonitor").finish_non_exhaustive()
    }
}

impl ThresholdMonitor {
    pub fn new(
        thresholds: ThresholdConfig,
        table: Arc<ProbeTable>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            thresholds: RwLock::new(thresholds),
            intents: Mutex::new(HashMap::new()),
            table,
            clock,
            metrics,
        }
    }

    /// Hot-swap the threshold configuration. Open intents keep their
    /// original start instant; the next sample re-evaluates under the new
    /// values.
    pub async fn set_thresholds(&self, config: ThresholdConfig) -> Result<()> {
        config.validate()?;
        info!("threshold config replaced");
        *self.thresholds.write().await = config;
        Ok(())
    }

    pub async fn thresholds(&self) -> ThresholdConfig {
        self.thresholds.read().await.clone()
    }

    /// Feed one telemetry sample: update the probe's last-telemetry field
    /// and open, refresh, or clear its breach intent.
    pub async fn observe(&self, telemetry: Telemetry) {
        if !self.table.update_telemetry(&telemetry).await {
            debug!(artifact = %telemetry.artifact_id, "telemetry for unknown probe dropped");
            self.metrics.incr("telemetry_unknown_probe");
            return;
        }

        let config = self.thresholds.read().await.clone();
        let verdict = evaluate(&telemetry, &config);
        let artifact_id = telemetry.artifact_id;

        let mut intents = self.intents.lock().await;
        match verdict {
            Some(reason) => {
                let now = self.clock.monotonic();
                intents
                    .entry(artifact_id.clone())
                    .or_insert_with(|| {
                        warn!(artifact = %artifact_id, breach = breach_tag(reason), "breach intent opened");
                        BreachIntent { reason, since: now }
                    });
                drop(intents);
                self.table.mark_health(&artifact_id, true).await;
            }
            None => {
                if intents.remove(&artifact_id).is_some() {
                    info!(artifact = %artifact_id, "breach cleared before action delay");
                    self.metrics.incr("breach_intents_cleared");
                }
                drop(intents);
                self.table.mark_health(&artifact_id, false).await;
            }
        }
    }

    /// Fire unloads for intents that have held past the action delay.
    pub async fn sweep(&self) {
        let config = self.thresholds.read().await.clone();
        let delay = Duration::from_secs(config.action_delay_secs);
        let now = self.clock.monotonic();

        let due: Vec<(ArtifactId, BreachReason)> = {
            let intents = self.intents.lock().await;
            intents
                .iter()
                .filter(|(_, intent)| now.saturating_sub(intent.since) >= delay)
                .map(|(id, intent)| (id.clone(), intent.reason))
                .collect()
        };

        for (artifact_id, reason) in due {
            warn!(artifact = %artifact_id, breach = breach_tag(reason), "sustained breach, unloading");
            self.metrics.incr("threshold_unloads");
            self.table
                .unload(
                    &artifact_id,
                    RollbackReason::ThresholdBreach,
                    Some(breach_tag(reason)),
                )
                .await;
            self.intents.lock().await.remove(&artifact_id);
        }
    }

    /// Sweep on the configured check interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let interval =
                Duration::from_secs(self.thresholds.read().await.check_interval_secs.max(1));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => self.sweep().await,
            }
        }
        debug!("threshold monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_model::{HostId, TelemetryCounters, TelemetryGauges};

    fn sample(cpu: f64, errors: u64) -> Telemetry {
        Telemetry {
            artifact_id: ArtifactId::from("art-1"),
            host_id: HostId::from("web-1"),
            timestamp: chrono::Utc::now(),
            counters: TelemetryCounters { errors, ..TelemetryCounters::default() },
            gauges: TelemetryGauges { cpu_percent: cpu, ..TelemetryGauges::default() },
            verifier_message: None,
        }
    }

    #[test]
    fn evaluation_order_is_first_breach_wins() {
        let config = ThresholdConfig::default();
        let mut t = sample(95.0, config.max_errors + 1);
        // Both errors and CPU breach; errors is evaluated first.
        assert_eq!(evaluate(&t, &config), Some(BreachReason::ErrorThreshold));
        t.counters.errors = 0;
        assert_eq!(evaluate(&t, &config), Some(BreachReason::HighCpu));
    }

    #[test]
    fn verifier_message_respects_fatal_flag() {
        let mut config = ThresholdConfig::default();
        let mut t = sample(0.0, 0);
        t.verifier_message = Some("invalid mem access".into());
        assert_eq!(evaluate(&t, &config), Some(BreachReason::VerifierFailure));
        config.verifier_failure_is_fatal = false;
        assert_eq!(evaluate(&t, &config), None);
    }

    #[test]
    fn raising_a_threshold_never_adds_breaches() {
        // Threshold monotonicity: any sample breaching under the raised
        // config also breaches under the lower one.
        let low = ThresholdConfig::default();
        let high = ThresholdConfig {
            max_cpu_percent: low.max_cpu_percent + 20.0,
            max_errors: low.max_errors * 2,
            ..low.clone()
        };
        for cpu in [0.0, 50.0, 85.0, 99.0] {
            for errors in [0, 50, 150, 500] {
                let t = sample(cpu, errors);
                if evaluate(&t, &high).is_some() {
                    assert!(evaluate(&t, &low).is_some());
                }
            }
        }
    }
}
