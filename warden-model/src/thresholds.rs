use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Safety thresholds applied to per-probe telemetry on the host agent.
///
/// Hot-swappable process-wide state; the config stream replaces it whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub max_errors: u64,
    pub max_violations: u64,
    pub max_cpu_percent: f64,
    pub max_latency_ms: f64,
    pub max_mem_kb: u64,
    pub verifier_failure_is_fatal: bool,
    /// How often the monitor sweeps breach intents. Strictly positive.
    pub check_interval_secs: u64,
    /// How long a breach must persist before the unload fires.
    pub action_delay_secs: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            max_errors: 100,
            max_violations: 50,
            max_cpu_percent: 80.0,
            max_latency_ms: 250.0,
            max_mem_kb: 262_144,
            verifier_failure_is_fatal: true,
            check_interval_secs: 5,
            action_delay_secs: 10,
        }
    }
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<()> {
        if self.check_interval_secs == 0 {
            return Err(ModelError::InvalidField {
                field: "check_interval_secs",
                reason: "must be strictly positive".into(),
            });
        }
        if self.max_cpu_percent <= 0.0 {
            return Err(ModelError::InvalidField {
                field: "max_cpu_percent",
                reason: "must be strictly positive".into(),
            });
        }
        if self.max_latency_ms <= 0.0 {
            return Err(ModelError::InvalidField {
                field: "max_latency_ms",
                reason: "must be strictly positive".into(),
            });
        }
        Ok(())
    }
}

/// Aggregate-level thresholds evaluated by the rollout observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutThresholds {
    pub max_violations: u64,
    /// Errors per telemetry sample, averaged over the window.
    pub max_error_rate: f64,
    pub max_latency_ms: f64,
    /// Fraction of targets that reported at least one clean sample.
    pub min_success_rate: f64,
}

impl Default for RolloutThresholds {
    fn default() -> Self {
        Self {
            max_violations: 10,
            max_error_rate: 1.0,
            max_latency_ms: 500.0,
            min_success_rate: 0.9,
        }
    }
}

impl RolloutThresholds {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_success_rate) {
            return Err(ModelError::InvalidField {
                field: "min_success_rate",
                reason: format!("{} outside [0, 1]", self.min_success_rate),
            });
        }
        Ok(())
    }
}
