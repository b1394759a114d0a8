use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ArtifactId, HostId};

/// Monotonic counters sampled from a running probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryCounters {
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub violations: u64,
    #[serde(default)]
    pub packets: u64,
}

/// Point-in-time gauges sampled from a running probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryGauges {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub mem_kb: u64,
    #[serde(default)]
    pub latency_ms: f64,
}

/// One telemetry sample for one probe on one host. Transient: produced on
/// the host, consumed by bus sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub artifact_id: ArtifactId,
    pub host_id: HostId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub counters: TelemetryCounters,
    #[serde(default)]
    pub gauges: TelemetryGauges,
    /// Kernel verifier diagnostic, present only when the verifier complained.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verifier_message: Option<String>,
}

impl Telemetry {
    pub fn new(artifact_id: ArtifactId, host_id: HostId) -> Self {
        Self {
            artifact_id,
            host_id,
            timestamp: Utc::now(),
            counters: TelemetryCounters::default(),
            gauges: TelemetryGauges::default(),
            verifier_message: None,
        }
    }
}
