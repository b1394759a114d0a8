use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ArtifactId;
use crate::telemetry::Telemetry;

/// Lifecycle state of a probe inside a host's probe table.
///
/// `Gone` entries are unreachable: the kernel handle has been released
/// before the transition completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Loading,
    Running,
    Failing,
    Unloading,
    Gone,
}

/// Why a probe was (or is being) unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    Expired,
    Manual,
    ThresholdBreach,
    Shutdown,
}

/// First-breach-wins threshold verdicts, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachReason {
    ErrorThreshold,
    ViolationThreshold,
    HighCpu,
    LatencyThreshold,
    MemoryThreshold,
    VerifierFailure,
}

/// Read-only view of one probe table entry, served by the admin surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSnapshot {
    pub artifact_id: ArtifactId,
    pub name: String,
    pub version: String,
    pub status: ProbeStatus,
    /// Seconds until the lifetime deadline; zero once expired.
    pub remaining_lifetime_secs: u64,
    pub loaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_telemetry: Option<Telemetry>,
}
