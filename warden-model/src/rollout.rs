use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ArtifactId, HostId, RequestId};

/// Phase of a rollout request. Terminal phases are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    Pending,
    CanaryApplying,
    CanaryObserving,
    Fanout,
    FanoutObserving,
    Success,
    RollingBack,
    Done,
    RolledBack,
    Failed,
}

impl RolloutPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutPhase::Done | RolloutPhase::RolledBack | RolloutPhase::Failed
        )
    }
}

impl fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RolloutPhase::Pending => "pending",
            RolloutPhase::CanaryApplying => "canary_applying",
            RolloutPhase::CanaryObserving => "canary_observing",
            RolloutPhase::Fanout => "fanout",
            RolloutPhase::FanoutObserving => "fanout_observing",
            RolloutPhase::Success => "success",
            RolloutPhase::RollingBack => "rolling_back",
            RolloutPhase::Done => "done",
            RolloutPhase::RolledBack => "rolled_back",
            RolloutPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-target progress inside a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Pending,
    Applying,
    Applied,
    RollingBack,
    RolledBack,
    Failed,
    UnknownOutcome,
}

/// How a rollback walks the target set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStrategy {
    Immediate,
    Gradual,
    Selective,
}

/// Why a rollout-level rollback was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutFailureReason {
    CanaryValidationFailed,
    FinalValidationFailed,
    Requested,
    PublishFailed,
}

/// Per-target status row in a rollout snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStatus {
    pub target_id: HostId,
    pub state: TargetState,
    pub canary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Point-in-time view of one rollout, served by the admin surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutSnapshot {
    pub request_id: RequestId,
    pub plan_id: String,
    pub artifact_id: ArtifactId,
    pub phase: RolloutPhase,
    pub targets: Vec<TargetStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<RolloutFailureReason>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases_are_absorbing_markers() {
        assert!(RolloutPhase::Done.is_terminal());
        assert!(RolloutPhase::RolledBack.is_terminal());
        assert!(RolloutPhase::Failed.is_terminal());
        assert!(!RolloutPhase::CanaryObserving.is_terminal());
    }
}
