//! Bus message shapes. String forms of enums live here, at the wire
//! boundary; everything inland uses the closed model enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ArtifactId, HostId, RequestId};
use crate::thresholds::ThresholdConfig;

/// Record type discriminator on the `telemetry` subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    ProgramTelemetry,
    ProgramLoaded,
    ProgramUnloaded,
    ProgramError,
    ProgramRolledBack,
    AgentHeartbeat,
}

/// Envelope for every record published on the `telemetry` subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    #[serde(rename = "type")]
    pub kind: TelemetryKind,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    #[serde(default)]
    pub metadata: Value,
}

impl TelemetryEnvelope {
    pub fn new(kind: TelemetryKind, data: Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            data,
            metadata: Value::Null,
        }
    }
}

/// Apply command published on `actions.apply.ebpf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyAction {
    pub request_id: RequestId,
    /// Always `"apply_ebpf"`; kept explicit for foreign consumers.
    pub action: String,
    pub artifact_id: ArtifactId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime_secs: Option<u64>,
    pub targets: Vec<HostId>,
    pub timestamp: DateTime<Utc>,
}

impl ApplyAction {
    pub const ACTION: &'static str = "apply_ebpf";

    pub fn new(
        request_id: RequestId,
        artifact_id: ArtifactId,
        lifetime_secs: Option<u64>,
        targets: Vec<HostId>,
    ) -> Self {
        Self {
            request_id,
            action: Self::ACTION.to_owned(),
            artifact_id,
            lifetime_secs,
            targets,
            timestamp: Utc::now(),
        }
    }
}

/// Rollback command published on `actions.rollback.ebpf`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackAction {
    pub request_id: RequestId,
    /// Always `"rollback_ebpf"`.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<ArtifactId>,
    pub targets: Vec<HostId>,
    pub timestamp: DateTime<Utc>,
}

impl RollbackAction {
    pub const ACTION: &'static str = "rollback_ebpf";

    pub fn new(request_id: RequestId, artifact_id: Option<ArtifactId>, targets: Vec<HostId>) -> Self {
        Self {
            request_id,
            action: Self::ACTION.to_owned(),
            artifact_id,
            targets,
            timestamp: Utc::now(),
        }
    }
}

/// Direct unload command delivered to one agent on `rollback.<host_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRollbackCommand {
    pub artifact_id: ArtifactId,
    #[serde(default)]
    pub reason: String,
}

/// Correlator tunables carried on `config.changed`. All fields optional;
/// absent fields leave the running value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelatorTunables {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_window_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_findings: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_cap: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub never_block_labels: Option<Vec<String>>,
}

/// Live configuration change notice on `config.changed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<ThresholdConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlator: Option<CorrelatorTunables>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_kind_uses_snake_case_wire_names() {
        let json = serde_json::to_string(&TelemetryKind::ProgramRolledBack).expect("serialize");
        assert_eq!(json, "\"program_rolled_back\"");
    }

    #[test]
    fn apply_action_round_trips() {
        let action = ApplyAction::new(
            RequestId::new(),
            ArtifactId::from("art-7"),
            Some(600),
            vec![HostId::from("web-1"), HostId::from("web-2")],
        );
        let json = serde_json::to_string(&action).expect("serialize");
        let back: ApplyAction = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, action);
        assert_eq!(back.action, ApplyAction::ACTION);
    }
}
