//! Core data model definitions shared across Warden crates.
#![allow(missing_docs)]

pub mod artifact;
pub mod error;
pub mod event;
pub mod finding;
pub mod ids;
pub mod probe;
pub mod rollout;
pub mod rule;
pub mod telemetry;
pub mod thresholds;
pub mod wire;

// Intentionally curated re-exports for downstream consumers.
pub use artifact::ArtifactDescriptor;
pub use error::{ModelError, Result as ModelResult};
pub use event::Event;
pub use finding::{Finding, FindingStatus, Severity};
pub use ids::{ArtifactId, FindingId, HostId, OverrideId, RequestId, RuleId};
pub use probe::{BreachReason, ProbeSnapshot, ProbeStatus, RollbackReason};
pub use rollout::{
    RollbackStrategy, RolloutFailureReason, RolloutPhase, RolloutSnapshot, TargetState,
    TargetStatus,
};
pub use rule::{
    EventPattern, Rule, RuleCondition, RuleDedupe, RuleOutcome, RuleOverride, RuleSelector,
};
pub use telemetry::{Telemetry, TelemetryCounters, TelemetryGauges};
pub use thresholds::{RolloutThresholds, ThresholdConfig};
pub use wire::{
    ApplyAction, ConfigChange, CorrelatorTunables, HostRollbackCommand, RollbackAction,
    TelemetryEnvelope, TelemetryKind,
};
