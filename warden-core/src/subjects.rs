//! Logical bus subject names. Kept in one place so the agent, correlator,
//! and rollout cores never drift on spelling.

use warden_model::HostId;

pub const TELEMETRY: &str = "telemetry";
pub const ACTIONS_APPLY_EBPF: &str = "actions.apply.ebpf";
pub const ACTIONS_ROLLBACK_EBPF: &str = "actions.rollback.ebpf";
pub const EVENTS_RAW: &str = "events.raw";
pub const EVENTS_ENRICHED: &str = "events.enriched";
pub const FINDINGS: &str = "findings";
pub const CONFIG_CHANGED: &str = "config.changed";

/// Per-host rollback command subject.
pub fn rollback_for(host: &HostId) -> String {
    format!("rollback.{host}")
}
