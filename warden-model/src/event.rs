use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::HostId;

/// Enriched host event consumed by the correlator.
///
/// `args` carries exec-style arguments, `context` carries enrichment added
/// upstream (labels, package info, ancestry). Both are free-form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub host_id: HostId,
    pub event_type: String,
    #[serde(default)]
    pub binary_path: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl Event {
    pub fn new(host_id: HostId, event_type: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            host_id,
            event_type: event_type.into(),
            binary_path: String::new(),
            args: BTreeMap::new(),
            context: BTreeMap::new(),
        }
    }

    /// Identity used to exclude the current event from prior-event matches:
    /// two events are the same occurrence iff timestamp and type agree.
    pub fn occurrence_key(&self) -> (DateTime<Utc>, &str) {
        (self.timestamp, self.event_type.as_str())
    }
}
