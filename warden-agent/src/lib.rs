//! # Warden Host Agent
//!
//! Reconciles the set of probes the catalog assigns to this host with the
//! set actually loaded in the kernel, honoring lifetime deadlines and
//! safety thresholds, and emits structured telemetry for every lifecycle
//! transition.
//!
//! ## Architecture
//!
//! Long-lived tasks on the shared runtime:
//! - the reconciler polls the catalog and drives loads,
//! - the expiry scanner fires lifetime deadlines,
//! - the threshold monitor turns sustained breaches into unloads,
//! - the rollback listener honors `rollback.<host_id>` commands,
//! - the telemetry publisher drains the bounded emission queue,
//! - the heartbeat task reports liveness.
//!
//! All probe mutations funnel through [`table::ProbeTable`]; no lock is
//! held across a network or kernel call.

pub mod cache;
pub mod http;
pub mod monitor;
pub mod reconciler;
pub mod rollback;
pub mod runtime;
pub mod table;
pub mod telemetry;

pub use runtime::{AgentHandle, AgentRuntime};
pub use table::{ProbeTable, UnloadOutcome};
