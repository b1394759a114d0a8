//! # Warden Rollout Orchestrator
//!
//! Deploys an artifact to a target set with safety guardrails: canary
//! first, observe aggregated telemetry against thresholds, fan out, observe
//! again, finalize. On breach the planner executes an ordered rollback
//! (immediate, gradual, or selective); out-of-band rollback requests ride
//! the same path and are idempotent per `(request_id, target_id)`.

pub mod aggregate;
pub mod http;
pub mod rollback;
pub mod scheduler;

pub use aggregate::AggregateView;
pub use rollback::RollbackPlanner;
pub use scheduler::{ApplyRequest, RollbackRequest, RolloutScheduler};
