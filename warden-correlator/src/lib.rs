//! # Warden Correlator
//!
//! Streaming rule engine: ingests enriched host events, evaluates the
//! current rule snapshot over a per-host sliding window (with prior-event
//! predicates), deduplicates findings under cooldowns, and emits them to
//! the finding sink. Rules hot-reload from disk; overrides and tunables
//! update live without a restart.

pub mod config_stream;
pub mod evaluator;
pub mod findings;
pub mod http;
pub mod labels;
pub mod loader;
pub mod overrides;
pub mod runtime;
pub mod snapshot;
pub mod template;
pub mod window;

pub use evaluator::Evaluator;
pub use findings::FindingStore;
pub use loader::RuleLoader;
pub use overrides::OverrideStore;
pub use runtime::{CorrelatorHandle, CorrelatorRuntime};
pub use snapshot::{CompiledRule, RuleSnapshot, SnapshotHolder};
pub use window::WindowBuffer;
