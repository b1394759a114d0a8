//! Shared configuration library for Warden.
//!
//! Centralizes environment-variable bindings, defaults, and validation for
//! the three service binaries so there is a single source of truth for
//! recognized options. Each config struct can be built `from_env()` (the
//! binaries do this at startup) or assembled directly in tests.

pub mod agent;
pub mod correlator;
pub mod env;
pub mod error;
pub mod rollout;

pub use agent::AgentConfig;
pub use correlator::CorrelatorConfig;
pub use error::{ConfigError, Result};
pub use rollout::RolloutConfig;
