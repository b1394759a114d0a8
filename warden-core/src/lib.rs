//! Shared infrastructure for the Warden control plane.
//!
//! This crate defines the capability seams every core talks through — the
//! message bus, the artifact catalog, signature verification, the kernel
//! loader, and the clock — together with their production implementations
//! and the deterministic in-memory fakes the test suites run against.
//! Business logic lives in the service crates; nothing here knows about
//! probes, rules, or rollouts beyond the shared model types.

pub mod bus;
pub mod catalog;
pub mod clock;
pub mod error;
pub mod kernel;
pub mod metrics;
pub mod shutdown;
pub mod signature;
pub mod subjects;

pub use bus::{Bus, BusMessage, BusSubscription, InProcBus, NatsBus};
pub use catalog::{Catalog, HostArtifacts, HttpCatalog, MemoryCatalog};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, Result};
pub use kernel::{FakeKernelLoader, KernelLoader, LoadError, ProbeHandle};
pub use metrics::Metrics;
pub use signature::{HmacSha256Verifier, SignatureVerifier, sha256_hex, sign};
