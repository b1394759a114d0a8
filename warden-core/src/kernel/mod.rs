//! Kernel loader capability.
//!
//! The loader is opaque to the control plane: it accepts verified object
//! bytes plus attach parameters and yields a handle. Verifier diagnostics
//! surface through [`LoadError`] so the agent can report them without
//! understanding them.

mod fake;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use fake::FakeKernelLoader;

/// Opaque handle to a loaded probe. Only meaningful to the loader that
/// issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeHandle(pub u64);

impl fmt::Display for ProbeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "probe-{}", self.0)
    }
}

/// Attach/detach failures, including kernel-verifier rejections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The in-kernel verifier rejected the object; `diagnostic` carries its
    /// log verbatim.
    #[error("verifier rejected object: {diagnostic}")]
    VerifierRejected { diagnostic: String },

    #[error("object is not loadable: {0}")]
    InvalidObject(String),

    #[error("kernel resources exhausted")]
    Exhausted,

    #[error("unknown handle {0}")]
    UnknownHandle(ProbeHandle),

    #[error("loader IO: {0}")]
    Io(String),
}

impl LoadError {
    /// Verifier diagnostics, when this failure carries any.
    pub fn verifier_diagnostic(&self) -> Option<&str> {
        match self {
            LoadError::VerifierRejected { diagnostic } => Some(diagnostic),
            _ => None,
        }
    }
}

/// Kernel loader capability.
#[async_trait]
pub trait KernelLoader: Send + Sync {
    /// Load `object` with `params` and return the live handle.
    async fn attach(
        &self,
        object: &[u8],
        params: &serde_json::Value,
    ) -> Result<ProbeHandle, LoadError>;

    /// Release a handle. Idempotence is the caller's concern; detaching an
    /// unknown handle is an error here.
    async fn detach(&self, handle: ProbeHandle) -> Result<(), LoadError>;
}
