use thiserror::Error;

use crate::kernel::LoadError;

/// Error taxonomy shared by the service crates.
///
/// Each variant maps to one recovery policy: transient I/O retries on the
/// next natural tick, signature failures are fatal for the one artifact,
/// validation rejects at the boundary, capacity degrades with a counter,
/// invariant violations abort the one operation, and startup failures exit
/// the process.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("bus error: {0}")]
    Bus(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("signature verification failed for artifact {artifact}")]
    SignatureRejected { artifact: String },

    #[error("kernel load error: {0}")]
    Load(#[from] LoadError),

    #[error("validation error: {0}")]
    Validation(#[from] warden_model::ModelError),

    #[error("capacity exceeded: {0}")]
    Capacity(&'static str),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("startup error: {0}")]
    Startup(String),
}

impl CoreError {
    /// Stable kind tag suitable for alerting; never derived from the
    /// message string.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Bus(_) => "bus_io",
            CoreError::Catalog(_) => "catalog_io",
            CoreError::SignatureRejected { .. } => "signature",
            CoreError::Load(_) => "kernel_load",
            CoreError::Validation(_) => "validation",
            CoreError::Capacity(_) => "capacity",
            CoreError::Invariant(_) => "invariant",
            CoreError::NotFound(_) => "not_found",
            CoreError::Serialization(_) => "serialization",
            CoreError::Io(_) => "io",
            CoreError::Startup(_) => "startup",
        }
    }

    /// Transient errors are retried on the next natural tick and never
    /// escalate.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoreError::Bus(_) | CoreError::Catalog(_) | CoreError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
