//! Read-only catalog of signed artifacts, addressable by opaque id.

mod http;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use warden_model::{ArtifactDescriptor, ArtifactId, HostId};

use crate::error::Result;

pub use http::HttpCatalog;
pub use memory::MemoryCatalog;

/// List response for one host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostArtifacts {
    #[serde(default)]
    pub artifacts: Vec<ArtifactDescriptor>,
    #[serde(default)]
    pub total: usize,
    /// Optional server hint overriding the poll interval for the next tick.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_poll_secs: Option<u64>,
}

/// Artifact catalog capability.
#[cfg_attr(feature = "test-util", mockall::automock)]
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Cheap health probe; a failure skips the reconciliation tick.
    async fn health(&self) -> Result<()>;

    /// Authoritative artifact list for one host.
    async fn for_host(&self, host: &HostId) -> Result<HostArtifacts>;

    /// Raw artifact bytes.
    async fn fetch(&self, id: &ArtifactId) -> Result<Vec<u8>>;
}
