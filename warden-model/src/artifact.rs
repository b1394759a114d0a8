use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModelError, Result};
use crate::ids::ArtifactId;

/// Catalog-produced description of a signed probe artifact.
///
/// Immutable once produced; hosts reference it by id. The `parameters` blob
/// is opaque to the control plane and handed to the kernel loader verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub id: ArtifactId,
    pub name: String,
    pub version: String,
    /// Size of the artifact binary in bytes.
    pub size: u64,
    /// Hex-encoded SHA-256 of the binary.
    pub checksum: String,
    /// Base64-encoded signature over the binary.
    pub signature: String,
    /// Opaque attach parameters forwarded to the kernel loader.
    #[serde(default)]
    pub parameters: Value,
    /// Requested probe lifetime; the agent default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime_secs: Option<u64>,
}

impl ArtifactDescriptor {
    /// Boundary validation for descriptors arriving from the catalog.
    pub fn validate(&self) -> Result<()> {
        if self.id.as_str().is_empty() {
            return Err(ModelError::MissingField("id"));
        }
        if self.checksum.is_empty() {
            return Err(ModelError::MissingField("checksum"));
        }
        if self.signature.is_empty() {
            return Err(ModelError::MissingField("signature"));
        }
        if let Some(0) = self.lifetime_secs {
            return Err(ModelError::InvalidField {
                field: "lifetime_secs",
                reason: "must be positive when present".into(),
            });
        }
        Ok(())
    }
}
