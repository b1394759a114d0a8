//! On-disk artifact byte cache, keyed by checksum.
//!
//! A cache hit skips the catalog fetch; signature verification always
//! re-runs on load, so a corrupted cache entry can annoy but not compromise.

use std::fmt;
use std::path::PathBuf;

use tracing::{debug, warn};
use warden_core::error::{CoreError, Result};
use warden_core::signature::sha256_hex;

pub struct ArtifactCache {
    dir: PathBuf,
}

impl fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactCache").field("dir", &self.dir).finish()
    }
}

impl ArtifactCache {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn entry_path(&self, checksum: &str) -> Option<PathBuf> {
        // Checksums are hex; anything else does not belong in a filename.
        if checksum.is_empty() || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(self.dir.join(checksum))
    }

    /// Cached bytes for `checksum`, re-verified against it on read.
    pub async fn get(&self, checksum: &str) -> Option<Vec<u8>> {
        let path = self.entry_path(checksum)?;
        let bytes = tokio::fs::read(&path).await.ok()?;
        if sha256_hex(&bytes) != checksum {
            warn!(%checksum, "cache entry corrupt, discarding");
            let _ = tokio::fs::remove_file(&path).await;
            return None;
        }
        debug!(%checksum, "artifact cache hit");
        Some(bytes)
    }

    pub async fn put(&self, checksum: &str, bytes: &[u8]) -> Result<()> {
        let path = self
            .entry_path(checksum)
            .ok_or_else(|| CoreError::Invariant(format!("bad checksum {checksum:?}")))?;
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
