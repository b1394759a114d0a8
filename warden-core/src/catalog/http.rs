use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use warden_model::{ArtifactId, HostId};

use super::{Catalog, HostArtifacts};
use crate::error::{CoreError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Catalog client over the registry HTTP surface.
pub struct HttpCatalog {
    base: reqwest::Url,
    client: reqwest::Client,
}

impl fmt::Debug for HttpCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCatalog").field("base", &self.base.as_str()).finish()
    }
}

impl HttpCatalog {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = reqwest::Url::parse(base_url)
            .map_err(|e| CoreError::Startup(format!("registry url {base_url}: {e}")))?;
        // Joining relative paths drops the last segment of a slashless base.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| CoreError::Startup(format!("http client: {e}")))?;
        Ok(Self { base, client })
    }

    fn url(&self, path: &str) -> Result<reqwest::Url> {
        self.base
            .join(path)
            .map_err(|e| CoreError::Catalog(format!("bad path {path}: {e}")))
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn health(&self) -> Result<()> {
        let url = self.url("healthz")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::Catalog(e.to_string()))?;
        if response.status() != StatusCode::OK {
            return Err(CoreError::Catalog(format!(
                "health check returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn for_host(&self, host: &HostId) -> Result<HostArtifacts> {
        let url = self.url(&format!("artifacts/for-host/{host}"))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::Catalog(e.to_string()))?
            .error_for_status()
            .map_err(|e| CoreError::Catalog(e.to_string()))?;
        response
            .json::<HostArtifacts>()
            .await
            .map_err(|e| CoreError::Catalog(format!("list decode: {e}")))
    }

    async fn fetch(&self, id: &ArtifactId) -> Result<Vec<u8>> {
        let url = self.url(&format!("artifacts/{id}/binary"))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::Catalog(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(CoreError::NotFound(format!("artifact {id}")));
        }
        let response = response
            .error_for_status()
            .map_err(|e| CoreError::Catalog(e.to_string()))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoreError::Catalog(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}
