//! HTTP access to repository manifests and scraper modules.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::PluginError;
use crate::manifest::RepositoryManifest;

/// Fetches repository documents. Also used by pairing to vet proposed URLs.
#[async_trait]
pub trait ManifestFetcher: Send + Sync + 'static {
    /// Fetch, parse and validate the manifest at `url`.
    async fn fetch_manifest(&self, url: &str) -> Result<RepositoryManifest, PluginError>;

    /// Fetch a scraper module. Size is checked by the caller.
    async fn fetch_script(&self, url: &str) -> Result<Vec<u8>, PluginError>;
}

/// [`ManifestFetcher`] over reqwest with a bounded timeout.
#[derive(Debug, Clone)]
pub struct HttpManifestFetcher {
    client: reqwest::Client,
    max_body_bytes: usize,
}

impl HttpManifestFetcher {
    pub fn new(timeout: Duration, max_body_bytes: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("tributary/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            max_body_bytes,
        }
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, PluginError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PluginError::Unreachable(format!("{url}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PluginError::Unreachable(format!("{url}: HTTP {status}")));
        }

        if resp
            .content_length()
            .is_some_and(|len| len as usize > self.max_body_bytes)
        {
            return Err(PluginError::WasmValidation(format!(
                "{url}: body exceeds {} bytes",
                self.max_body_bytes
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| PluginError::Unreachable(format!("{url}: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch_manifest(&self, url: &str) -> Result<RepositoryManifest, PluginError> {
        let bytes = self.get_bytes(url).await?;
        let manifest = RepositoryManifest::parse_and_validate(&bytes)?;
        tracing::debug!(
            url = %url,
            name = %manifest.name,
            scrapers = manifest.scrapers.len(),
            "manifest fetched"
        );
        Ok(manifest)
    }

    async fn fetch_script(&self, url: &str) -> Result<Vec<u8>, PluginError> {
        self.get_bytes(url).await
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher() -> HttpManifestFetcher {
        HttpManifestFetcher::new(Duration::from_secs(5), 1024)
    }

    #[tokio::test]
    async fn test_fetch_manifest_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "Demo",
                "scrapers": [{"id": "a", "scriptUrl": "a.wasm"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manifest = fetcher()
            .fetch_manifest(&format!("{}/manifest.json", server.uri()))
            .await
            .unwrap();
        assert_eq!(manifest.name, "Demo");
        assert_eq!(manifest.scrapers.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_manifest_http_error_is_unreachable() {
        let server = MockServer::start().await;
        Mock::given(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = fetcher()
            .fetch_manifest(&format!("{}/manifest.json", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Unreachable(_)));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_fetch_manifest_garbage_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = fetcher()
            .fetch_manifest(&format!("{}/manifest.json", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::InvalidManifest(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_unreachable() {
        let err = fetcher()
            .fetch_manifest("http://127.0.0.1:9/manifest.json")
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_fetch_script_size_cap() {
        let server = MockServer::start().await;
        Mock::given(path("/big.wasm"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;

        let err = fetcher()
            .fetch_script(&format!("{}/big.wasm", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::WasmValidation(_)));
    }
}
