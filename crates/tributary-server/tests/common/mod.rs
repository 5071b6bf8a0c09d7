// Shared fixtures for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tributary_plugin::{
    AggregationQuery, InvocationError, ManagerConfig, ManifestFetcher, PluginError, PluginStore,
    RepositoryManager, RepositoryManifest, ScraperDescriptor, ScraperRuntime, StreamLocator,
    StreamResult,
};
use tributary_server::{FixedAddressProvider, PairingConfig};

/// Smallest valid WASM module (`\0asm` + version 1).
pub const MINIMAL_WASM_B64: &str = "AGFzbQEAAAA=";
pub const MINIMAL_WASM: &[u8] = &[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

/// Manifest with inline scripts, one scraper per id.
pub fn manifest(name: &str, ids: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "version": "1.0.0",
        "scrapers": ids
            .iter()
            .map(|id| serde_json::json!({
                "id": id,
                "name": id.to_uppercase(),
                "script": MINIMAL_WASM_B64,
            }))
            .collect::<Vec<_>>()
    })
}

/// Serves manifests from memory; unknown URLs are unreachable.
#[derive(Default)]
pub struct MemoryFetcher {
    manifests: Mutex<HashMap<String, serde_json::Value>>,
    pub manifest_calls: AtomicUsize,
}

impl MemoryFetcher {
    pub fn serve(&self, url: &str, manifest: serde_json::Value) {
        self.manifests
            .lock()
            .unwrap()
            .insert(url.to_string(), manifest);
    }
}

#[async_trait]
impl ManifestFetcher for MemoryFetcher {
    async fn fetch_manifest(&self, url: &str) -> Result<RepositoryManifest, PluginError> {
        self.manifest_calls.fetch_add(1, Ordering::SeqCst);
        let manifest = self.manifests.lock().unwrap().get(url).cloned();
        match manifest {
            Some(json) => RepositoryManifest::parse_and_validate(json.to_string().as_bytes()),
            None => Err(PluginError::Unreachable(format!("{url}: not served"))),
        }
    }

    async fn fetch_script(&self, _url: &str) -> Result<Vec<u8>, PluginError> {
        Ok(MINIMAL_WASM.to_vec())
    }
}

/// Each scraper reports one stream named after its manifest id, plus one
/// stream every scraper shares.
#[derive(Default)]
pub struct EchoRuntime {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ScraperRuntime for EchoRuntime {
    async fn invoke(
        &self,
        scraper: &ScraperDescriptor,
        query: &AggregationQuery,
        _timeout: Duration,
    ) -> Result<Vec<StreamResult>, InvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stream = |url: String| StreamResult {
            source_name: scraper.name.clone(),
            title: format!("{} via {}", query.external_id, scraper.name),
            quality_tag: "1080p".into(),
            locator: StreamLocator::Url(url),
            is_external: false,
            is_torrent: false,
            extra_headers: Default::default(),
        };
        Ok(vec![
            stream(format!("https://{}.cdn.example.com/{}", scraper.manifest_id, query.external_id)),
            stream(format!("https://shared.example.com/{}", query.external_id)),
        ])
    }
}

pub fn manager(
    store: Arc<PluginStore>,
    fetcher: Arc<dyn ManifestFetcher>,
    runtime: Arc<dyn ScraperRuntime>,
) -> Arc<RepositoryManager> {
    Arc::new(RepositoryManager::new(
        store,
        fetcher,
        runtime,
        ManagerConfig::default(),
    ))
}

/// Binds an ephemeral loopback port.
pub fn loopback_config() -> PairingConfig {
    PairingConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port_start: 0,
        port_count: 1,
        ..Default::default()
    }
}

pub fn lan_address() -> Arc<FixedAddressProvider> {
    Arc::new(FixedAddressProvider(Some(IpAddr::V4(Ipv4Addr::LOCALHOST))))
}
