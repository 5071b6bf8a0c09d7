//! Repository manager: fetch, validate, install, refresh and remove.
//!
//! The manager is the only component that turns remote manifests into
//! store mutations. Everything is fetched and validated before the store
//! is touched, so a failed add or refresh leaves no trace.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use uuid::Uuid;

use crate::descriptor::{
    canonical_key, canonicalize_url, repository_id_for, RepositoryDescriptor, ScraperDescriptor,
};
use crate::error::PluginError;
use crate::fetcher::{HttpManifestFetcher, ManifestFetcher};
use crate::manifest::{RepositoryManifest, ScraperEntry, ScriptLocation};
use crate::sandbox::ScraperRuntime;
use crate::store::PluginStore;
use crate::stream::{AggregationQuery, StreamResult};

// ─── Constants ──────────────────────────────────────────────────────────

/// WASM magic bytes: `\0asm`
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Default max WASM module size: 20 MB.
const DEFAULT_MAX_WASM_SIZE_MB: usize = 20;

/// Import namespaces a scraper module may use. WASI is not linked.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "extism:host/env",  // Extism kernel
    "extism:host/user", // Tributary host functions
    "env",              // Extism PDK legacy imports
];

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Manifest and module fetch timeout (default: 15 s).
    pub manifest_timeout_secs: u64,
    /// Timeout for `test_scraper` runs (default: 20 s).
    pub scraper_timeout_secs: u64,
    /// Maximum module size in bytes (default: 20 MB).
    pub max_wasm_size: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            manifest_timeout_secs: 15,
            scraper_timeout_secs: 20,
            max_wasm_size: DEFAULT_MAX_WASM_SIZE_MB * 1024 * 1024,
        }
    }
}

impl ManagerConfig {
    pub fn from_env() -> Self {
        Self {
            manifest_timeout_secs: std::env::var("MANIFEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(15),
            scraper_timeout_secs: std::env::var("SCRAPER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_wasm_size: std::env::var("PLUGIN_WASM_MAX_SIZE_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(DEFAULT_MAX_WASM_SIZE_MB)
                * 1024
                * 1024,
        }
    }

    /// HTTP fetcher honouring this config's timeout and size cap.
    pub fn http_fetcher(&self) -> HttpManifestFetcher {
        HttpManifestFetcher::new(
            Duration::from_secs(self.manifest_timeout_secs),
            self.max_wasm_size,
        )
    }
}

// ─── Reports ────────────────────────────────────────────────────────────

/// Result of refreshing one repository during [`RepositoryManager::refresh_all`].
#[derive(Debug)]
pub struct RefreshReport {
    pub repository_id: Uuid,
    pub canonical_url: String,
    pub result: Result<RepositoryDescriptor, PluginError>,
}

/// What applying a repository list changed.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub added: Vec<RepositoryDescriptor>,
    pub removed: Vec<RepositoryDescriptor>,
    pub failed: Vec<(String, PluginError)>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

// ─── WASM validation ────────────────────────────────────────────────────

/// Validate a scraper module: size, magic bytes, import namespaces.
fn validate_wasm(wasm_bytes: &[u8], max_size: usize) -> Result<(), PluginError> {
    if wasm_bytes.len() > max_size {
        return Err(PluginError::WasmValidation(format!(
            "WASM binary too large: {} bytes (max: {max_size} bytes)",
            wasm_bytes.len()
        )));
    }

    if wasm_bytes.len() < 8 || &wasm_bytes[..4] != WASM_MAGIC {
        return Err(PluginError::WasmValidation(
            "invalid WASM binary: magic bytes mismatch".into(),
        ));
    }

    validate_wasm_imports(wasm_bytes)
}

/// Validate WASM imports against the allowed namespace list.
fn validate_wasm_imports(wasm_bytes: &[u8]) -> Result<(), PluginError> {
    use wasmparser::{Parser, Payload};

    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload =
            payload.map_err(|e| PluginError::WasmValidation(format!("failed to parse WASM: {e}")))?;

        if let Payload::ImportSection(reader) = payload {
            for import in reader {
                let import = import.map_err(|e| {
                    PluginError::WasmValidation(format!("failed to read import: {e}"))
                })?;

                if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                    return Err(PluginError::WasmValidation(format!(
                        "unauthorized import namespace: '{}' (function: '{}'); \
                         allowed namespaces: {:?}",
                        import.module, import.name, ALLOWED_IMPORT_NAMESPACES
                    )));
                }
            }
        }
    }

    Ok(())
}

// ─── Manager ────────────────────────────────────────────────────────────

pub struct RepositoryManager {
    store: Arc<PluginStore>,
    fetcher: Arc<dyn ManifestFetcher>,
    runtime: Arc<dyn ScraperRuntime>,
    config: ManagerConfig,
}

impl std::fmt::Debug for RepositoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RepositoryManager {
    pub fn new(
        store: Arc<PluginStore>,
        fetcher: Arc<dyn ManifestFetcher>,
        runtime: Arc<dyn ScraperRuntime>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            runtime,
            config,
        }
    }

    pub fn store(&self) -> &Arc<PluginStore> {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<dyn ManifestFetcher> {
        &self.fetcher
    }

    /// Install the repository at `url` with every scraper enabled.
    pub async fn add_repository(&self, url: &str) -> Result<RepositoryDescriptor, PluginError> {
        let canonical = canonicalize_url(url)?;
        tracing::info!(repository = %canonical, "adding repository");

        if let Some(existing) = self.store.find_by_url(&canonical) {
            return Err(PluginError::DuplicateRepository(existing.canonical_url));
        }

        let manifest = self.fetcher.fetch_manifest(&canonical).await?;
        let repository_id = repository_id_for(&canonical);
        let scrapers = self
            .resolve_scrapers(&canonical, repository_id, &manifest)
            .await?;

        let now = Utc::now();
        let repository = RepositoryDescriptor {
            id: repository_id,
            canonical_url: canonical,
            name: manifest.name.trim().to_string(),
            description: manifest.description.clone(),
            version: manifest.version.clone(),
            scraper_ids: Vec::new(),
            installed_at: now,
            updated_at: now,
        };

        self.store.insert_repository(repository, scrapers).await
    }

    /// Re-fetch a repository and reconcile its scrapers by manifest id.
    ///
    /// New scrapers start enabled, surviving ones keep their flag, missing
    /// ones are dropped. Scripts and metadata are always replaced.
    pub async fn refresh_repository(&self, id: Uuid) -> Result<RepositoryDescriptor, PluginError> {
        let existing = self
            .store
            .get(id)
            .ok_or_else(|| PluginError::NotFound(format!("repository {id}")))?;
        tracing::info!(repository = %existing.canonical_url, "refreshing repository");

        let manifest = self.fetcher.fetch_manifest(&existing.canonical_url).await?;
        let scrapers = self
            .resolve_scrapers(&existing.canonical_url, id, &manifest)
            .await?;

        let repository = RepositoryDescriptor {
            name: manifest.name.trim().to_string(),
            description: manifest.description.clone(),
            version: manifest.version.clone(),
            updated_at: Utc::now(),
            ..existing
        };

        // Flags and existence are re-checked by the store under its lock.
        self.store.refresh_repository(repository, scrapers).await
    }

    pub async fn remove_repository(&self, id: Uuid) -> Result<RepositoryDescriptor, PluginError> {
        self.store.remove_repository(id).await
    }

    /// Run one scraper in isolation. Touches neither the store nor any
    /// aggregation in progress.
    pub async fn test_scraper(
        &self,
        scraper_id: &str,
        sample_query: &AggregationQuery,
    ) -> Result<Vec<StreamResult>, PluginError> {
        let scraper = self
            .store
            .get_scraper(scraper_id)
            .ok_or_else(|| PluginError::NotFound(format!("scraper {scraper_id}")))?;

        let streams = self
            .runtime
            .invoke(
                &scraper,
                sample_query,
                Duration::from_secs(self.config.scraper_timeout_secs),
            )
            .await?;
        Ok(streams)
    }

    /// Refresh every installed repository, one after another.
    pub async fn refresh_all(&self) -> Vec<RefreshReport> {
        let mut reports = Vec::new();
        for repo in self.store.list() {
            let result = self.refresh_repository(repo.id).await;
            if let Err(ref e) = result {
                tracing::warn!(repository = %repo.canonical_url, "refresh failed: {e}");
            }
            reports.push(RefreshReport {
                repository_id: repo.id,
                canonical_url: repo.canonical_url,
                result,
            });
        }
        reports
    }

    /// Install the repositories in `added` and uninstall those in `removed`.
    pub async fn apply_diff(&self, added: &[String], removed: &[String]) -> ApplyReport {
        let mut report = ApplyReport::default();

        for url in removed {
            let Some(repo) = self.store.find_by_url(url) else {
                continue;
            };
            match self.store.remove_repository(repo.id).await {
                Ok(repo) => report.removed.push(repo),
                Err(e) => report.failed.push((url.clone(), e)),
            }
        }

        for url in added {
            match self.add_repository(url).await {
                Ok(repo) => report.added.push(repo),
                Err(PluginError::DuplicateRepository(_)) => {}
                Err(e) => report.failed.push((url.clone(), e)),
            }
        }

        report
    }

    /// Make the installed set equal `urls`.
    pub async fn apply_repository_list(&self, urls: &[String]) -> ApplyReport {
        let wanted: Vec<String> = urls.iter().map(|u| canonical_key(u)).collect();
        let installed = self.store.snapshot();

        let added: Vec<String> = urls
            .iter()
            .filter(|u| installed.find_by_url(u).is_none())
            .cloned()
            .collect();
        let removed: Vec<String> = installed
            .repositories
            .iter()
            .filter(|r| !wanted.contains(&r.url_key()))
            .map(|r| r.canonical_url.clone())
            .collect();

        self.apply_diff(&added, &removed).await
    }

    /// Fetch and validate every module a manifest declares.
    async fn resolve_scrapers(
        &self,
        manifest_url: &str,
        repository_id: Uuid,
        manifest: &RepositoryManifest,
    ) -> Result<Vec<ScraperDescriptor>, PluginError> {
        let base = url::Url::parse(manifest_url)
            .map_err(|e| PluginError::InvalidUrl(format!("'{manifest_url}': {e}")))?;

        let mut scrapers = Vec::with_capacity(manifest.scrapers.len());
        for entry in &manifest.scrapers {
            let script_source = self.load_script(&base, entry).await?;
            validate_wasm(&script_source, self.config.max_wasm_size).map_err(|e| {
                PluginError::WasmValidation(format!("scraper '{}': {e}", entry.id))
            })?;

            scrapers.push(ScraperDescriptor {
                id: ScraperDescriptor::qualified_id(repository_id, &entry.id),
                manifest_id: entry.id.clone(),
                repository_id,
                name: entry.display_name().to_string(),
                enabled: true,
                version: entry.version.clone(),
                script_source,
                capability_manifest: entry.capabilities(),
            });
        }
        Ok(scrapers)
    }

    async fn load_script(&self, base: &url::Url, entry: &ScraperEntry) -> Result<Vec<u8>, PluginError> {
        match entry.script_location() {
            Some(ScriptLocation::Inline(encoded)) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| {
                    PluginError::InvalidManifest(format!(
                        "scraper '{}': inline script is not base64: {e}",
                        entry.id
                    ))
                }),
            Some(ScriptLocation::Remote(location)) => {
                let url = base.join(&location).map_err(|e| {
                    PluginError::InvalidManifest(format!(
                        "scraper '{}': bad scriptUrl '{location}': {e}",
                        entry.id
                    ))
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(PluginError::InvalidManifest(format!(
                        "scraper '{}': scriptUrl must be http(s)",
                        entry.id
                    )));
                }
                self.fetcher.fetch_script(url.as_str()).await
            }
            None => Err(PluginError::InvalidManifest(format!(
                "scraper '{}' declares neither script nor scriptUrl",
                entry.id
            ))),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
