//! Repository manifest parsing and validation.
//!
//! A repository is a JSON document listing the scrapers it ships:
//!
//! ```json
//! {
//!   "name": "Demo",
//!   "description": "Example scrapers",
//!   "version": "1.0.0",
//!   "scrapers": [
//!     { "id": "a", "name": "Scraper A", "scriptUrl": "a.wasm", "supportedTypes": ["movie"] }
//!   ]
//! }
//! ```

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::descriptor::{CapabilityManifest, ContentKind};
use crate::error::PluginError;

/// Maximum number of scrapers a single repository may declare.
pub const MAX_SCRAPERS_PER_REPOSITORY: usize = 256;

/// Repository manifest fetched from a repository URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryManifest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub scrapers: Vec<ScraperEntry>,
}

/// One scraper declared in a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperEntry {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Inline base64-encoded WASM module.
    #[serde(default)]
    pub script: Option<String>,
    /// Module URL, absolute or relative to the manifest URL.
    #[serde(default, alias = "filename")]
    pub script_url: Option<String>,
    #[serde(default, alias = "supportedTypes")]
    pub content_types: Option<Vec<ContentKind>>,
    #[serde(default)]
    pub id_prefixes: Vec<String>,
    #[serde(default)]
    pub http_hosts: Option<Vec<String>>,
}

/// Where a scraper's module comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLocation {
    Inline(String),
    Remote(String),
}

impl ScraperEntry {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn script_location(&self) -> Option<ScriptLocation> {
        if let Some(inline) = self.script.as_deref().filter(|s| !s.trim().is_empty()) {
            return Some(ScriptLocation::Inline(inline.trim().to_string()));
        }
        self.script_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(|s| ScriptLocation::Remote(s.trim().to_string()))
    }

    /// Capabilities with manifest omissions filled by defaults.
    pub fn capabilities(&self) -> CapabilityManifest {
        let defaults = CapabilityManifest::default();
        CapabilityManifest {
            content_types: match &self.content_types {
                Some(kinds) if !kinds.is_empty() => kinds.iter().copied().collect::<BTreeSet<_>>(),
                _ => defaults.content_types,
            },
            id_prefixes: self.id_prefixes.clone(),
            http_hosts: self.http_hosts.clone().unwrap_or(defaults.http_hosts),
        }
    }
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Scraper ids only need to be present; uniqueness is checked per manifest.
/// Qualified ids put the repository uuid first, so a `:` inside the
/// manifest id stays unambiguous.
fn validate_scraper_id(id: &str) -> Result<(), PluginError> {
    if id.trim().is_empty() {
        return Err(PluginError::InvalidManifest("scraper id must not be empty".into()));
    }
    Ok(())
}

/// Versions are free-form labels. Non-semver values are kept as written.
fn check_version(value: &str, field_name: &str) {
    if semver::Version::parse(value).is_err() {
        tracing::debug!(field = field_name, version = value, "version is not semver, keeping as label");
    }
}

/// Validate an HTTP host entry.
///
/// Must be non-empty, contain no spaces, and either be `"*"` or contain at
/// least one dot (basic domain validation).
fn validate_http_host(host: &str) -> Result<(), PluginError> {
    if host.is_empty() {
        return Err(PluginError::InvalidManifest(
            "httpHosts entry must not be empty".into(),
        ));
    }
    if host.contains(' ') {
        return Err(PluginError::InvalidManifest(format!(
            "httpHosts entry must not contain spaces: '{host}'"
        )));
    }
    if host != "*" && !host.contains('.') {
        return Err(PluginError::InvalidManifest(format!(
            "httpHosts entry is not a valid domain: '{host}'"
        )));
    }
    Ok(())
}

impl RepositoryManifest {
    /// Parse a manifest from JSON bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, PluginError> {
        serde_json::from_slice(bytes).map_err(|e| PluginError::InvalidManifest(e.to_string()))
    }

    /// Validate all fields of a parsed manifest.
    pub fn validate(&self) -> Result<(), PluginError> {
        let name_len = self.name.trim().len();
        if name_len == 0 || name_len > 128 {
            return Err(PluginError::InvalidManifest(format!(
                "name must be 1-128 characters, got {name_len}"
            )));
        }

        if let Some(ref version) = self.version {
            check_version(version, "version");
        }

        if self.scrapers.len() > MAX_SCRAPERS_PER_REPOSITORY {
            return Err(PluginError::InvalidManifest(format!(
                "too many scrapers: {} (max: {MAX_SCRAPERS_PER_REPOSITORY})",
                self.scrapers.len()
            )));
        }

        let mut seen = HashSet::new();
        for scraper in &self.scrapers {
            validate_scraper_id(&scraper.id)?;
            if !seen.insert(scraper.id.as_str()) {
                return Err(PluginError::InvalidManifest(format!(
                    "duplicate scraper id '{}'",
                    scraper.id
                )));
            }

            if scraper.script_location().is_none() {
                return Err(PluginError::InvalidManifest(format!(
                    "scraper '{}' declares neither script nor scriptUrl",
                    scraper.id
                )));
            }

            if let Some(ref version) = scraper.version {
                check_version(version, &format!("scrapers.{}.version", scraper.id));
            }

            for host in scraper.http_hosts.iter().flatten() {
                validate_http_host(host)?;
            }
        }

        Ok(())
    }

    /// Parse and validate a manifest from JSON bytes.
    pub fn parse_and_validate(bytes: &[u8]) -> Result<Self, PluginError> {
        let manifest = Self::parse(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
