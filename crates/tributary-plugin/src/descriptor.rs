//! Repository and scraper descriptors held by the [`PluginStore`](crate::store::PluginStore).

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PluginError;
use crate::stream::AggregationQuery;

// ─── Content kinds ──────────────────────────────────────────────────────

/// Kind of content a query targets and a scraper declares support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Movie,
    #[serde(alias = "tv", alias = "show")]
    Series,
}

impl ContentKind {
    pub const ALL: [ContentKind; 2] = [ContentKind::Movie, ContentKind::Series];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Series => "series",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "movie" => Ok(Self::Movie),
            "series" | "tv" | "show" => Ok(Self::Series),
            other => Err(format!("unknown content kind '{other}'")),
        }
    }
}

// ─── Capabilities ───────────────────────────────────────────────────────

/// What a scraper declares it can handle and which hosts it may reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CapabilityManifest {
    pub content_types: BTreeSet<ContentKind>,
    /// External id prefixes the scraper understands (`tt`, `tmdb:`). Empty means any.
    pub id_prefixes: Vec<String>,
    /// Hosts reachable through `http_fetch`. Supports `*` and `*.example.com`.
    pub http_hosts: Vec<String>,
}

impl Default for CapabilityManifest {
    fn default() -> Self {
        Self {
            content_types: ContentKind::ALL.into_iter().collect(),
            id_prefixes: Vec::new(),
            http_hosts: vec!["*".to_string()],
        }
    }
}

impl CapabilityManifest {
    /// Whether a scraper with these capabilities should be invoked for `query`.
    pub fn supports(&self, query: &AggregationQuery) -> bool {
        if !self.content_types.contains(&query.content_type) {
            return false;
        }
        self.id_prefixes.is_empty()
            || self
                .id_prefixes
                .iter()
                .any(|prefix| query.external_id.starts_with(prefix.as_str()))
    }
}

// ─── Descriptors ────────────────────────────────────────────────────────

/// One installed scraper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScraperDescriptor {
    /// Store-wide id: `<repository id>:<manifest id>`.
    pub id: String,
    /// Id declared in the repository manifest.
    pub manifest_id: String,
    pub repository_id: Uuid,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub version: Option<String>,
    /// Compiled WASM module.
    #[serde(with = "base64_bytes")]
    pub script_source: Vec<u8>,
    #[serde(default)]
    pub capability_manifest: CapabilityManifest,
}

impl ScraperDescriptor {
    pub fn qualified_id(repository_id: Uuid, manifest_id: &str) -> String {
        format!("{repository_id}:{manifest_id}")
    }
}

/// One installed repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryDescriptor {
    pub id: Uuid,
    pub canonical_url: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Scraper ids in manifest order.
    pub scraper_ids: Vec<String>,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RepositoryDescriptor {
    pub fn scraper_count(&self) -> usize {
        self.scraper_ids.len()
    }

    /// Comparison key for the canonical-URL uniqueness invariant.
    pub fn url_key(&self) -> String {
        canonical_key(&self.canonical_url)
    }
}

// ─── Canonical URLs ─────────────────────────────────────────────────────

/// Normalize a repository URL for storage.
///
/// Only `http` and `https` are accepted. Trailing slashes are dropped.
pub fn canonicalize_url(raw: &str) -> Result<String, PluginError> {
    let trimmed = raw.trim();
    let parsed = url::Url::parse(trimmed)
        .map_err(|e| PluginError::InvalidUrl(format!("'{trimmed}': {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(PluginError::InvalidUrl(format!(
            "only http and https are supported, got scheme '{}' in '{trimmed}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().is_none() {
        return Err(PluginError::InvalidUrl(format!("URL has no host: '{trimmed}'")));
    }

    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

/// Case- and trailing-slash-insensitive comparison key.
pub fn canonical_key(url: &str) -> String {
    url.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Deterministic repository id, identical on every device for the same URL.
pub fn repository_id_for(canonical_url: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, canonical_key(canonical_url).as_bytes())
}

// ─── Serde helpers ──────────────────────────────────────────────────────

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
