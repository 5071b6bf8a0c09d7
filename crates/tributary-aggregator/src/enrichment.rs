//! Memoized metadata lookups keyed by (external id, content kind).
//!
//! Concurrent lookups of the same key share one fetch. Only positive
//! results are kept; misses and failures are retried on the next call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tributary_plugin::{AggregationQuery, ContentKind};

use crate::error::EnrichmentError;

// ─── Types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentKey {
    pub external_id: String,
    pub kind: ContentKind,
}

impl EnrichmentKey {
    pub fn new(external_id: impl Into<String>, kind: ContentKind) -> Self {
        Self {
            external_id: external_id.into(),
            kind,
        }
    }
}

impl From<&AggregationQuery> for EnrichmentKey {
    fn from(query: &AggregationQuery) -> Self {
        Self::new(query.external_id.clone(), query.content_type)
    }
}

/// Title metadata attached to an aggregation outcome.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    pub release_info: Option<String>,
    pub description: Option<String>,
    pub poster: Option<String>,
    pub background: Option<String>,
    pub genres: Vec<String>,
    pub imdb_rating: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnrichmentEntry {
    pub key: EnrichmentKey,
    pub value: Metadata,
    pub fetched_at: DateTime<Utc>,
}

pub type Lookup = Result<Option<Metadata>, EnrichmentError>;

/// Remote metadata source.
#[async_trait]
pub trait EnrichmentFetcher: Send + Sync + 'static {
    /// `Ok(None)` when the source has nothing for this key.
    async fn fetch(&self, key: &EnrichmentKey) -> Lookup;
}

// ─── Cache ──────────────────────────────────────────────────────────────

pub struct EnrichmentCache {
    fetcher: Arc<dyn EnrichmentFetcher>,
    entries: RwLock<HashMap<EnrichmentKey, EnrichmentEntry>>,
    /// One cell per key being fetched; waiters share its result.
    in_flight: Mutex<HashMap<EnrichmentKey, Arc<OnceCell<Lookup>>>>,
}

impl std::fmt::Debug for EnrichmentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentCache").finish_non_exhaustive()
    }
}

impl EnrichmentCache {
    pub fn new(fetcher: Arc<dyn EnrichmentFetcher>) -> Self {
        Self {
            fetcher,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Cached entry, if any. Never fetches.
    pub async fn peek(&self, key: &EnrichmentKey) -> Option<EnrichmentEntry> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Cached value, or fetch-then-populate.
    pub async fn get(&self, key: &EnrichmentKey) -> Lookup {
        if let Some(entry) = self.entries.read().await.get(key) {
            return Ok(Some(entry.value.clone()));
        }

        let cell = {
            let mut in_flight = self.in_flight.lock().await;
            // A finished fetch publishes to `entries` before leaving `in_flight`.
            if let Some(entry) = self.entries.read().await.get(key) {
                return Ok(Some(entry.value.clone()));
            }
            in_flight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_init(|| async {
                tracing::debug!(id = %key.external_id, kind = %key.kind, "fetching metadata");
                self.fetcher.fetch(key).await
            })
            .await
            .clone();

        if let Ok(Some(ref value)) = result {
            self.entries.write().await.insert(
                key.clone(),
                EnrichmentEntry {
                    key: key.clone(),
                    value: value.clone(),
                    fetched_at: Utc::now(),
                },
            );
        }

        let mut in_flight = self.in_flight.lock().await;
        if in_flight.get(key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
            in_flight.remove(key);
        }

        result
    }
}

// ─── HTTP fetcher ───────────────────────────────────────────────────────

/// Cinemeta-style source: `GET {base}/meta/{kind}/{id}.json` → `{"meta": {...}}`.
#[derive(Debug, Clone)]
pub struct HttpMetadataFetcher {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct MetaEnvelope {
    #[serde(default)]
    meta: Option<Metadata>,
}

impl HttpMetadataFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url_for(&self, key: &EnrichmentKey) -> String {
        format!(
            "{}/meta/{}/{}.json",
            self.base_url,
            key.kind,
            url::form_urlencoded::byte_serialize(key.external_id.as_bytes()).collect::<String>()
        )
    }
}

#[async_trait]
impl EnrichmentFetcher for HttpMetadataFetcher {
    async fn fetch(&self, key: &EnrichmentKey) -> Lookup {
        let url = self.url_for(key);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EnrichmentError::Unreachable(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(EnrichmentError::Unreachable(format!(
                "{url}: HTTP {}",
                resp.status()
            )));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| EnrichmentError::Unreachable(e.to_string()))?;
        let envelope: MetaEnvelope =
            serde_json::from_slice(&body).map_err(|e| EnrichmentError::Decode(e.to_string()))?;
        Ok(envelope.meta.filter(|m| !m.name.is_empty()))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
