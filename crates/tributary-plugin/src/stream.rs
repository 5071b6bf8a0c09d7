//! Queries sent to scrapers and the stream results they produce.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::descriptor::ContentKind;
use crate::error::InvocationError;

/// The immutable request shared by every fanned-out invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationQuery {
    pub content_type: ContentKind,
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<u32>,
}

impl AggregationQuery {
    pub fn movie(external_id: impl Into<String>) -> Self {
        Self {
            content_type: ContentKind::Movie,
            external_id: external_id.into(),
            season: None,
            episode: None,
        }
    }

    pub fn episode(external_id: impl Into<String>, season: u32, episode: u32) -> Self {
        Self {
            content_type: ContentKind::Series,
            external_id: external_id.into(),
            season: Some(season),
            episode: Some(episode),
        }
    }
}

/// Where a stream can be played from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamLocator {
    Url(String),
    Magnet(String),
}

impl StreamLocator {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Url(u) | Self::Magnet(u) => u,
        }
    }
}

/// One playable candidate returned by a scraper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamResult {
    pub source_name: String,
    pub title: String,
    pub quality_tag: String,
    #[serde(flatten)]
    pub locator: StreamLocator,
    pub is_external: bool,
    pub is_torrent: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_headers: BTreeMap<String, String>,
}

// ─── Script output ──────────────────────────────────────────────────────

/// Stream entry as emitted by a script.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStream {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    quality: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    magnet: Option<String>,
    #[serde(default)]
    info_hash: Option<String>,
    #[serde(default)]
    external: bool,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOutput {
    List(Vec<RawStream>),
    Wrapped { streams: Vec<RawStream> },
}

/// Parse and validate the bytes returned by a scraper's `get_streams` export.
///
/// Accepts a bare JSON array or an object with a `streams` array. Every
/// entry must carry an `http(s)` url, a magnet link or a torrent info hash.
pub fn parse_script_output(
    output: &[u8],
    source_name: &str,
) -> Result<Vec<StreamResult>, InvocationError> {
    if output.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let raw: RawOutput = serde_json::from_slice(output)
        .map_err(|e| InvocationError::MalformedOutput(e.to_string()))?;
    let entries = match raw {
        RawOutput::List(entries) | RawOutput::Wrapped { streams: entries } => entries,
    };

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| convert_entry(index, entry, source_name))
        .collect()
}

fn convert_entry(
    index: usize,
    entry: RawStream,
    source_name: &str,
) -> Result<StreamResult, InvocationError> {
    let locator = if let Some(url) = non_empty(entry.url) {
        let parsed = url::Url::parse(&url).map_err(|e| {
            InvocationError::MalformedOutput(format!("stream {index}: invalid url '{url}': {e}"))
        })?;
        if parsed.scheme() == "magnet" {
            StreamLocator::Magnet(url)
        } else if matches!(parsed.scheme(), "http" | "https") {
            StreamLocator::Url(url)
        } else {
            return Err(InvocationError::MalformedOutput(format!(
                "stream {index}: unsupported url scheme '{}'",
                parsed.scheme()
            )));
        }
    } else if let Some(magnet) = non_empty(entry.magnet) {
        if !magnet.starts_with("magnet:?") {
            return Err(InvocationError::MalformedOutput(format!(
                "stream {index}: magnet link must start with 'magnet:?'"
            )));
        }
        StreamLocator::Magnet(magnet)
    } else if let Some(hash) = non_empty(entry.info_hash) {
        if !is_info_hash(&hash) {
            return Err(InvocationError::MalformedOutput(format!(
                "stream {index}: invalid info hash '{hash}'"
            )));
        }
        StreamLocator::Magnet(format!("magnet:?xt=urn:btih:{}", hash.to_ascii_lowercase()))
    } else {
        return Err(InvocationError::MalformedOutput(format!(
            "stream {index}: missing url, magnet or infoHash"
        )));
    };

    let is_torrent = matches!(locator, StreamLocator::Magnet(_));

    Ok(StreamResult {
        source_name: source_name.to_string(),
        title: non_empty(entry.title)
            .or_else(|| non_empty(entry.name))
            .unwrap_or_else(|| source_name.to_string()),
        quality_tag: non_empty(entry.quality).unwrap_or_else(|| "unknown".to_string()),
        locator,
        is_external: entry.external,
        is_torrent,
        extra_headers: entry.headers,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// 40 hex characters (SHA-1) or 32 base32 characters.
fn is_info_hash(hash: &str) -> bool {
    match hash.len() {
        40 => hash.chars().all(|c| c.is_ascii_hexdigit()),
        32 => hash
            .chars()
            .all(|c| c.is_ascii_alphabetic() || ('2'..='7').contains(&c)),
        _ => false,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
