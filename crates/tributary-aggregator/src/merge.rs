//! Deduplication of per-source results into one ordered list.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tributary_plugin::{StreamLocator, StreamResult};

use crate::aggregator::{SourceOutcome, SourceStatus};

/// One entry of the merged list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedStream {
    #[serde(flatten)]
    pub stream: StreamResult,
    /// Other sources that reported the same stream, in configuration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also_reported_by: Vec<String>,
}

/// Identity used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DedupKey {
    locator: String,
    quality: String,
}

impl DedupKey {
    pub(crate) fn of(stream: &StreamResult) -> Self {
        Self {
            locator: normalize_locator(&stream.locator),
            quality: stream.quality_tag.trim().to_lowercase(),
        }
    }
}

/// Torrents compare by info hash; URLs by their parsed form without fragment.
fn normalize_locator(locator: &StreamLocator) -> String {
    match locator {
        StreamLocator::Magnet(magnet) => info_hash(magnet)
            .map(|h| format!("btih:{h}"))
            .unwrap_or_else(|| magnet.trim().to_lowercase()),
        StreamLocator::Url(raw) => match url::Url::parse(raw.trim()) {
            Ok(mut url) => {
                url.set_fragment(None);
                url.as_str().trim_end_matches('/').to_string()
            }
            Err(_) => raw.trim().to_string(),
        },
    }
}

fn info_hash(magnet: &str) -> Option<String> {
    let start = magnet.to_ascii_lowercase().find("xt=urn:btih:")? + "xt=urn:btih:".len();
    let rest = &magnet[start..];
    let hash: String = rest.chars().take_while(|c| *c != '&').collect();
    (!hash.is_empty()).then(|| hash.to_lowercase())
}

/// Merge successful results. `outcomes` must be in configuration order.
///
/// The first source to report a stream keeps it; later sources are listed
/// in `also_reported_by`. Output order is first-seen order.
pub fn merge_results(outcomes: &[SourceOutcome]) -> Vec<MergedStream> {
    let mut merged: Vec<MergedStream> = Vec::new();
    let mut index: HashMap<DedupKey, usize> = HashMap::new();

    for outcome in outcomes {
        let SourceStatus::Succeeded { streams } = &outcome.status else {
            continue;
        };
        for stream in streams {
            let key = DedupKey::of(stream);
            match index.get(&key) {
                Some(&pos) => {
                    let entry = &mut merged[pos];
                    if entry.stream.source_name != outcome.scraper_name
                        && !entry.also_reported_by.contains(&outcome.scraper_name)
                    {
                        entry.also_reported_by.push(outcome.scraper_name.clone());
                    }
                }
                None => {
                    index.insert(key, merged.len());
                    merged.push(MergedStream {
                        stream: stream.clone(),
                        also_reported_by: Vec::new(),
                    });
                }
            }
        }
    }

    merged
}
