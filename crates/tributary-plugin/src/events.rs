//! Store change events delivered to subscribers alongside each snapshot.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::StoreSnapshot;

/// What a committed store mutation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// Initial state handed to a new subscriber.
    Loaded,
    RepositoryUpserted {
        repository_id: Uuid,
        added: Vec<String>,
        removed: Vec<String>,
    },
    RepositoryRemoved {
        repository_id: Uuid,
        scraper_ids: Vec<String>,
    },
    ScraperToggled {
        scraper_id: String,
        enabled: bool,
    },
    GlobalToggled {
        enabled: bool,
    },
}

impl StoreEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Loaded => "loaded",
            Self::RepositoryUpserted { .. } => "repository_upserted",
            Self::RepositoryRemoved { .. } => "repository_removed",
            Self::ScraperToggled { .. } => "scraper_toggled",
            Self::GlobalToggled { .. } => "global_toggled",
        }
    }
}

/// One entry of a [`PluginStore::subscribe`](crate::store::PluginStore::subscribe) stream.
#[derive(Debug, Clone)]
pub struct StoreUpdate {
    pub event: StoreEvent,
    pub snapshot: Arc<StoreSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = StoreEvent::ScraperToggled {
            scraper_id: "r:a".into(),
            enabled: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "scraper_toggled");
        assert_eq!(json["scraper_id"], "r:a");
        assert_eq!(json["enabled"], false);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(StoreEvent::Loaded.name(), "loaded");
        assert_eq!(StoreEvent::GlobalToggled { enabled: true }.name(), "global_toggled");
    }
}
