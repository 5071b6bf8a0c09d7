//! Durable storage of installed repositories and scrapers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::descriptor::{RepositoryDescriptor, ScraperDescriptor};
use crate::error::PluginError;

/// Everything the store needs to come back after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub global_enabled: bool,
    /// In install order.
    pub repositories: Vec<RepositoryDescriptor>,
    pub scrapers: BTreeMap<String, ScraperDescriptor>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            global_enabled: true,
            repositories: Vec::new(),
            scrapers: BTreeMap::new(),
        }
    }
}

/// Storage collaborator behind the plugin store.
#[async_trait]
pub trait DescriptorPersistence: Send + Sync + 'static {
    /// Load the last saved state, or `None` on first run.
    async fn load(&self) -> Result<Option<PersistedState>, PluginError>;

    async fn save(&self, state: &PersistedState) -> Result<(), PluginError>;
}

// ─── JSON file ──────────────────────────────────────────────────────────

/// Stores the whole state as one JSON document.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash mid-write keeps the previous state.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    path: PathBuf,
}

impl JsonFilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data_dir>/plugins.json`
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("plugins.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DescriptorPersistence for JsonFilePersistence {
    async fn load(&self) -> Result<Option<PersistedState>, PluginError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let state = serde_json::from_slice(&bytes)?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PluginError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "plugin state saved");
        Ok(())
    }
}

// ─── In memory ──────────────────────────────────────────────────────────

/// Keeps the state in memory; used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<Option<PersistedState>>,
    fail_saves: std::sync::atomic::AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            ..Default::default()
        }
    }

    /// Make every following save fail until reset.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn saved(&self) -> Option<PersistedState> {
        self.state.lock().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl DescriptorPersistence for MemoryPersistence {
    async fn load(&self) -> Result<Option<PersistedState>, PluginError> {
        Ok(self.saved())
    }

    async fn save(&self, state: &PersistedState) -> Result<(), PluginError> {
        if self.fail_saves.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PluginError::Persistence("storage unavailable".into()));
        }
        let mut slot = self
            .state
            .lock()
            .map_err(|_| PluginError::Persistence("state lock poisoned".into()))?;
        *slot = Some(state.clone());
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
