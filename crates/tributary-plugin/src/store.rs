//! Plugin descriptor store: the single writer of repository and scraper state.
//!
//! Readers take an `Arc<StoreSnapshot>` and keep it as long as they like;
//! a mutation builds the next snapshot from a copy, persists it, and only
//! then publishes it. Nobody ever observes a half-applied change.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::descriptor::{canonical_key, RepositoryDescriptor, ScraperDescriptor};
use crate::error::PluginError;
use crate::events::{StoreEvent, StoreUpdate};
use crate::persistence::{DescriptorPersistence, MemoryPersistence, PersistedState};

// ─── Snapshot ───────────────────────────────────────────────────────────

/// Immutable view of the store at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSnapshot {
    /// Incremented on every committed mutation.
    pub revision: u64,
    pub global_enabled: bool,
    /// In install order.
    pub repositories: Vec<RepositoryDescriptor>,
    pub scrapers: BTreeMap<String, ScraperDescriptor>,
}

impl StoreSnapshot {
    fn from_state(revision: u64, state: PersistedState) -> Self {
        Self {
            revision,
            global_enabled: state.global_enabled,
            repositories: state.repositories,
            scrapers: state.scrapers,
        }
    }

    fn to_state(&self) -> PersistedState {
        PersistedState {
            global_enabled: self.global_enabled,
            repositories: self.repositories.clone(),
            scrapers: self.scrapers.clone(),
        }
    }

    pub fn list(&self) -> &[RepositoryDescriptor] {
        &self.repositories
    }

    pub fn get(&self, id: Uuid) -> Option<&RepositoryDescriptor> {
        self.repositories.iter().find(|r| r.id == id)
    }

    pub fn get_scraper(&self, id: &str) -> Option<&ScraperDescriptor> {
        self.scrapers.get(id)
    }

    pub fn find_by_url(&self, url: &str) -> Option<&RepositoryDescriptor> {
        let key = canonical_key(url);
        self.repositories.iter().find(|r| r.url_key() == key)
    }

    /// Scrapers of one repository in manifest order.
    pub fn scrapers_of(&self, repository_id: Uuid) -> Vec<&ScraperDescriptor> {
        self.get(repository_id)
            .map(|repo| {
                repo.scraper_ids
                    .iter()
                    .filter_map(|id| self.scrapers.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every scraper in configuration order: repositories by install
    /// order, then manifest order within each.
    pub fn scrapers_in_order(&self) -> impl Iterator<Item = &ScraperDescriptor> + '_ {
        self.repositories
            .iter()
            .flat_map(|repo| repo.scraper_ids.iter())
            .filter_map(|id| self.scrapers.get(id))
    }

    pub fn repository_urls(&self) -> Vec<String> {
        self.repositories
            .iter()
            .map(|r| r.canonical_url.clone())
            .collect()
    }
}

// ─── Store ──────────────────────────────────────────────────────────────

/// Registry of installed repositories and their scrapers.
pub struct PluginStore {
    persistence: Arc<dyn DescriptorPersistence>,
    /// Serializes mutations end to end, persistence included.
    writer: tokio::sync::Mutex<()>,
    current: watch::Sender<Arc<StoreSnapshot>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StoreUpdate>>>,
}

impl std::fmt::Debug for PluginStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginStore")
            .field("revision", &self.snapshot().revision)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PutMode {
    Insert,
    Upsert,
    Refresh,
}

impl PluginStore {
    /// Open the store, restoring whatever the persistence layer holds.
    pub async fn open(persistence: Arc<dyn DescriptorPersistence>) -> Result<Self, PluginError> {
        let state = persistence.load().await?.unwrap_or_default();
        tracing::info!(
            repositories = state.repositories.len(),
            scrapers = state.scrapers.len(),
            global_enabled = state.global_enabled,
            "plugin store loaded"
        );
        let (current, _) = watch::channel(Arc::new(StoreSnapshot::from_state(0, state)));
        Ok(Self {
            persistence,
            writer: tokio::sync::Mutex::new(()),
            current,
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Empty store backed by memory.
    pub fn in_memory() -> Self {
        let (current, _) = watch::channel(Arc::new(StoreSnapshot::from_state(
            0,
            PersistedState::default(),
        )));
        Self {
            persistence: Arc::new(MemoryPersistence::new()),
            writer: tokio::sync::Mutex::new(()),
            current,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.current.borrow().clone()
    }

    /// Latest-value receiver; intermediate snapshots may be skipped.
    pub fn watch(&self) -> watch::Receiver<Arc<StoreSnapshot>> {
        self.current.subscribe()
    }

    /// Every committed snapshot in mutation order, starting with the
    /// current one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            let _ = tx.send(StoreUpdate {
                event: StoreEvent::Loaded,
                snapshot: self.snapshot(),
            });
            subscribers.push(tx);
        }
        rx
    }

    pub fn list(&self) -> Vec<RepositoryDescriptor> {
        self.snapshot().repositories.clone()
    }

    pub fn get(&self, id: Uuid) -> Option<RepositoryDescriptor> {
        self.snapshot().get(id).cloned()
    }

    pub fn get_scraper(&self, id: &str) -> Option<ScraperDescriptor> {
        self.snapshot().get_scraper(id).cloned()
    }

    pub fn find_by_url(&self, url: &str) -> Option<RepositoryDescriptor> {
        self.snapshot().find_by_url(url).cloned()
    }

    pub fn scrapers_of(&self, repository_id: Uuid) -> Vec<ScraperDescriptor> {
        self.snapshot()
            .scrapers_of(repository_id)
            .into_iter()
            .cloned()
            .collect()
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Insert or replace a repository together with its full scraper set.
    ///
    /// Scrapers are re-keyed to `<repository id>:<manifest id>` and the
    /// repository's `scraper_ids` is rebuilt from them. Scrapers of a
    /// previous version that are not in `scrapers` are dropped.
    pub async fn upsert_repository(
        &self,
        repository: RepositoryDescriptor,
        scrapers: Vec<ScraperDescriptor>,
    ) -> Result<RepositoryDescriptor, PluginError> {
        self.put_repository(repository, scrapers, PutMode::Upsert).await
    }

    /// Like [`upsert_repository`](Self::upsert_repository) but fails with
    /// `DuplicateRepository` when the repository is already installed.
    pub async fn insert_repository(
        &self,
        repository: RepositoryDescriptor,
        scrapers: Vec<ScraperDescriptor>,
    ) -> Result<RepositoryDescriptor, PluginError> {
        self.put_repository(repository, scrapers, PutMode::Insert).await
    }

    /// Replace the scrapers of an installed repository with a freshly
    /// fetched set.
    ///
    /// Enabled flags of surviving scrapers are read under the writer lock,
    /// so toggles made while the new set was being fetched are kept. Fails
    /// with `NotFound` when the repository was removed in the meantime.
    pub async fn refresh_repository(
        &self,
        repository: RepositoryDescriptor,
        scrapers: Vec<ScraperDescriptor>,
    ) -> Result<RepositoryDescriptor, PluginError> {
        self.put_repository(repository, scrapers, PutMode::Refresh)
            .await
    }

    async fn put_repository(
        &self,
        mut repository: RepositoryDescriptor,
        scrapers: Vec<ScraperDescriptor>,
        mode: PutMode,
    ) -> Result<RepositoryDescriptor, PluginError> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();

        if mode == PutMode::Refresh {
            let installed = current
                .get(repository.id)
                .ok_or_else(|| PluginError::NotFound(format!("repository {}", repository.id)))?;
            repository.installed_at = installed.installed_at;
        }

        let key = repository.url_key();
        if let Some(other) = current
            .repositories
            .iter()
            .find(|r| {
                if r.id == repository.id {
                    mode == PutMode::Insert
                } else {
                    r.url_key() == key
                }
            })
        {
            return Err(PluginError::DuplicateRepository(other.canonical_url.clone()));
        }

        let mut next = current.to_state();
        let previous_ids: Vec<String> = next
            .repositories
            .iter()
            .find(|r| r.id == repository.id)
            .map(|r| r.scraper_ids.clone())
            .unwrap_or_default();

        let mut incoming = Vec::with_capacity(scrapers.len());
        for mut scraper in scrapers {
            scraper.repository_id = repository.id;
            scraper.id = ScraperDescriptor::qualified_id(repository.id, &scraper.manifest_id);
            if mode == PutMode::Refresh {
                if let Some(existing) = current.scrapers.get(&scraper.id) {
                    scraper.enabled = existing.enabled;
                }
            }
            incoming.push(scraper);
        }
        repository.scraper_ids = incoming.iter().map(|s| s.id.clone()).collect();

        let removed: Vec<String> = previous_ids
            .iter()
            .filter(|id| !repository.scraper_ids.contains(id))
            .cloned()
            .collect();
        let added: Vec<String> = repository
            .scraper_ids
            .iter()
            .filter(|id| !previous_ids.contains(id))
            .cloned()
            .collect();

        for id in &previous_ids {
            next.scrapers.remove(id);
        }
        for scraper in incoming {
            next.scrapers.insert(scraper.id.clone(), scraper);
        }
        match next.repositories.iter_mut().find(|r| r.id == repository.id) {
            Some(slot) => *slot = repository.clone(),
            None => next.repositories.push(repository.clone()),
        }

        self.commit(
            &current,
            next,
            StoreEvent::RepositoryUpserted {
                repository_id: repository.id,
                added,
                removed,
            },
        )
        .await?;

        tracing::info!(
            repository = %repository.canonical_url,
            scrapers = repository.scraper_count(),
            "repository stored"
        );
        Ok(repository)
    }

    /// Remove a repository and all of its scrapers in one step.
    pub async fn remove_repository(&self, id: Uuid) -> Result<RepositoryDescriptor, PluginError> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();

        let mut next = current.to_state();
        let index = next
            .repositories
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| PluginError::NotFound(format!("repository {id}")))?;
        let repository = next.repositories.remove(index);
        for scraper_id in &repository.scraper_ids {
            next.scrapers.remove(scraper_id);
        }

        self.commit(
            &current,
            next,
            StoreEvent::RepositoryRemoved {
                repository_id: id,
                scraper_ids: repository.scraper_ids.clone(),
            },
        )
        .await?;

        tracing::info!(repository = %repository.canonical_url, "repository removed");
        Ok(repository)
    }

    pub async fn set_scraper_enabled(&self, id: &str, enabled: bool) -> Result<(), PluginError> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();

        let mut next = current.to_state();
        let scraper = next
            .scrapers
            .get_mut(id)
            .ok_or_else(|| PluginError::NotFound(format!("scraper {id}")))?;
        if scraper.enabled == enabled {
            return Ok(());
        }
        scraper.enabled = enabled;

        self.commit(
            &current,
            next,
            StoreEvent::ScraperToggled {
                scraper_id: id.to_string(),
                enabled,
            },
        )
        .await?;
        tracing::info!(scraper = %id, enabled, "scraper toggled");
        Ok(())
    }

    /// Master switch. Per-scraper flags are left as they are.
    pub async fn set_plugins_globally_enabled(&self, enabled: bool) -> Result<(), PluginError> {
        let _writer = self.writer.lock().await;
        let current = self.snapshot();
        if current.global_enabled == enabled {
            return Ok(());
        }

        let mut next = current.to_state();
        next.global_enabled = enabled;
        self.commit(&current, next, StoreEvent::GlobalToggled { enabled })
            .await?;
        tracing::info!(enabled, "plugins globally toggled");
        Ok(())
    }

    /// Persist `next`, then publish it. Caller holds the writer lock.
    async fn commit(
        &self,
        current: &StoreSnapshot,
        next: PersistedState,
        event: StoreEvent,
    ) -> Result<(), PluginError> {
        self.persistence.save(&next).await?;

        let snapshot = Arc::new(StoreSnapshot::from_state(current.revision + 1, next));
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| PluginError::Persistence("subscriber list poisoned".into()))?;
        self.current.send_replace(snapshot.clone());
        subscribers.retain(|tx| {
            tx.send(StoreUpdate {
                event: event.clone(),
                snapshot: snapshot.clone(),
            })
            .is_ok()
        });
        tracing::debug!(revision = snapshot.revision, event = event.name(), "store committed");
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
