//! Fan-out of one query to every eligible scraper.
//!
//! Each source runs in its own task under a per-source timeout and a
//! shared concurrency cap. Outcomes are reported as they arrive; the
//! final outcome lists every configured scraper in configuration order.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tributary_plugin::{
    AggregationQuery, InvocationError, PluginStore, ScraperDescriptor, ScraperRuntime,
    StoreSnapshot, StreamResult,
};

use crate::enrichment::{EnrichmentCache, EnrichmentKey, Metadata};
use crate::error::AggregationError;
use crate::merge::{merge_results, MergedStream};

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Budget for one source (default: 20 s).
    pub source_timeout: Duration,
    /// Absolute budget for the whole query (default: 45 s).
    pub deadline: Duration,
    /// Sandbox instances running at once (default: 8).
    pub max_concurrency: usize,
    /// How long a pending metadata lookup may hold back the final outcome
    /// once every source has reported (default: 250 ms).
    pub enrichment_grace: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            source_timeout: Duration::from_secs(20),
            deadline: Duration::from_secs(45),
            max_concurrency: 8,
            enrichment_grace: Duration::from_millis(250),
        }
    }
}

impl AggregatorConfig {
    pub fn from_env() -> Self {
        let secs = |name: &str, default: u64| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };
        Self {
            source_timeout: Duration::from_secs(secs("AGGREGATOR_SOURCE_TIMEOUT_SECS", 20)),
            deadline: Duration::from_secs(secs("AGGREGATOR_DEADLINE_SECS", 45)),
            max_concurrency: std::env::var("AGGREGATOR_MAX_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(8),
            enrichment_grace: Duration::from_millis(secs("AGGREGATOR_ENRICHMENT_GRACE_MS", 250)),
        }
    }
}

// ─── Outcomes ───────────────────────────────────────────────────────────

/// Why a configured scraper was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    GloballyDisabled,
    Disabled,
    /// Content kind or id prefix not declared by the scraper.
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Succeeded {
        streams: Vec<StreamResult>,
    },
    Failed {
        #[serde(serialize_with = "serialize_invocation_error")]
        error: InvocationError,
    },
    Skipped {
        reason: SkipReason,
    },
}

fn serialize_invocation_error<S: Serializer>(
    error: &InvocationError,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeStruct;
    let mut s = serializer.serialize_struct("InvocationError", 2)?;
    s.serialize_field("kind", error.kind())?;
    s.serialize_field("message", &error.to_string())?;
    s.end()
}

/// What one configured scraper produced for the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceOutcome {
    pub scraper_id: String,
    pub scraper_name: String,
    /// Index in configuration order.
    pub position: usize,
    #[serde(flatten)]
    pub status: SourceStatus,
    pub elapsed_ms: u64,
}

impl SourceOutcome {
    pub fn streams(&self) -> &[StreamResult] {
        match &self.status {
            SourceStatus::Succeeded { streams } => streams,
            _ => &[],
        }
    }

    pub fn error(&self) -> Option<&InvocationError> {
        match &self.status {
            SourceStatus::Failed { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationOutcome {
    pub query: AggregationQuery,
    /// One entry per configured scraper, in configuration order.
    pub per_source_results: Vec<SourceOutcome>,
    pub merged_results: Vec<MergedStream>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<Metadata>,
    pub completed_at: DateTime<Utc>,
}

impl AggregationOutcome {
    pub fn succeeded(&self) -> impl Iterator<Item = &SourceOutcome> {
        self.per_source_results
            .iter()
            .filter(|o| matches!(o.status, SourceStatus::Succeeded { .. }))
    }
}

#[derive(Debug, Clone)]
pub enum AggregationEvent {
    /// A source finished, failed or was skipped. Completion order.
    Source(SourceOutcome),
    /// Always last.
    Completed(AggregationOutcome),
}

// ─── Aggregator ─────────────────────────────────────────────────────────

pub struct Aggregator {
    store: Arc<PluginStore>,
    runtime: Arc<dyn ScraperRuntime>,
    enrichment: Option<Arc<EnrichmentCache>>,
    config: AggregatorConfig,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("config", &self.config)
            .field("enrichment", &self.enrichment.is_some())
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    pub fn new(
        store: Arc<PluginStore>,
        runtime: Arc<dyn ScraperRuntime>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            enrichment: None,
            config,
        }
    }

    pub fn with_enrichment(mut self, cache: Arc<EnrichmentCache>) -> Self {
        self.enrichment = Some(cache);
        self
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Start a query against the current store snapshot.
    ///
    /// Nothing runs until the stream is first polled. Dropping the stream
    /// aborts every outstanding invocation.
    pub fn query(&self, query: AggregationQuery) -> AggregationStream {
        AggregationStream {
            state: StreamState::Pending(Box::new(Plan {
                snapshot: self.store.snapshot(),
                runtime: self.runtime.clone(),
                enrichment: self.enrichment.clone(),
                config: self.config.clone(),
                query,
            })),
        }
    }

    /// Run a query to completion and return only the final outcome.
    ///
    /// The driver always ends with `Completed`; the error only surfaces if
    /// the driver task itself died.
    pub async fn query_outcome(
        &self,
        query: AggregationQuery,
    ) -> Result<AggregationOutcome, AggregationError> {
        let mut stream = self.query(query);
        while let Some(event) = stream.next().await {
            if let AggregationEvent::Completed(outcome) = event {
                return Ok(outcome);
            }
        }
        Err(AggregationError::Interrupted)
    }
}

// ─── Stream ─────────────────────────────────────────────────────────────

struct Plan {
    snapshot: Arc<StoreSnapshot>,
    runtime: Arc<dyn ScraperRuntime>,
    enrichment: Option<Arc<EnrichmentCache>>,
    config: AggregatorConfig,
    query: AggregationQuery,
}

enum StreamState {
    Pending(Box<Plan>),
    Running {
        events: mpsc::UnboundedReceiver<AggregationEvent>,
        driver: JoinHandle<()>,
    },
    Done,
}

/// Lazy, finite, non-restartable sequence of [`AggregationEvent`]s.
pub struct AggregationStream {
    state: StreamState,
}

impl AggregationStream {
    /// Next event, or `None` once the completed outcome has been yielded.
    pub async fn next(&mut self) -> Option<AggregationEvent> {
        if let StreamState::Pending(_) = self.state {
            let StreamState::Pending(plan) = std::mem::replace(&mut self.state, StreamState::Done)
            else {
                return None;
            };
            let (tx, rx) = mpsc::unbounded_channel();
            let driver = tokio::spawn(drive(*plan, tx));
            self.state = StreamState::Running { events: rx, driver };
        }

        let StreamState::Running { events, .. } = &mut self.state else {
            return None;
        };
        match events.recv().await {
            Some(event) => {
                if matches!(event, AggregationEvent::Completed(_)) {
                    self.state = StreamState::Done;
                }
                Some(event)
            }
            None => {
                self.state = StreamState::Done;
                None
            }
        }
    }
}

impl Drop for AggregationStream {
    fn drop(&mut self) {
        if let StreamState::Running { driver, .. } = &self.state {
            driver.abort();
        }
    }
}

/// Aborts the tasks it holds when dropped.
struct SourceTasks(Vec<AbortHandle>);

impl Drop for SourceTasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

fn skip_reason(snapshot: &StoreSnapshot, scraper: &ScraperDescriptor, query: &AggregationQuery) -> Option<SkipReason> {
    if !snapshot.global_enabled {
        Some(SkipReason::GloballyDisabled)
    } else if !scraper.enabled {
        Some(SkipReason::Disabled)
    } else if !scraper.capability_manifest.supports(query) {
        Some(SkipReason::Unsupported)
    } else {
        None
    }
}

async fn drive(plan: Plan, events: mpsc::UnboundedSender<AggregationEvent>) {
    let Plan {
        snapshot,
        runtime,
        enrichment,
        config,
        query,
    } = plan;
    let started = Instant::now();
    let deadline = started + config.deadline;
    let query = Arc::new(query);

    let enrichment_task = enrichment.map(|cache| {
        let key = EnrichmentKey::from(query.as_ref());
        tokio::spawn(async move { cache.get(&key).await })
    });

    let scrapers: Vec<ScraperDescriptor> = snapshot.scrapers_in_order().cloned().collect();
    let mut slots: Vec<Option<SourceOutcome>> = vec![None; scrapers.len()];

    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    let mut tasks = SourceTasks(Vec::new());
    let mut pending = 0usize;

    for (position, scraper) in scrapers.iter().enumerate() {
        if let Some(reason) = skip_reason(&snapshot, scraper, &query) {
            let outcome = SourceOutcome {
                scraper_id: scraper.id.clone(),
                scraper_name: scraper.name.clone(),
                position,
                status: SourceStatus::Skipped { reason },
                elapsed_ms: 0,
            };
            let _ = events.send(AggregationEvent::Source(outcome.clone()));
            slots[position] = Some(outcome);
            continue;
        }

        let runtime = runtime.clone();
        let semaphore = semaphore.clone();
        let query = query.clone();
        let scraper = scraper.clone();
        let result_tx = result_tx.clone();
        let source_timeout = config.source_timeout;

        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let begun = Instant::now();
            let result =
                match tokio::time::timeout(source_timeout, runtime.invoke(&scraper, &query, source_timeout))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(InvocationError::Timeout),
                };
            let _ = result_tx.send((position, result, begun.elapsed()));
        });
        tasks.0.push(handle.abort_handle());
        pending += 1;
    }
    drop(result_tx);

    tracing::debug!(
        external_id = %query.external_id,
        sources = scrapers.len(),
        attempted = pending,
        "aggregation started"
    );

    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);
    let mut deadline_hit = false;

    while pending > 0 {
        tokio::select! {
            received = result_rx.recv() => {
                let Some((position, result, elapsed)) = received else {
                    break;
                };
                pending -= 1;
                let scraper = &scrapers[position];
                let status = match result {
                    Ok(streams) => SourceStatus::Succeeded { streams },
                    Err(error) => {
                        tracing::debug!(scraper = %scraper.id, kind = error.kind(), "source failed: {error}");
                        SourceStatus::Failed { error }
                    }
                };
                let outcome = SourceOutcome {
                    scraper_id: scraper.id.clone(),
                    scraper_name: scraper.name.clone(),
                    position,
                    status,
                    elapsed_ms: elapsed.as_millis() as u64,
                };
                let _ = events.send(AggregationEvent::Source(outcome.clone()));
                slots[position] = Some(outcome);
            }
            _ = &mut sleep => {
                deadline_hit = true;
                break;
            }
        }
    }
    drop(tasks);

    let elapsed_ms = started.elapsed().as_millis() as u64;
    for (position, slot) in slots.iter_mut().enumerate() {
        if slot.is_some() {
            continue;
        }
        let scraper = &scrapers[position];
        let error = if deadline_hit {
            InvocationError::Timeout
        } else {
            InvocationError::ScriptFault("source task ended without reporting".into())
        };
        tracing::debug!(scraper = %scraper.id, kind = error.kind(), "source unresolved at end of query");
        let outcome = SourceOutcome {
            scraper_id: scraper.id.clone(),
            scraper_name: scraper.name.clone(),
            position,
            status: SourceStatus::Failed { error },
            elapsed_ms,
        };
        let _ = events.send(AggregationEvent::Source(outcome.clone()));
        *slot = Some(outcome);
    }

    let per_source_results: Vec<SourceOutcome> = slots.into_iter().flatten().collect();
    let merged_results = merge_results(&per_source_results);

    // A lookup still running after the grace period keeps going in the
    // background and lands in the cache for the next query.
    let enrichment = match enrichment_task {
        Some(task) => {
            let wait_until = (Instant::now() + config.enrichment_grace).min(deadline);
            match tokio::time::timeout_at(wait_until, task).await {
                Ok(Ok(Ok(metadata))) => metadata,
                Ok(Ok(Err(e))) => {
                    tracing::debug!(external_id = %query.external_id, "enrichment failed: {e}");
                    None
                }
                Ok(Err(e)) => {
                    tracing::warn!("enrichment task failed: {e}");
                    None
                }
                Err(_) => {
                    tracing::debug!(external_id = %query.external_id, "enrichment not ready, completing without it");
                    None
                }
            }
        }
        None => None,
    };

    tracing::info!(
        external_id = %query.external_id,
        sources = per_source_results.len(),
        succeeded = per_source_results
            .iter()
            .filter(|o| matches!(o.status, SourceStatus::Succeeded { .. }))
            .count(),
        merged = merged_results.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "aggregation completed"
    );

    let _ = events.send(AggregationEvent::Completed(AggregationOutcome {
        query: Arc::unwrap_or_clone(query),
        per_source_results,
        merged_results,
        enrichment,
        completed_at: Utc::now(),
    }));
}

// ─── Tests ──────────────────────────────────────────────────────────────
