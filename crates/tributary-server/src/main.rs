use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tributary_aggregator::{
    AggregationEvent, Aggregator, AggregatorConfig, EnrichmentCache, HttpMetadataFetcher,
    SourceStatus,
};
use tributary_plugin::{
    AggregationQuery, ContentKind, JsonFilePersistence, ManagerConfig, PluginStore,
    RepositoryManager, SandboxConfig, ScraperRuntime, WasmRuntime,
};
use tributary_server::{start_on_available_port, HostConfig, PairingConfig, PairingHooks, PendingChange};
use uuid::Uuid;

const USAGE: &str = "usage: tributary [serve | list | add <url> | remove <url> | refresh | \
                     query <movie|series> <id> [season episode]]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let host = HostConfig::from_env();
    let persistence = Arc::new(JsonFilePersistence::in_dir(&host.data_dir));
    tracing::info!(path = %persistence.path().display(), "opening plugin store");
    let store = Arc::new(
        PluginStore::open(persistence)
            .await
            .context("failed to open plugin store")?,
    );

    let runtime: Arc<dyn ScraperRuntime> = Arc::new(WasmRuntime::new(SandboxConfig::from_env()));
    let manager_config = ManagerConfig::from_env();
    let fetcher = Arc::new(manager_config.http_fetcher());
    let manager = Arc::new(RepositoryManager::new(
        store.clone(),
        fetcher,
        runtime.clone(),
        manager_config,
    ));

    let mut aggregator = Aggregator::new(store.clone(), runtime, AggregatorConfig::from_env());
    if let Some(base_url) = &host.enrichment_base_url {
        let metadata = HttpMetadataFetcher::new(base_url.clone(), Duration::from_secs(10));
        aggregator = aggregator.with_enrichment(Arc::new(EnrichmentCache::new(Arc::new(metadata))));
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("serve") => serve(manager).await,
        Some("list") => {
            list(&store);
            Ok(())
        }
        Some("add") => {
            let url = args.get(1).context(USAGE)?;
            let repo = manager.add_repository(url).await?;
            println!(
                "installed {} ({} scrapers) from {}",
                repo.name,
                repo.scraper_count(),
                repo.canonical_url
            );
            Ok(())
        }
        Some("remove") => {
            let url = args.get(1).context(USAGE)?;
            let repo = store
                .find_by_url(url)
                .with_context(|| format!("no repository installed from {url}"))?;
            manager.remove_repository(repo.id).await?;
            println!("removed {}", repo.name);
            Ok(())
        }
        Some("refresh") => {
            for report in manager.refresh_all().await {
                match report.result {
                    Ok(repo) => println!("refreshed {} ({} scrapers)", repo.name, repo.scraper_count()),
                    Err(e) => println!("failed {}: {e}", report.canonical_url),
                }
            }
            Ok(())
        }
        Some("query") => query(&aggregator, &args[1..]).await,
        Some(other) => bail!("unknown command '{other}'\n{USAGE}"),
    }
}

fn list(store: &PluginStore) {
    let snapshot = store.snapshot();
    if !snapshot.global_enabled {
        println!("(plugins are globally disabled)");
    }
    for repo in snapshot.list() {
        println!("{}  {}", repo.name, repo.canonical_url);
        for scraper in snapshot.scrapers_of(repo.id) {
            let flag = if scraper.enabled { "on " } else { "off" };
            println!("  [{flag}] {} ({})", scraper.name, scraper.manifest_id);
        }
    }
}

async fn query(aggregator: &Aggregator, args: &[String]) -> anyhow::Result<()> {
    let (kind, id) = match args {
        [kind, id, ..] => (kind.parse::<ContentKind>().map_err(anyhow::Error::msg)?, id),
        _ => bail!(USAGE),
    };
    let query = match (kind, &args[2..]) {
        (ContentKind::Movie, []) => AggregationQuery::movie(id),
        (ContentKind::Series, [season, episode]) => AggregationQuery::episode(
            id,
            season.parse().context("season must be a number")?,
            episode.parse().context("episode must be a number")?,
        ),
        _ => bail!(USAGE),
    };

    let mut stream = aggregator.query(query);
    while let Some(event) = stream.next().await {
        match event {
            AggregationEvent::Source(outcome) => match &outcome.status {
                SourceStatus::Succeeded { streams } => tracing::info!(
                    scraper = %outcome.scraper_name,
                    streams = streams.len(),
                    elapsed_ms = outcome.elapsed_ms,
                    "source finished"
                ),
                SourceStatus::Failed { error } => tracing::info!(
                    scraper = %outcome.scraper_name,
                    kind = error.kind(),
                    elapsed_ms = outcome.elapsed_ms,
                    "source failed: {error}"
                ),
                SourceStatus::Skipped { reason } => {
                    tracing::info!(scraper = %outcome.scraper_name, ?reason, "source skipped")
                }
            },
            AggregationEvent::Completed(outcome) => {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
        }
    }
    Ok(())
}

/// Run the pairing server and ask the local user about each proposal.
async fn serve(manager: Arc<RepositoryManager>) -> anyhow::Result<()> {
    let (tx, mut proposals) = mpsc::unbounded_channel::<PendingChange>();
    let hooks = PairingHooks::for_manager(manager, move |change| {
        let _ = tx.send(change.clone());
    });

    let handle = match start_on_available_port(hooks, PairingConfig::from_env()).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!("pairing disabled: {e}");
            tokio::signal::ctrl_c().await?;
            return Ok(());
        }
    };
    match handle.pairing_url() {
        Some(url) => tracing::info!(%url, "open this URL on the other device"),
        None => tracing::warn!(
            port = handle.port(),
            "no local network address; pairing is only reachable from this machine"
        ),
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut awaiting: Option<Uuid> = None;

    loop {
        tokio::select! {
            Some(change) = proposals.recv() => {
                print_proposal(&change);
                awaiting = Some(change.change_id);
            }
            line = stdin.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                let Some(id) = awaiting else {
                    continue;
                };
                match line.trim().to_ascii_lowercase().as_str() {
                    "y" | "yes" => {
                        awaiting = None;
                        match handle.confirm_change(id).await {
                            Some(report) if report.is_clean() => println!("applied"),
                            Some(report) => {
                                for (url, e) in &report.failed {
                                    println!("failed {url}: {e}");
                                }
                            }
                            None => println!("that change is no longer pending"),
                        }
                    }
                    "n" | "no" => {
                        awaiting = None;
                        if !handle.reject_change(id).await {
                            println!("that change is no longer pending");
                        }
                    }
                    _ => println!("answer y or n"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.stop().await;
    Ok(())
}

fn print_proposal(change: &PendingChange) {
    println!("\n{} proposes a repository change:", change.proposer);
    for url in &change.diff.added {
        println!("  + {url}");
    }
    for url in &change.diff.removed {
        println!("  - {url}");
    }
    if change.diff.is_empty() {
        println!("  (no difference)");
    }
    println!("apply it? [y/n]");
}
