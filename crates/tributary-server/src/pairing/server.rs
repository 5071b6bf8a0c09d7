//! Pairing server lifecycle: bind, serve, confirm/reject, stop.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tributary_plugin::{ApplyReport, ManifestFetcher, RepositoryManager};
use uuid::Uuid;

use super::routes;
use super::state::{ChangeDiff, ChangeState, PairingState, PendingChange};
use crate::config::PairingConfig;
use crate::error::PairingError;
use crate::network::{pairing_url, LocalAddressProvider, QrRenderer, UdpProbeAddressProvider};

// ─── Hooks ──────────────────────────────────────────────────────────────

/// One installed repository as shown to the remote device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositorySummary {
    pub url: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Branding image served at `/logo`.
#[derive(Debug, Clone)]
pub struct Logo {
    pub content_type: String,
    pub bytes: Bytes,
}

pub type RepositoriesProvider = Arc<dyn Fn() -> Vec<RepositorySummary> + Send + Sync>;
pub type ChangeCallback = Arc<dyn Fn(&PendingChange) + Send + Sync>;
pub type LogoProvider = Arc<dyn Fn() -> Option<Logo> + Send + Sync>;

/// Applies a confirmed change to the installed repository set.
#[async_trait]
pub trait ChangeApplier: Send + Sync + 'static {
    async fn apply(&self, diff: &ChangeDiff) -> ApplyReport;
}

#[async_trait]
impl ChangeApplier for RepositoryManager {
    async fn apply(&self, diff: &ChangeDiff) -> ApplyReport {
        self.apply_diff(&diff.added, &diff.removed).await
    }
}

/// Everything the pairing server needs from its host.
#[derive(Clone)]
pub struct PairingHooks {
    pub repositories: RepositoriesProvider,
    pub on_change_proposed: ChangeCallback,
    pub fetcher: Arc<dyn ManifestFetcher>,
    pub logo: LogoProvider,
    pub applier: Arc<dyn ChangeApplier>,
    pub address: Arc<dyn LocalAddressProvider>,
}

impl PairingHooks {
    /// Hooks backed by a repository manager and its store.
    pub fn for_manager(
        manager: Arc<RepositoryManager>,
        on_change_proposed: impl Fn(&PendingChange) + Send + Sync + 'static,
    ) -> Self {
        let store = manager.store().clone();
        Self {
            repositories: Arc::new(move || {
                store
                    .snapshot()
                    .repositories
                    .iter()
                    .map(|r| RepositorySummary {
                        url: r.canonical_url.clone(),
                        name: r.name.clone(),
                        description: r.description.clone(),
                    })
                    .collect()
            }),
            on_change_proposed: Arc::new(on_change_proposed),
            fetcher: manager.fetcher().clone(),
            logo: Arc::new(|| None),
            applier: manager,
            address: Arc::new(UdpProbeAddressProvider::default()),
        }
    }

    pub fn with_logo(mut self, logo: impl Fn() -> Option<Logo> + Send + Sync + 'static) -> Self {
        self.logo = Arc::new(logo);
        self
    }

    pub fn with_address_provider(mut self, address: Arc<dyn LocalAddressProvider>) -> Self {
        self.address = address;
        self
    }
}

// ─── Shared state ───────────────────────────────────────────────────────

pub(crate) struct Shared {
    pub(crate) hooks: PairingHooks,
    pub(crate) config: PairingConfig,
    /// Serializes proposal handling. Never held across an apply.
    pub(crate) state: Mutex<PairingState>,
    /// Confirmed changes are applied one at a time.
    apply: Mutex<()>,
}

impl Shared {
    pub(crate) fn new(hooks: PairingHooks, config: PairingConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PairingState::new(config.change_ttl)),
            apply: Mutex::new(()),
            hooks,
            config,
        })
    }

    pub(crate) async fn confirm(&self, id: Uuid) -> Option<ApplyReport> {
        let _applying = self.apply.lock().await;
        let resolved = self
            .state
            .lock()
            .await
            .resolve(id, ChangeState::Confirmed, Utc::now());
        let Some(change) = resolved else {
            tracing::debug!(change = %id, "confirm ignored");
            return None;
        };

        let report = self.hooks.applier.apply(&change.diff).await;
        tracing::info!(
            change = %id,
            added = report.added.len(),
            removed = report.removed.len(),
            failed = report.failed.len(),
            "pending change confirmed"
        );
        for (url, e) in &report.failed {
            tracing::warn!(repository = %url, "could not apply change: {e}");
        }
        Some(report)
    }

    pub(crate) async fn reject(&self, id: Uuid) -> bool {
        let resolved = self
            .state
            .lock()
            .await
            .resolve(id, ChangeState::Rejected, Utc::now());
        if resolved.is_some() {
            tracing::info!(change = %id, "pending change rejected");
        }
        resolved.is_some()
    }
}

// ─── Server handle ──────────────────────────────────────────────────────

/// A running pairing server.
pub struct ServerHandle {
    addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// Bind the first free candidate port and start serving.
pub async fn start_on_available_port(
    hooks: PairingHooks,
    config: PairingConfig,
) -> Result<ServerHandle, PairingError> {
    let mut listener = None;
    for port in config.candidate_ports() {
        match TcpListener::bind(SocketAddr::new(config.bind_addr, port)).await {
            Ok(l) => {
                listener = Some(l);
                break;
            }
            Err(e) => tracing::debug!(port, "pairing port unavailable: {e}"),
        }
    }
    let Some(listener) = listener else {
        return Err(PairingError::PortExhausted {
            start: config.port_start,
            end: config
                .port_start
                .saturating_add(config.port_count.saturating_sub(1)),
        });
    };
    let addr = listener.local_addr()?;

    let shared = Shared::new(hooks, config);
    let app = routes::router(shared.clone());
    let shutdown = CancellationToken::new();

    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
        if let Err(e) = served {
            tracing::error!("pairing server stopped: {e}");
        }
    });

    tracing::info!(%addr, "pairing server listening");
    Ok(ServerHandle {
        addr,
        shared,
        shutdown,
        task,
    })
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// URL a second device should open, or `None` when offline.
    pub fn pairing_url(&self) -> Option<String> {
        let ip = self.shared.hooks.address.local_address()?;
        Some(pairing_url(ip, self.addr.port()))
    }

    /// Render [`pairing_url`](Self::pairing_url) as a QR image.
    pub fn qr_code(&self, renderer: &dyn QrRenderer) -> Option<Result<Vec<u8>, PairingError>> {
        self.pairing_url().map(|url| renderer.render(&url))
    }

    /// The live proposal, if any.
    pub async fn pending(&self) -> Option<PendingChange> {
        self.shared.state.lock().await.live(Utc::now())
    }

    pub async fn change(&self, id: Uuid) -> Option<PendingChange> {
        self.shared.state.lock().await.get(id, Utc::now())
    }

    /// Apply a proposed change. `None` when `id` is unknown or terminal.
    pub async fn confirm_change(&self, id: Uuid) -> Option<ApplyReport> {
        self.shared.confirm(id).await
    }

    /// Reject a proposed change. `false` when `id` is unknown or terminal.
    pub async fn reject_change(&self, id: Uuid) -> bool {
        self.shared.reject(id).await
    }

    /// Stop accepting connections, finish in-flight requests and expire the
    /// live change.
    pub async fn stop(self) {
        if let Some(id) = self.shared.state.lock().await.expire_live() {
            tracing::info!(change = %id, "pending change discarded on shutdown");
        }
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!("pairing server task ended abnormally: {e}");
        }
        tracing::info!(addr = %self.addr, "pairing server stopped");
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::FixedAddressProvider;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tributary_plugin::{PluginError, RepositoryManifest};

    struct NoFetcher;

    #[async_trait]
    impl ManifestFetcher for NoFetcher {
        async fn fetch_manifest(&self, url: &str) -> Result<RepositoryManifest, PluginError> {
            Err(PluginError::Unreachable(url.to_string()))
        }

        async fn fetch_script(&self, url: &str) -> Result<Vec<u8>, PluginError> {
            Err(PluginError::Unreachable(url.to_string()))
        }
    }

    struct CountingApplier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChangeApplier for CountingApplier {
        async fn apply(&self, _diff: &ChangeDiff) -> ApplyReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ApplyReport::default()
        }
    }

    /// Applier that parks until released.
    struct GatedApplier {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ChangeApplier for GatedApplier {
        async fn apply(&self, _diff: &ChangeDiff) -> ApplyReport {
            self.entered.notify_one();
            self.release.notified().await;
            ApplyReport::default()
        }
    }

    struct EchoRenderer;

    impl QrRenderer for EchoRenderer {
        fn render(&self, url: &str) -> Result<Vec<u8>, PairingError> {
            Ok(url.as_bytes().to_vec())
        }
    }

    fn hooks(applier: Arc<dyn ChangeApplier>) -> PairingHooks {
        PairingHooks {
            repositories: Arc::new(Vec::<RepositorySummary>::new),
            on_change_proposed: Arc::new(|_| {}),
            fetcher: Arc::new(NoFetcher),
            logo: Arc::new(|| None),
            applier,
            address: Arc::new(FixedAddressProvider(Some(IpAddr::from([192, 168, 1, 20])))),
        }
    }

    fn applier() -> Arc<CountingApplier> {
        Arc::new(CountingApplier {
            calls: AtomicUsize::new(0),
        })
    }

    fn loopback(port_start: u16, port_count: u16) -> PairingConfig {
        PairingConfig {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_start,
            port_count,
            ..Default::default()
        }
    }

    // ── Binding ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_port_exhausted_when_all_taken() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = start_on_available_port(hooks(applier()), loopback(port, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::PortExhausted { start, end } if start == port && end == port));
    }

    #[tokio::test]
    async fn test_skips_taken_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        if port == u16::MAX {
            return;
        }

        match start_on_available_port(hooks(applier()), loopback(port, 2)).await {
            Ok(handle) => {
                assert_eq!(handle.port(), port + 1);
                handle.stop().await;
            }
            // the neighbouring port happened to be in use too
            Err(PairingError::PortExhausted { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    // ── Handle ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_pairing_url_and_qr() {
        let handle = start_on_available_port(hooks(applier()), loopback(0, 1))
            .await
            .unwrap();
        let expected = format!("http://192.168.1.20:{}/", handle.port());
        assert_eq!(handle.pairing_url().as_deref(), Some(expected.as_str()));
        let qr = handle.qr_code(&EchoRenderer).unwrap().unwrap();
        assert_eq!(qr, expected.into_bytes());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_pairing_url_offline() {
        let mut hooks = hooks(applier());
        hooks.address = Arc::new(FixedAddressProvider(None));
        let handle = start_on_available_port(hooks, loopback(0, 1)).await.unwrap();
        assert!(handle.pairing_url().is_none());
        assert!(handle.qr_code(&EchoRenderer).is_none());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_confirm_and_reject_are_noops_on_terminal_changes() {
        let applier = applier();
        let handle = start_on_available_port(hooks(applier.clone()), loopback(0, 1))
            .await
            .unwrap();

        let first = handle.shared.state.lock().await.propose(
            vec!["https://x.example.com/".into()],
            "p",
            &[],
            Utc::now(),
        );
        let id = first.change.change_id;

        assert!(handle.confirm_change(id).await.is_some());
        assert_eq!(applier.calls.load(Ordering::SeqCst), 1);
        assert!(handle.confirm_change(id).await.is_none());
        assert!(!handle.reject_change(id).await);
        assert_eq!(applier.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.change(id).await.unwrap().state, ChangeState::Confirmed);

        assert!(handle.confirm_change(Uuid::new_v4()).await.is_none());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_status_stays_responsive_during_apply() {
        let gated = Arc::new(GatedApplier {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let handle = start_on_available_port(hooks(gated.clone()), loopback(0, 1))
            .await
            .unwrap();
        let id = handle
            .shared
            .state
            .lock()
            .await
            .propose(vec!["https://x.example.com/".into()], "p", &[], Utc::now())
            .change
            .change_id;
        let status_url = format!("http://{}/status/{id}", handle.local_addr());

        let (report, polled) = tokio::join!(handle.confirm_change(id), async {
            gated.entered.notified().await;
            let polled =
                tokio::time::timeout(Duration::from_secs(2), reqwest::get(&status_url)).await;
            let pending = tokio::time::timeout(Duration::from_secs(2), handle.pending()).await;
            gated.release.notify_one();
            (polled, pending)
        });

        let (polled, pending) = polled;
        let resp = polled.expect("status blocked by apply").unwrap();
        assert_eq!(resp.status(), 200);
        let json: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(json["state"], "Confirmed");
        assert!(pending.expect("state lock held during apply").is_none());
        assert!(report.is_some());
        assert!(handle.confirm_change(id).await.is_none());
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_expires_live_change() {
        let handle = start_on_available_port(hooks(applier()), loopback(0, 1))
            .await
            .unwrap();
        let shared = handle.shared.clone();
        let id = shared
            .state
            .lock()
            .await
            .propose(vec!["https://x.example.com/".into()], "p", &[], Utc::now())
            .change
            .change_id;
        assert!(handle.pending().await.is_some());

        let addr = handle.local_addr();
        handle.stop().await;

        let state = shared.state.lock().await.get(id, Utc::now()).unwrap().state;
        assert_eq!(state, ChangeState::Expired);
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
