//! WASM scraper sandbox using Extism (wasmtime).
//!
//! Every invocation instantiates a fresh plugin from the scraper's stored
//! module, so no state survives between calls or leaks across scrapers.
//! WASI is never linked: a script sees only the host functions in
//! [`crate::host_functions`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use extism::{CancelHandle, UserData};
use tokio_util::sync::CancellationToken;

use crate::descriptor::ScraperDescriptor;
use crate::error::InvocationError;
use crate::host_functions::{build_http_client, host_functions, HostContext};
use crate::stream::{parse_script_output, AggregationQuery, StreamResult};

/// Export every scraper module must provide.
pub const ENTRY_POINT: &str = "get_streams";

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Instruction budget per invocation. `None` leaves only the wall clock.
    pub fuel_limit: Option<u64>,
    /// Timeout for a single `http_fetch` in seconds (default: 10).
    pub http_timeout_secs: u64,
    /// Wall-clock budget when a caller does not pass its own (default: 20).
    pub invocation_timeout_secs: u64,
    /// Lets scripts reach loopback and LAN addresses. Off outside tests.
    pub allow_private_hosts: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: None,
            http_timeout_secs: 10,
            invocation_timeout_secs: 20,
            allow_private_hosts: false,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            memory_limit: std::env::var("PLUGIN_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(32)
                * 1024
                * 1024,
            fuel_limit: std::env::var("PLUGIN_FUEL_LIMIT")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0),
            http_timeout_secs: std::env::var("PLUGIN_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            invocation_timeout_secs: std::env::var("SCRAPER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            allow_private_hosts: std::env::var("PLUGIN_ALLOW_PRIVATE_HOSTS")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }
}

// ─── Runtime trait ──────────────────────────────────────────────────────

/// Executes one scraper against one query.
///
/// Implementations must return within `timeout` and must stop all work
/// when the returned future is dropped.
#[async_trait]
pub trait ScraperRuntime: Send + Sync + 'static {
    async fn invoke(
        &self,
        scraper: &ScraperDescriptor,
        query: &AggregationQuery,
        timeout: Duration,
    ) -> Result<Vec<StreamResult>, InvocationError>;
}

// ─── Extism runtime ─────────────────────────────────────────────────────

/// Sandbox runtime backed by Extism.
pub struct WasmRuntime {
    config: SandboxConfig,
    http_client: reqwest::Client,
}

impl std::fmt::Debug for WasmRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl WasmRuntime {
    pub fn new(config: SandboxConfig) -> Self {
        let http_client = build_http_client();
        Self {
            config,
            http_client,
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

/// Stops a running invocation when dropped, unless disarmed.
struct InvocationGuard {
    cancel: CancellationToken,
    plugin_handle: Arc<Mutex<Option<CancelHandle>>>,
    armed: bool,
}

impl InvocationGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancel.cancel();
        if let Ok(mut slot) = self.plugin_handle.lock() {
            if let Some(handle) = slot.take() {
                let _ = handle.cancel();
            }
        }
    }
}

/// Build a plugin and call its entry point. Runs on a blocking thread.
fn run_plugin(
    wasm: Vec<u8>,
    config: &SandboxConfig,
    timeout: Duration,
    user_data: UserData<HostContext>,
    input: &[u8],
    plugin_handle: &Mutex<Option<CancelHandle>>,
) -> Result<Vec<u8>, CallFailure> {
    let manifest = extism::Manifest::new([extism::Wasm::data(wasm)])
        .with_memory_max((config.memory_limit / 65536) as u32)
        .with_timeout(timeout);

    let mut builder = extism::PluginBuilder::new(manifest)
        .with_wasi(false)
        .with_functions(host_functions(&user_data));
    if let Some(fuel) = config.fuel_limit {
        builder = builder.with_fuel_limit(fuel);
    }

    let mut plugin = builder
        .build()
        .map_err(|e| CallFailure::Instantiation(e.to_string()))?;

    if !plugin.function_exists(ENTRY_POINT) {
        return Err(CallFailure::Instantiation(format!(
            "module does not export '{ENTRY_POINT}'"
        )));
    }

    if let Ok(mut slot) = plugin_handle.lock() {
        *slot = Some(plugin.cancel_handle());
    }

    let result = plugin
        .call::<&[u8], Vec<u8>>(ENTRY_POINT, input)
        .map_err(|e| CallFailure::Trap(format!("{e:#}")));

    if let Ok(mut slot) = plugin_handle.lock() {
        slot.take();
    }
    result
}

enum CallFailure {
    Instantiation(String),
    Trap(String),
}

/// Map a trap onto the invocation error taxonomy.
///
/// A fault recorded by a host function wins, then the clock, then any
/// network failure the script saw before giving up.
fn classify_trap(
    message: String,
    user_data: &UserData<HostContext>,
    elapsed: Duration,
    timeout: Duration,
) -> InvocationError {
    let (fault, network_error) = match user_data.get() {
        Ok(ctx) => match ctx.lock() {
            Ok(ctx) => (
                ctx.fault().cloned(),
                ctx.last_network_error().map(str::to_string),
            ),
            Err(_) => (None, None),
        },
        Err(_) => (None, None),
    };

    if let Some(fault) = fault {
        return fault;
    }
    let lowered = message.to_ascii_lowercase();
    if elapsed >= timeout || lowered.contains("timeout") || lowered.contains("timed out") {
        return InvocationError::Timeout;
    }
    if lowered.contains("fuel") {
        return InvocationError::ScriptFault("instruction budget exhausted".into());
    }
    if let Some(err) = network_error {
        return InvocationError::Unreachable(err);
    }
    InvocationError::ScriptFault(message)
}

#[async_trait]
impl ScraperRuntime for WasmRuntime {
    async fn invoke(
        &self,
        scraper: &ScraperDescriptor,
        query: &AggregationQuery,
        timeout: Duration,
    ) -> Result<Vec<StreamResult>, InvocationError> {
        let input = serde_json::to_vec(query)
            .map_err(|e| InvocationError::Instantiation(format!("query encoding: {e}")))?;

        let cancel = CancellationToken::new();
        let plugin_handle = Arc::new(Mutex::new(None));
        let mut guard = InvocationGuard {
            cancel: cancel.clone(),
            plugin_handle: plugin_handle.clone(),
            armed: true,
        };

        let ctx = HostContext::new(
            scraper.id.clone(),
            scraper.capability_manifest.http_hosts.clone(),
            self.config.allow_private_hosts,
            self.http_client.clone(),
            Duration::from_secs(self.config.http_timeout_secs),
            tokio::runtime::Handle::current(),
            cancel,
        );
        let user_data = UserData::new(ctx);

        let wasm = scraper.script_source.clone();
        let config = self.config.clone();
        let worker_data = user_data.clone();
        let worker_handle = plugin_handle.clone();
        let started = Instant::now();

        tracing::debug!(scraper = %scraper.id, "invoking scraper");
        let task = tokio::task::spawn_blocking(move || {
            run_plugin(wasm, &config, timeout, worker_data, &input, &worker_handle)
        });

        let result = match tokio::time::timeout(timeout, task).await {
            Err(_) => {
                // guard drop cancels the token and the plugin
                tracing::warn!(scraper = %scraper.id, ?timeout, "scraper timed out");
                return Err(InvocationError::Timeout);
            }
            Ok(Err(join_err)) => {
                tracing::error!(scraper = %scraper.id, "sandbox worker panicked: {join_err}");
                Err(InvocationError::ScriptFault("sandbox worker panicked".into()))
            }
            Ok(Ok(Ok(output))) => parse_script_output(&output, &scraper.name),
            Ok(Ok(Err(CallFailure::Instantiation(msg)))) => Err(InvocationError::Instantiation(msg)),
            Ok(Ok(Err(CallFailure::Trap(msg)))) => {
                Err(classify_trap(msg, &user_data, started.elapsed(), timeout))
            }
        };
        guard.disarm();

        match &result {
            Ok(streams) => tracing::debug!(
                scraper = %scraper.id,
                count = streams.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "scraper finished"
            ),
            Err(e) => tracing::info!(scraper = %scraper.id, kind = e.kind(), "scraper failed: {e}"),
        }
        result
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────
