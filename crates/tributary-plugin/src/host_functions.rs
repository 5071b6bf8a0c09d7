//! Host functions exposed to scraper modules.
//!
//! Every invocation gets its own [`HostContext`]; nothing here is shared
//! between scrapers apart from the pooled HTTP client. The functions are
//! registered in the `extism:host/user` namespace and exchange JSON.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::Engine;
use extism::{convert::Json, host_fn, Function, UserData, PTR};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::InvocationError;

/// Maximum HTTP response body size (10 MB).
const MAX_HTTP_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Maximum log message length from plugins.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Maximum number of redirects followed by `http_fetch`.
const MAX_REDIRECTS: usize = 10;

/// Sanitize a log message from a plugin.
///
/// Strips control characters (except newline/tab), truncates to max length.
fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

/// Whether `host` names a loopback, private, link-local or metadata address.
fn is_private_host(host: &str) -> bool {
    let blocked = [
        "localhost",
        "127.0.0.1",
        "0.0.0.0",
        "[::1]",
        "169.254.169.254",
        "metadata.google.internal",
    ];
    if blocked.contains(&host) {
        return true;
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    match bare.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(v4)) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        Ok(std::net::IpAddr::V6(v6)) => v6.is_loopback() || v6.is_unspecified(),
        Err(_) => false,
    }
}

/// Build the HTTP client shared by all sandboxes of one runtime.
///
/// The client never follows redirects itself; [`HostContext::fetch`] walks
/// the chain so every hop passes the scraper's own host checks.
pub fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(concat!("tributary/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

/// Absolute `Location` of a redirect response.
fn redirect_target(resp: &reqwest::Response) -> Option<url::Url> {
    if !resp.status().is_redirection() {
        return None;
    }
    let location = resp.headers().get(reqwest::header::LOCATION)?.to_str().ok()?;
    resp.url().join(location).ok()
}

// ─── Types shared with plugins ────────────────────────────────────────

/// Request accepted by `http_fetch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Response returned by `http_fetch`.
///
/// Network failures are reported with `status: 0` and `error` set so a
/// script can fall back to another mirror instead of aborting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponse {
    pub status: u16,
    /// Final URL after redirects.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashRequest {
    /// `sha256` or `md5`.
    pub algorithm: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecryptRequest {
    /// Base64 AES key, 16 or 32 bytes.
    pub key: String,
    /// Base64 of `nonce (12 bytes) || ciphertext`.
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRequest {
    #[serde(default)]
    pub level: Option<String>,
    pub message: String,
}

// ─── Host context ─────────────────────────────────────────────────────

/// Per-invocation state behind the host functions.
///
/// Holds the scraper identity, its host allow-list, and the cancellation
/// token checked at every network suspension point.
pub struct HostContext {
    scraper_id: String,
    http_hosts: Vec<String>,
    allow_private_hosts: bool,
    http_client: reqwest::Client,
    http_timeout: Duration,
    runtime: tokio::runtime::Handle,
    cancel: CancellationToken,
    /// Fault that aborted the script from the host side.
    fault: Option<InvocationError>,
    /// Last network-level failure reported back to the script.
    last_network_error: Option<String>,
}

impl HostContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scraper_id: impl Into<String>,
        http_hosts: Vec<String>,
        allow_private_hosts: bool,
        http_client: reqwest::Client,
        http_timeout: Duration,
        runtime: tokio::runtime::Handle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scraper_id: scraper_id.into(),
            http_hosts,
            allow_private_hosts,
            http_client,
            http_timeout,
            runtime,
            cancel,
            fault: None,
            last_network_error: None,
        }
    }

    pub fn scraper_id(&self) -> &str {
        &self.scraper_id
    }

    /// Fault raised by a host function, if any.
    pub fn fault(&self) -> Option<&InvocationError> {
        self.fault.as_ref()
    }

    pub fn last_network_error(&self) -> Option<&str> {
        self.last_network_error.as_deref()
    }

    // ── HTTP ─────────────────────────────────────────────────────────

    /// Check if a URL's host is in the allowed list (supports glob patterns).
    fn check_http_host(&self, url: &url::Url) -> Result<(), InvocationError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(InvocationError::PermissionDenied(format!(
                "scheme '{}' is not allowed",
                url.scheme()
            )));
        }

        let host = url.host_str().ok_or_else(|| {
            InvocationError::PermissionDenied(format!("URL has no host: {url}"))
        })?;

        if !self.allow_private_hosts && is_private_host(host) {
            return Err(InvocationError::PermissionDenied(format!(
                "HTTP requests to '{host}' are blocked (private/reserved address)"
            )));
        }

        let matches = self.http_hosts.iter().any(|pattern| {
            if pattern == "*" {
                true
            } else if let Some(suffix) = pattern.strip_prefix("*.") {
                host == suffix || host.ends_with(&format!(".{suffix}"))
            } else {
                host == pattern
            }
        });

        if !matches {
            return Err(InvocationError::PermissionDenied(format!(
                "scraper '{}' is not allowed to access host '{host}'; allowed: {:?}",
                self.scraper_id, self.http_hosts
            )));
        }

        Ok(())
    }

    /// Perform one HTTP request on behalf of the script.
    ///
    /// Permission problems are errors; network failures become a
    /// `status: 0` response. Redirects are followed up to
    /// [`MAX_REDIRECTS`] and every target must pass the same host checks
    /// as the original URL.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, InvocationError> {
        let mut url = url::Url::parse(&request.url).map_err(|e| {
            InvocationError::PermissionDenied(format!("invalid URL '{}': {e}", request.url))
        })?;
        let mut method =
            reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes()).map_err(
                |_| InvocationError::PermissionDenied(format!("invalid method '{}'", request.method)),
            )?;
        let mut headers = request.headers.clone();
        let mut body = request.body.clone();

        for _ in 0..=MAX_REDIRECTS {
            self.check_http_host(&url)?;

            let mut req = self
                .http_client
                .request(method.clone(), url.clone())
                .timeout(self.http_timeout);
            for (k, v) in &headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if let Some(ref body) = body {
                req = req.body(body.clone());
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => return Ok(network_failure(&url, e.to_string())),
            };
            let Some(next) = redirect_target(&resp) else {
                return self.read_response(resp).await;
            };

            let status = resp.status();
            if status == reqwest::StatusCode::SEE_OTHER
                || (method == reqwest::Method::POST
                    && matches!(
                        status,
                        reqwest::StatusCode::MOVED_PERMANENTLY | reqwest::StatusCode::FOUND
                    ))
            {
                method = reqwest::Method::GET;
                body = None;
            }
            if next.host_str() != url.host_str() {
                headers.retain(|k, _| {
                    !matches!(
                        k.to_ascii_lowercase().as_str(),
                        "authorization" | "cookie" | "proxy-authorization"
                    )
                });
            }
            tracing::debug!(scraper = %self.scraper_id, from = %url, to = %next, "following redirect");
            url = next;
        }

        Ok(network_failure(&url, "too many redirects".into()))
    }

    /// Read HTTP response with body size limit.
    async fn read_response(&self, resp: reqwest::Response) -> Result<FetchResponse, InvocationError> {
        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let headers: BTreeMap<String, String> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        if resp
            .content_length()
            .is_some_and(|len| len as usize > MAX_HTTP_RESPONSE_BYTES)
        {
            return Ok(FetchResponse {
                status,
                url: final_url,
                headers,
                body: String::new(),
                error: Some("response body too large".into()),
            });
        }

        let body_bytes = match resp.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(FetchResponse {
                    status: 0,
                    url: final_url,
                    headers,
                    body: String::new(),
                    error: Some(e.to_string()),
                })
            }
        };

        if body_bytes.len() > MAX_HTTP_RESPONSE_BYTES {
            return Ok(FetchResponse {
                status,
                url: final_url,
                headers,
                body: String::new(),
                error: Some(format!(
                    "response body too large: {} bytes (max: {MAX_HTTP_RESPONSE_BYTES} bytes)",
                    body_bytes.len()
                )),
            });
        }

        Ok(FetchResponse {
            status,
            url: final_url,
            headers,
            body: String::from_utf8_lossy(&body_bytes).into_owned(),
            error: None,
        })
    }

    /// Blocking bridge used from inside the WASM worker thread.
    ///
    /// Returns early with [`InvocationError::Cancelled`] once the invocation
    /// token fires. Faults are remembered so the runtime can classify the
    /// trap that follows.
    pub fn fetch_blocking(&mut self, request: FetchRequest) -> Result<FetchResponse, InvocationError> {
        if self.cancel.is_cancelled() {
            self.fault = Some(InvocationError::Cancelled);
            return Err(InvocationError::Cancelled);
        }

        let runtime = self.runtime.clone();
        let cancel = self.cancel.clone();
        let result = runtime.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => Err(InvocationError::Cancelled),
                resp = self.fetch(&request) => resp,
            }
        });

        match result {
            Ok(resp) => {
                if let Some(ref err) = resp.error {
                    tracing::debug!(
                        scraper = %self.scraper_id,
                        url = %request.url,
                        "sandbox fetch failed: {err}"
                    );
                    self.last_network_error = Some(err.clone());
                }
                Ok(resp)
            }
            Err(e) => {
                self.fault = Some(e.clone());
                Err(e)
            }
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// Hex digest of `data`.
    pub fn hash(&self, request: &HashRequest) -> Result<String, InvocationError> {
        use sha2::Digest;

        match request.algorithm.to_ascii_lowercase().as_str() {
            "sha256" => {
                let digest = sha2::Sha256::digest(request.data.as_bytes());
                Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
            }
            "md5" => Ok(format!("{:x}", md5::compute(request.data.as_bytes()))),
            other => Err(InvocationError::ScriptFault(format!(
                "unsupported hash algorithm '{other}'"
            ))),
        }
    }

    pub fn base64_encode(&self, data: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(data.as_bytes())
    }

    pub fn base64_decode(&self, data: &str) -> Result<String, InvocationError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| InvocationError::ScriptFault(format!("base64 decode failed: {e}")))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// AES-GCM decryption for obfuscated feeds.
    pub fn aes_gcm_decrypt(&self, request: &DecryptRequest) -> Result<String, InvocationError> {
        use aes_gcm::{aead::Aead, Aes128Gcm, Aes256Gcm, KeyInit, Nonce};

        let engine = base64::engine::general_purpose::STANDARD;
        let fault = |msg: String| InvocationError::ScriptFault(msg);

        let key = engine
            .decode(request.key.trim())
            .map_err(|e| fault(format!("invalid key encoding: {e}")))?;
        let combined = engine
            .decode(request.data.trim())
            .map_err(|e| fault(format!("invalid data encoding: {e}")))?;

        if combined.len() < 12 {
            return Err(fault("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = combined.split_at(12);
        #[allow(deprecated)]
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = match key.len() {
            16 => Aes128Gcm::new_from_slice(&key)
                .map_err(|e| fault(format!("AES-GCM key init failed: {e}")))?
                .decrypt(nonce, ciphertext),
            32 => Aes256Gcm::new_from_slice(&key)
                .map_err(|e| fault(format!("AES-GCM key init failed: {e}")))?
                .decrypt(nonce, ciphertext),
            n => return Err(fault(format!("AES key must be 16 or 32 bytes, got {n}"))),
        }
        .map_err(|e| fault(format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext).map_err(|e| fault(format!("UTF-8 decode failed: {e}")))
    }

    /// Log a message on behalf of the plugin.
    pub fn log(&self, request: &LogRequest) {
        let msg = sanitize_log_message(&request.message);
        match request.level.as_deref().unwrap_or("info") {
            "error" => tracing::error!(scraper = %self.scraper_id, "{msg}"),
            "warn" => tracing::warn!(scraper = %self.scraper_id, "{msg}"),
            "debug" => tracing::debug!(scraper = %self.scraper_id, "{msg}"),
            _ => tracing::info!(scraper = %self.scraper_id, "{msg}"),
        }
    }
}

fn network_failure(url: &url::Url, error: String) -> FetchResponse {
    FetchResponse {
        status: 0,
        url: url.to_string(),
        error: Some(error),
        ..Default::default()
    }
}

// ─── Extism bindings ──────────────────────────────────────────────────

fn lock_error() -> extism::Error {
    extism::Error::msg("host context lock poisoned")
}

host_fn!(http_fetch(user_data: HostContext; request: Json<FetchRequest>) -> Json<FetchResponse> {
    let ctx = user_data.get()?;
    let mut ctx = ctx.lock().map_err(|_| lock_error())?;
    let Json(request) = request;
    let response = ctx.fetch_blocking(request).map_err(extism::Error::msg)?;
    Ok(Json(response))
});

host_fn!(hash(user_data: HostContext; request: Json<HashRequest>) -> String {
    let ctx = user_data.get()?;
    let ctx = ctx.lock().map_err(|_| lock_error())?;
    let Json(request) = request;
    ctx.hash(&request).map_err(extism::Error::msg)
});

host_fn!(base64_encode(user_data: HostContext; data: String) -> String {
    let ctx = user_data.get()?;
    let ctx = ctx.lock().map_err(|_| lock_error())?;
    Ok(ctx.base64_encode(&data))
});

host_fn!(base64_decode(user_data: HostContext; data: String) -> String {
    let ctx = user_data.get()?;
    let ctx = ctx.lock().map_err(|_| lock_error())?;
    ctx.base64_decode(&data).map_err(extism::Error::msg)
});

host_fn!(aes_gcm_decrypt(user_data: HostContext; request: Json<DecryptRequest>) -> String {
    let ctx = user_data.get()?;
    let ctx = ctx.lock().map_err(|_| lock_error())?;
    let Json(request) = request;
    ctx.aes_gcm_decrypt(&request).map_err(extism::Error::msg)
});

host_fn!(log_message(user_data: HostContext; request: Json<LogRequest>) {
    let ctx = user_data.get()?;
    let ctx = ctx.lock().map_err(|_| lock_error())?;
    let Json(request) = request;
    ctx.log(&request);
    Ok(())
});

/// Host functions bound to one invocation's context.
pub fn host_functions(user_data: &UserData<HostContext>) -> Vec<Function> {
    vec![
        Function::new("http_fetch", [PTR], [PTR], user_data.clone(), http_fetch),
        Function::new("hash", [PTR], [PTR], user_data.clone(), hash),
        Function::new("base64_encode", [PTR], [PTR], user_data.clone(), base64_encode),
        Function::new("base64_decode", [PTR], [PTR], user_data.clone(), base64_decode),
        Function::new("aes_gcm_decrypt", [PTR], [PTR], user_data.clone(), aes_gcm_decrypt),
        Function::new("log", [PTR], [], user_data.clone(), log_message),
    ]
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context(http_hosts: &[&str], allow_private_hosts: bool) -> HostContext {
        HostContext::new(
            "repo:test",
            http_hosts.iter().map(|h| h.to_string()).collect(),
            allow_private_hosts,
            build_http_client(),
            Duration::from_secs(5),
            tokio::runtime::Handle::current(),
            CancellationToken::new(),
        )
    }

    fn fetch_request(url: &str) -> FetchRequest {
        FetchRequest {
            url: url.to_string(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    // ── Log sanitizing ──────────────────────────────────────────────

    #[test]
    fn test_sanitize_strips_control_chars() {
        assert_eq!(sanitize_log_message("a\u{7}b\nc\td"), "ab\nc\td");
    }

    #[test]
    fn test_sanitize_truncates() {
        let long = "x".repeat(MAX_LOG_MESSAGE_LEN + 10);
        let out = sanitize_log_message(&long);
        assert!(out.ends_with("(truncated)"));
        assert!(out.starts_with(&"x".repeat(MAX_LOG_MESSAGE_LEN)));
    }

    // ── Host checks ─────────────────────────────────────────────────

    #[test]
    fn test_private_hosts() {
        assert!(is_private_host("localhost"));
        assert!(is_private_host("127.0.0.1"));
        assert!(is_private_host("192.168.1.20"));
        assert!(is_private_host("10.0.0.1"));
        assert!(is_private_host("[::1]"));
        assert!(is_private_host("169.254.169.254"));
        assert!(!is_private_host("cdn.example.com"));
        assert!(!is_private_host("8.8.8.8"));
    }

    #[tokio::test]
    async fn test_check_http_host_globs() {
        let ctx = context(&["api.example.com", "*.cdn.example.com"], false);
        let ok = |u: &str| ctx.check_http_host(&url::Url::parse(u).unwrap()).is_ok();
        assert!(ok("https://api.example.com/x"));
        assert!(ok("https://a.b.cdn.example.com/x"));
        assert!(ok("https://cdn.example.com/x"));
        assert!(!ok("https://evil.com/x"));
        assert!(!ok("ftp://api.example.com/x"));
    }

    #[tokio::test]
    async fn test_check_http_host_blocks_private_even_with_wildcard() {
        let ctx = context(&["*"], false);
        let err = ctx
            .check_http_host(&url::Url::parse("http://192.168.0.1/admin").unwrap())
            .unwrap_err();
        assert!(matches!(err, InvocationError::PermissionDenied(_)));
        assert!(err.to_string().contains("blocked"));
    }

    // ── Fetch ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_fetch_returns_status_headers_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .and(header("x-token", "abc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-served-by", "mock")
                    .set_body_string("hello"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(&["*"], true);
        let mut req = fetch_request(&format!("{}/feed", server.uri()));
        req.headers.insert("x-token".into(), "abc".into());

        let resp = ctx.fetch(&req).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "hello");
        assert_eq!(resp.headers.get("x-served-by").map(String::as_str), Some("mock"));
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn test_fetch_follows_redirects() {
        let server = MockServer::start().await;
        Mock::given(path("/old"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", format!("{}/new", server.uri())),
            )
            .mount(&server)
            .await;
        Mock::given(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;

        let ctx = context(&["*"], true);
        let resp = ctx.fetch(&fetch_request(&format!("{}/old", server.uri()))).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, "moved");
        assert!(resp.url.ends_with("/new"));
    }

    #[tokio::test]
    async fn test_fetch_redirect_outside_allow_list_denied() {
        let server = MockServer::start().await;
        let port = server.address().port();
        Mock::given(path("/hop"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", format!("http://localhost:{port}/landing")),
            )
            .mount(&server)
            .await;
        Mock::given(path("/landing"))
            .respond_with(ResponseTemplate::new(200).set_body_string("escaped"))
            .expect(0)
            .mount(&server)
            .await;

        // the mock listens on 127.0.0.1; only that name is allowed
        let ctx = context(&["127.0.0.1"], true);
        let err = ctx
            .fetch(&fetch_request(&format!("http://127.0.0.1:{port}/hop")))
            .await
            .unwrap_err();
        assert!(matches!(err, InvocationError::PermissionDenied(_)));
        assert!(err.to_string().contains("localhost"));
    }

    #[tokio::test]
    async fn test_fetch_redirect_loop_is_capped() {
        let server = MockServer::start().await;
        Mock::given(path("/loop"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/loop"))
            .expect((MAX_REDIRECTS + 1) as u64)
            .mount(&server)
            .await;

        let ctx = context(&["*"], true);
        let resp = ctx
            .fetch(&fetch_request(&format!("{}/loop", server.uri())))
            .await
            .unwrap();
        assert_eq!(resp.status, 0);
        assert_eq!(resp.error.as_deref(), Some("too many redirects"));
    }

    #[tokio::test]
    async fn test_fetch_http_error_is_not_a_fault() {
        let server = MockServer::start().await;
        Mock::given(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let ctx = context(&["*"], true);
        let resp = ctx
            .fetch(&fetch_request(&format!("{}/missing", server.uri())))
            .await
            .unwrap();
        assert_eq!(resp.status, 404);
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn test_fetch_private_host_denied() {
        let ctx = context(&["*"], false);
        let err = ctx.fetch(&fetch_request("http://127.0.0.1:9/")).await.unwrap_err();
        assert!(matches!(err, InvocationError::PermissionDenied(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fetch_blocking_records_network_failure() {
        // Port 9 (discard) is closed on test hosts; connection is refused.
        let mut ctx = context(&["*"], true);
        let resp = tokio::task::spawn_blocking(move || {
            let resp = ctx.fetch_blocking(fetch_request("http://127.0.0.1:9/"));
            (resp, ctx.last_network_error().map(str::to_string))
        })
        .await
        .unwrap();

        let (resp, recorded) = resp;
        let resp = resp.unwrap();
        assert_eq!(resp.status, 0);
        assert!(resp.error.is_some());
        assert!(recorded.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fetch_blocking_honours_cancellation() {
        let mut ctx = context(&["*"], true);
        ctx.cancel.cancel();
        let (result, fault) = tokio::task::spawn_blocking(move || {
            let result = ctx.fetch_blocking(fetch_request("https://example.com/"));
            (result, ctx.fault().cloned())
        })
        .await
        .unwrap();

        assert_eq!(result.unwrap_err(), InvocationError::Cancelled);
        assert_eq!(fault, Some(InvocationError::Cancelled));
    }

    // ── Helpers ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_hash_algorithms() {
        let ctx = context(&[], false);
        let sha = ctx
            .hash(&HashRequest { algorithm: "sha256".into(), data: "abc".into() })
            .unwrap();
        assert_eq!(
            sha,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let md5 = ctx
            .hash(&HashRequest { algorithm: "MD5".into(), data: "abc".into() })
            .unwrap();
        assert_eq!(md5, "900150983cd24fb0d6963f7d28e17f72");
        assert!(ctx
            .hash(&HashRequest { algorithm: "crc32".into(), data: "abc".into() })
            .is_err());
    }

    #[tokio::test]
    async fn test_base64_helpers() {
        let ctx = context(&[], false);
        assert_eq!(ctx.base64_encode("hello"), "aGVsbG8=");
        assert_eq!(ctx.base64_decode("aGVsbG8=").unwrap(), "hello");
        assert!(ctx.base64_decode("***").is_err());
    }

    #[tokio::test]
    async fn test_aes_gcm_decrypt_roundtrip() {
        use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit, Nonce};

        let key = [7u8; 32];
        let nonce_bytes = [1u8; 12];
        let cipher = Aes256Gcm::new_from_slice(&key).unwrap();
        #[allow(deprecated)]
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), b"https://hidden.example.com/v.m3u8".as_ref())
            .unwrap();
        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&ciphertext);

        let engine = base64::engine::general_purpose::STANDARD;
        let ctx = context(&[], false);
        let plain = ctx
            .aes_gcm_decrypt(&DecryptRequest {
                key: engine.encode(key),
                data: engine.encode(&combined),
            })
            .unwrap();
        assert_eq!(plain, "https://hidden.example.com/v.m3u8");
    }

    #[tokio::test]
    async fn test_aes_gcm_rejects_bad_key_length() {
        let engine = base64::engine::general_purpose::STANDARD;
        let ctx = context(&[], false);
        let err = ctx
            .aes_gcm_decrypt(&DecryptRequest {
                key: engine.encode([0u8; 5]),
                data: engine.encode([0u8; 40]),
            })
            .unwrap_err();
        assert!(err.to_string().contains("16 or 32 bytes"));
    }

    #[test]
    fn test_fetch_request_defaults() {
        let req: FetchRequest = serde_json::from_str(r#"{"url": "https://a.example.com"}"#).unwrap();
        assert_eq!(req.method, "GET");
        assert!(req.headers.is_empty());
        assert!(req.body.is_none());
    }
}
