//! HTTP endpoints reached by the second device.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, DefaultBodyLimit, FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tributary_plugin::canonicalize_url;
use uuid::Uuid;

use super::server::{RepositorySummary, Shared};
use super::state::ChangeState;

type ApiError = (StatusCode, Json<serde_json::Value>);

/// Request bodies are small lists of URLs.
const MAX_BODY_BYTES: usize = 64 * 1024;

pub(crate) fn router(shared: Arc<Shared>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/repositories", get(list_repositories))
        .route("/propose", post(propose))
        .route("/status/{change_id}", get(status))
        .route("/logo", get(logo))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(shared)
}

// ─── Proposer ───────────────────────────────────────────────────────────

/// Remote IP of the caller, or `"unknown"` without connection info.
#[derive(Debug, Clone)]
pub(crate) struct Proposer(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Proposer {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        Ok(Proposer(ip.unwrap_or_else(|| "unknown".to_string())))
    }
}

// ─── Request / Response types ───────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RepositoriesResponse {
    pub repositories: Vec<RepositorySummary>,
}

#[derive(Debug, Deserialize)]
pub struct ProposeRequest {
    pub urls: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeResponse {
    pub change_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct UrlFailure {
    pub url: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub change_id: Uuid,
    pub state: ChangeState,
    pub expires_at: DateTime<Utc>,
}

// ─── Handlers ───────────────────────────────────────────────────────────

/// GET / : pairing page for the second device.
async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

/// GET /repositories : what is installed right now.
async fn list_repositories(State(shared): State<Arc<Shared>>) -> Json<RepositoriesResponse> {
    Json(RepositoriesResponse {
        repositories: (shared.hooks.repositories)(),
    })
}

/// POST /propose : submit a replacement repository list.
async fn propose(
    State(shared): State<Arc<Shared>>,
    proposer: Proposer,
    Json(body): Json<ProposeRequest>,
) -> Result<(StatusCode, Json<ProposeResponse>), ApiError> {
    if body.urls.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "urls must not be empty" })),
        ));
    }
    if body.urls.len() > shared.config.max_proposed_urls {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("at most {} urls per proposal", shared.config.max_proposed_urls)
            })),
        ));
    }

    let (urls, failures) = validate_urls(&shared, &body.urls).await;
    if !failures.is_empty() {
        tracing::info!(
            proposer = %proposer.0,
            failed = failures.len(),
            "proposal rejected: repositories failed validation"
        );
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "error": "some repositories could not be validated",
                "failures": failures,
            })),
        ));
    }

    let current: Vec<String> = (shared.hooks.repositories)()
        .into_iter()
        .map(|r| r.url)
        .collect();

    let mut state = shared.state.lock().await;
    let proposal = state.propose(urls, &proposer.0, &current, Utc::now());
    let change = proposal.change;

    if proposal.refreshed {
        tracing::debug!(change = %change.change_id, "identical proposal refreshed");
    } else {
        if let Some(old) = proposal.superseded {
            tracing::info!(change = %old, "pending change superseded");
        }
        tracing::info!(
            change = %change.change_id,
            proposer = %proposer.0,
            added = change.diff.added.len(),
            removed = change.diff.removed.len(),
            "repository change proposed"
        );
        (shared.hooks.on_change_proposed)(&change);
    }

    Ok((
        StatusCode::CREATED,
        Json(ProposeResponse {
            change_id: change.change_id,
        }),
    ))
}

/// Canonicalize, dedupe and fetch every URL as a manifest, concurrently.
///
/// Returns the canonical URLs in input order, or every failure.
async fn validate_urls(shared: &Arc<Shared>, raw: &[String]) -> (Vec<String>, Vec<UrlFailure>) {
    let mut failures = Vec::new();
    let mut urls: Vec<String> = Vec::with_capacity(raw.len());
    for url in raw {
        match canonicalize_url(url) {
            Ok(canonical) => {
                let key = tributary_plugin::canonical_key(&canonical);
                if !urls.iter().any(|u| tributary_plugin::canonical_key(u) == key) {
                    urls.push(canonical);
                }
            }
            Err(e) => failures.push(UrlFailure {
                url: url.clone(),
                error: e.to_string(),
            }),
        }
    }

    let mut checks = JoinSet::new();
    for (index, url) in urls.iter().enumerate() {
        let fetcher = shared.hooks.fetcher.clone();
        let url = url.clone();
        checks.spawn(async move {
            let result = fetcher.fetch_manifest(&url).await;
            (index, url, result)
        });
    }

    let mut fetch_failures = Vec::new();
    while let Some(joined) = checks.join_next().await {
        match joined {
            Ok((_, _, Ok(_))) => {}
            Ok((index, url, Err(e))) => fetch_failures.push((
                index,
                UrlFailure {
                    url,
                    error: e.to_string(),
                },
            )),
            Err(e) => {
                tracing::warn!("manifest validation task failed: {e}");
                fetch_failures.push((
                    usize::MAX,
                    UrlFailure {
                        url: String::new(),
                        error: "validation task failed".to_string(),
                    },
                ));
            }
        }
    }
    fetch_failures.sort_by_key(|(index, _)| *index);
    failures.extend(fetch_failures.into_iter().map(|(_, f)| f));

    (urls, failures)
}

/// GET /status/{change_id}
async fn status(
    State(shared): State<Arc<Shared>>,
    Path(change_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let not_found = || {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "unknown change id" })),
        )
    };
    let id = Uuid::parse_str(&change_id).map_err(|_| not_found())?;
    let change = shared
        .state
        .lock()
        .await
        .get(id, Utc::now())
        .ok_or_else(not_found)?;

    Ok(Json(StatusResponse {
        change_id: change.change_id,
        state: change.state,
        expires_at: change.expires_at,
    }))
}

/// GET /logo
async fn logo(State(shared): State<Arc<Shared>>) -> Response {
    match (shared.hooks.logo)() {
        Some(logo) => {
            let content_type = HeaderValue::from_str(&logo.content_type)
                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
            ([(header::CONTENT_TYPE, content_type)], logo.bytes).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Tributary pairing</title>
<style>
body { font-family: system-ui, sans-serif; max-width: 40rem; margin: 2rem auto; padding: 0 1rem; }
textarea { width: 100%; min-height: 10rem; font-family: monospace; }
#status { margin-top: 1rem; font-weight: bold; }
</style>
</head>
<body>
<img src="/logo" alt="" height="48" onerror="this.remove()">
<h1>Repositories</h1>
<p>One repository URL per line. The other device must confirm the change.</p>
<textarea id="urls"></textarea>
<button id="send">Send</button>
<div id="status"></div>
<script>
const statusEl = document.getElementById('status');
fetch('/repositories').then(r => r.json()).then(d => {
  document.getElementById('urls').value = d.repositories.map(r => r.url).join('\n');
});
async function poll(id) {
  const r = await fetch('/status/' + id);
  if (!r.ok) { statusEl.textContent = 'Unknown change'; return; }
  const d = await r.json();
  statusEl.textContent = d.state;
  if (d.state === 'Proposed') setTimeout(() => poll(id), 2000);
}
document.getElementById('send').onclick = async () => {
  const urls = document.getElementById('urls').value.split('\n').map(s => s.trim()).filter(Boolean);
  const r = await fetch('/propose', {
    method: 'POST',
    headers: { 'content-type': 'application/json' },
    body: JSON.stringify({ urls }),
  });
  const d = await r.json();
  if (r.status === 201) { statusEl.textContent = 'Waiting for confirmation'; poll(d.changeId); }
  else if (d.failures) { statusEl.textContent = d.failures.map(f => f.url + ': ' + f.error).join('\n'); }
  else { statusEl.textContent = d.error; }
};
</script>
</body>
</html>
"#;

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PairingConfig;
    use crate::network::FixedAddressProvider;
    use crate::pairing::server::{ChangeApplier, Logo, PairingHooks};
    use crate::pairing::state::{ChangeDiff, PendingChange};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tower::ServiceExt;
    use tributary_plugin::{ApplyReport, ManifestFetcher, PluginError, RepositoryManifest};

    // ── Fixtures ────────────────────────────────────────────────────

    struct SetFetcher {
        reachable: HashSet<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ManifestFetcher for SetFetcher {
        async fn fetch_manifest(&self, url: &str) -> Result<RepositoryManifest, PluginError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reachable.contains(url) {
                RepositoryManifest::parse_and_validate(
                    br#"{"name":"Demo","scrapers":[{"id":"a","script":"AGFzbQEAAAA="}]}"#,
                )
            } else {
                Err(PluginError::Unreachable(format!("{url}: connection refused")))
            }
        }

        async fn fetch_script(&self, url: &str) -> Result<Vec<u8>, PluginError> {
            Err(PluginError::Unreachable(url.to_string()))
        }
    }

    struct NoopApplier;

    #[async_trait]
    impl ChangeApplier for NoopApplier {
        async fn apply(&self, _diff: &ChangeDiff) -> ApplyReport {
            ApplyReport::default()
        }
    }

    struct Fixture {
        shared: Arc<Shared>,
        fetcher: Arc<SetFetcher>,
        proposed: Arc<StdMutex<Vec<PendingChange>>>,
    }

    fn fixture(reachable: &[&str], installed: &[&str]) -> Fixture {
        let fetcher = Arc::new(SetFetcher {
            reachable: reachable.iter().map(|u| u.to_string()).collect(),
            calls: AtomicUsize::new(0),
        });
        let installed: Vec<RepositorySummary> = installed
            .iter()
            .map(|u| RepositorySummary {
                url: u.to_string(),
                name: "Installed".into(),
                description: None,
            })
            .collect();
        let proposed = Arc::new(StdMutex::new(Vec::new()));
        let sink = proposed.clone();
        let hooks = PairingHooks {
            repositories: Arc::new(move || installed.clone()),
            on_change_proposed: Arc::new(move |c: &PendingChange| sink.lock().unwrap().push(c.clone())),
            fetcher: fetcher.clone(),
            logo: Arc::new(|| None),
            applier: Arc::new(NoopApplier),
            address: Arc::new(FixedAddressProvider(None)),
        };
        Fixture {
            shared: Shared::new(
                hooks,
                PairingConfig {
                    max_proposed_urls: 3,
                    ..Default::default()
                },
            ),
            fetcher,
            proposed,
        }
    }

    fn propose_request(urls: &[&str], from: [u8; 4]) -> Request<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri("/propose")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({ "urls": urls }).to_string()))
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((from, 50000))));
        req
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const X: &str = "https://x.example.com/manifest.json";
    const Y: &str = "https://y.example.com/manifest.json";

    // ── GET ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_index_page() {
        let f = fixture(&[], &[]);
        let resp = router(f.shared)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("/propose"));
    }

    #[tokio::test]
    async fn test_list_repositories() {
        let f = fixture(&[], &[X]);
        let resp = router(f.shared)
            .oneshot(Request::builder().uri("/repositories").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        assert_eq!(json["repositories"][0]["url"], X);
        assert_eq!(json["repositories"][0]["name"], "Installed");
    }

    #[tokio::test]
    async fn test_logo_missing_and_present() {
        let f = fixture(&[], &[]);
        let resp = router(f.shared)
            .oneshot(Request::builder().uri("/logo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let f = fixture(&[], &[]);
        let hooks = f.shared.hooks.clone().with_logo(|| {
            Some(Logo {
                content_type: "image/png".into(),
                bytes: bytes::Bytes::from_static(b"\x89PNG"),
            })
        });
        let shared = Shared::new(hooks, PairingConfig::default());
        let resp = router(shared)
            .oneshot(Request::builder().uri("/logo").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
    }

    #[tokio::test]
    async fn test_status_unknown_is_404() {
        let f = fixture(&[], &[]);
        for id in [Uuid::new_v4().to_string(), "not-a-uuid".to_string()] {
            let resp = router(f.shared.clone())
                .oneshot(
                    Request::builder()
                        .uri(format!("/status/{id}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        }
    }

    // ── POST /propose ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_propose_empty_or_oversized_is_400() {
        let f = fixture(&[X], &[]);
        let resp = router(f.shared.clone())
            .oneshot(propose_request(&[], [10, 0, 0, 2]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = router(f.shared.clone())
            .oneshot(propose_request(
                &["https://a.example.com/", "https://b.example.com/", "https://c.example.com/", "https://d.example.com/"],
                [10, 0, 0, 2],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_propose_with_unreachable_url_is_422() {
        let f = fixture(&[X], &[]);
        let resp = router(f.shared.clone())
            .oneshot(propose_request(&[X, Y, "ftp://bad"], [10, 0, 0, 2]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let json = json_body(resp).await;
        let failed: Vec<&str> = json["failures"]
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["url"].as_str().unwrap())
            .collect();
        assert_eq!(failed, vec!["ftp://bad", Y]);
        assert!(f.proposed.lock().unwrap().is_empty());
        assert!(f.shared.state.lock().await.live(Utc::now()).is_none());
    }

    #[tokio::test]
    async fn test_propose_creates_change_and_notifies() {
        let f = fixture(&[X, Y], &[X]);
        let resp = router(f.shared.clone())
            .oneshot(propose_request(&[X, Y], [10, 0, 0, 2]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = json_body(resp).await;
        let id: Uuid = json["changeId"].as_str().unwrap().parse().unwrap();

        let proposed = f.proposed.lock().unwrap().clone();
        assert_eq!(proposed.len(), 1);
        assert_eq!(proposed[0].change_id, id);
        assert_eq!(proposed[0].proposer, "10.0.0.2");
        assert_eq!(proposed[0].diff.added, vec![Y.to_string()]);
        assert!(proposed[0].diff.removed.is_empty());

        let resp = router(f.shared.clone())
            .oneshot(
                Request::builder()
                    .uri(format!("/status/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = json_body(resp).await;
        assert_eq!(json["state"], "Proposed");
    }

    #[tokio::test]
    async fn test_resubmission_returns_same_change_without_callback() {
        let f = fixture(&[X, Y], &[]);
        let first = json_body(
            router(f.shared.clone())
                .oneshot(propose_request(&[X, Y], [10, 0, 0, 2]))
                .await
                .unwrap(),
        )
        .await;
        let again = json_body(
            router(f.shared.clone())
                .oneshot(propose_request(&[Y, X], [10, 0, 0, 2]))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(first["changeId"], again["changeId"]);
        assert_eq!(f.proposed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_urls_in_one_proposal_collapse() {
        let f = fixture(&[X], &[]);
        let resp = router(f.shared.clone())
            .oneshot(propose_request(
                &[X, "https://X.example.com/manifest.json/"],
                [10, 0, 0, 2],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(f.fetcher.calls.load(Ordering::SeqCst), 1);
        let live = f.shared.state.lock().await.live(Utc::now()).unwrap();
        assert_eq!(live.proposed_repository_urls.len(), 1);
    }
}
