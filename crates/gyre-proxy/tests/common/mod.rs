//! Shared helpers for proxy integration tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

use gyre_pool::{scope_key, KeyPool};
use gyre_proxy::{ProxyConfig, ProxyServer};

/// One request as the upstream saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub body: Bytes,
}

impl RecordedRequest {
    /// Value of a query parameter, if present.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }
}

struct UpstreamState {
    /// Scripted `(status, body)` responses, served in order; the last entry
    /// repeats once the script runs out.
    script: Vec<(StatusCode, &'static str)>,
    hits: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// A scripted upstream server bound to a random local port.
pub struct Upstream {
    pub addr: SocketAddr,
    state: Arc<UpstreamState>,
    _handle: JoinHandle<()>,
}

impl Upstream {
    pub async fn start(script: Vec<(StatusCode, &'static str)>) -> Self {
        let state = Arc::new(UpstreamState {
            script,
            hits: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .fallback(record_and_reply)
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            _handle: handle,
        }
    }

    pub fn base_url(&self) -> Url {
        Url::parse(&format!("http://{}", self.addr)).unwrap()
    }

    /// Number of requests that reached the upstream.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// The scope string the proxy tracks for a path on this upstream.
    pub fn scope(&self, path: &str) -> String {
        scope_key(&self.addr.to_string(), path)
    }
}

async fn record_and_reply(State(state): State<Arc<UpstreamState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();

    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    state.requests.lock().unwrap().push(RecordedRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_owned),
        authorization: parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
        body,
    });

    let (status, body) = state
        .script
        .get(hit)
        .or_else(|| state.script.last())
        .copied()
        .unwrap_or((StatusCode::OK, ""));
    (status, body.to_string()).into_response()
}

/// A proxy router wired to the given upstream, plus its pool for
/// state assertions.
pub fn proxy_for(upstream: &Upstream, keys: &[&str], removal: Duration) -> (Router, Arc<KeyPool>) {
    let config = ProxyConfig::new(upstream.base_url())
        .unwrap()
        .with_request_logging(false);
    proxy_with_config(keys, removal, config)
}

pub fn proxy_with_config(
    keys: &[&str],
    removal: Duration,
    config: ProxyConfig,
) -> (Router, Arc<KeyPool>) {
    let pool = Arc::new(
        KeyPool::new(keys.iter().map(|k| k.to_string()).collect(), removal).unwrap(),
    );
    let server = ProxyServer::new(Arc::clone(&pool), config).unwrap();
    (server.router(), pool)
}
