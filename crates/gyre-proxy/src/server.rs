//! Axum HTTP front end for the proxy.
//!
//! Accepts any method on any path, emits CORS headers on every response,
//! answers `OPTIONS` preflights directly, rewrites Gemini generate bodies
//! when configured, and forwards everything else through the retry
//! transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use regex::Regex;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use gyre_pool::KeyPool;

use crate::config::{ConfigError, ProxyConfig, GEMINI_MODEL_PATH_PATTERN};
use crate::error::{ProxyError, Result};
use crate::postprocess;
use crate::rewrite::SearchToolRewriter;
use crate::transport::{RetryTransport, BODY_READ_LIMIT};

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, OPTIONS, PATCH";
const ALLOW_HEADERS: &str = "Content-Type, Authorization, X-Requested-With";

/// Shared state for the proxy server.
struct ProxyState {
    transport: RetryTransport,
    pool: Arc<KeyPool>,
    /// Present only when the search-tool rewrite is enabled.
    rewriter: Option<SearchToolRewriter>,
    rewrite_paths: Regex,
    request_logging: bool,
}

/// The key-rotating proxy server.
pub struct ProxyServer {
    state: Arc<ProxyState>,
    listen: SocketAddr,
}

impl ProxyServer {
    /// Build the server from a shared key pool and configuration.
    pub fn new(pool: Arc<KeyPool>, config: ProxyConfig) -> std::result::Result<Self, ConfigError> {
        crate::config::validate_target(&config.target)?;
        let transport = RetryTransport::new(Arc::clone(&pool), &config)?;
        let rewriter = config
            .add_google_search
            .then(|| SearchToolRewriter::new(&config.search_trigger))
            .transpose()?;
        let rewrite_paths = Regex::new(GEMINI_MODEL_PATH_PATTERN)?;

        Ok(Self {
            state: Arc::new(ProxyState {
                transport,
                pool,
                rewriter,
                rewrite_paths,
                request_logging: config.request_logging,
            }),
            listen: config.listen,
        })
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .layer(middleware::from_fn(cors_middleware))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                request_logging_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Run the proxy server.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            target = %self.state.transport.target(),
            "proxy listening"
        );
        axum::serve(listener, self.router()).await
    }

    /// Run with graceful shutdown, returning the bound address.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(
            addr = %local_addr,
            target = %self.state.transport.target(),
            "proxy listening"
        );
        let router = self.router();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
                .ok();
        });
        Ok(local_addr)
    }
}

/// Catch-all handler: optional body rewrite, then the retry transport, then
/// the response post-processor.
async fn proxy_handler(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let req = match rewrite_request(&state, req).await {
        Ok(req) => req,
        Err(err) => return err.into_response(),
    };

    match state.transport.send(req).await {
        Ok(upstream) => postprocess::forward_response(upstream, &state.pool).await,
        Err(err) => err.into_response(),
    }
}

/// Apply the search-tool rewrite to POST bodies on the Gemini generate
/// paths. All other requests pass through untouched.
async fn rewrite_request(state: &ProxyState, req: Request) -> Result<Request> {
    let Some(rewriter) = &state.rewriter else {
        return Ok(req);
    };
    if req.method() != Method::POST || !state.rewrite_paths.is_match(req.uri().path()) {
        return Ok(req);
    }

    let (mut parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| ProxyError::Canceled)?;
    if bytes.is_empty() {
        return Ok(Request::from_parts(parts, Body::empty()));
    }
    if bytes.len() > BODY_READ_LIMIT {
        tracing::warn!(
            len = bytes.len(),
            limit = BODY_READ_LIMIT,
            "oversized body on a rewrite path"
        );
    }

    match rewriter.rewrite(&bytes) {
        Ok(Some(rewritten)) => {
            tracing::debug!(
                path = %parts.uri.path(),
                from = bytes.len(),
                to = rewritten.len(),
                "rewrote request body with search tool"
            );
            parts
                .headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));
            Ok(Request::from_parts(parts, Body::from(rewritten)))
        }
        Ok(None) => Ok(Request::from_parts(parts, Body::from(bytes))),
        Err(err) => Err(ProxyError::BadBody(err.to_string())),
    }
}

/// Emit the CORS headers on every response and answer preflights directly.
/// Preflights never reach the transport and never consume a key.
async fn cors_middleware(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        apply_cors_headers(response.headers_mut());
        return response;
    }
    let mut response = next.run(req).await;
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
}

/// Per-request completion log, severity-tiered by status.
async fn request_logging_middleware(
    State(state): State<Arc<ProxyState>>,
    req: Request,
    next: Next,
) -> Response {
    if !state.request_logging {
        return next.run(req).await;
    }

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let status = response.status();
    let duration = start.elapsed();
    if status.is_server_error() {
        tracing::error!(
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "request completed with server error"
        );
    } else if status.is_client_error() {
        tracing::warn!(
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "request completed with client error"
        );
    } else {
        tracing::info!(
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "request completed"
        );
    }

    response
}
