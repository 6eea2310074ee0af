//! Retry-aware upstream transport.
//!
//! Each inbound request is attempted up to [`MAX_RETRIES`] times against the
//! upstream, with a fresh API key chosen per attempt from the pool. Rate
//! limits sideline the key that hit them; server faults retry without
//! sidelining; everything else is terminal and returned to the caller along
//! with the key lease used, so the post-processor can correlate.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use url::Url;

use gyre_pool::{KeyLease, KeyPool};

use crate::config::{ConfigError, ProxyConfig};
use crate::director::Director;
use crate::error::{ProxyError, Result};

/// Attempts per inbound request.
pub const MAX_RETRIES: u32 = 3;

/// Cap on buffered request bodies (10 MiB). Larger bodies are truncated with
/// a warning rather than rejected.
pub const BODY_READ_LIMIT: usize = 10 * 1024 * 1024;

/// A terminal upstream response together with the key lease that produced it
/// and the scope it was issued under.
pub struct UpstreamResponse {
    pub response: reqwest::Response,
    pub lease: KeyLease,
    pub scope: String,
}

/// Outcome of the most recent attempt, kept for terminal error synthesis.
enum LastOutcome {
    Status(StatusCode),
    TransportError(reqwest::Error),
}

/// Request body as seen by the retry loop.
enum InboundBody {
    /// Buffered in memory; resent on every attempt.
    Buffered(Bytes),
    /// Streamed through once; a retry after consumption sends no body.
    Stream(Option<Body>),
    Empty,
}

impl InboundBody {
    fn for_attempt(&mut self) -> Option<reqwest::Body> {
        match self {
            Self::Buffered(bytes) => Some(reqwest::Body::from(bytes.clone())),
            Self::Stream(stream) => match stream.take() {
                Some(body) => Some(reqwest::Body::wrap_stream(body.into_data_stream())),
                None => {
                    tracing::warn!("streamed request body already consumed; retrying without it");
                    None
                }
            },
            Self::Empty => None,
        }
    }
}

/// The credential-rotating retry transport.
pub struct RetryTransport {
    client: reqwest::Client,
    pool: Arc<KeyPool>,
    director: Director,
    key_param: String,
    header_auth_paths: Vec<String>,
}

impl RetryTransport {
    /// Build a transport over a fresh HTTP client. Redirects are passed
    /// through to the client rather than followed.
    pub fn new(pool: Arc<KeyPool>, config: &ProxyConfig) -> std::result::Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            pool,
            director: Director::new(config.target.clone()),
            key_param: config.key_param.clone(),
            header_auth_paths: config.header_auth_paths.clone(),
        })
    }

    /// The configured upstream base URL.
    pub fn target(&self) -> &Url {
        self.director.target()
    }

    /// Forward a request upstream, rotating keys across retries.
    ///
    /// Returns the first non-retryable upstream response, or a terminal
    /// error. When retries run out while the last attempt still produced a
    /// response, the error preserves that response's status.
    pub async fn send(&self, req: axum::extract::Request) -> Result<UpstreamResponse> {
        let (parts, body) = req.into_parts();
        let scope = self.director.scope(&parts.uri);
        let base_url = self.director.direct(&parts.uri);
        let use_header_auth = self
            .header_auth_paths
            .iter()
            .any(|p| parts.uri.path().contains(p.as_str()));
        let base_headers = outbound_headers(&parts.headers);
        let mut body = buffer_inbound(&parts.method, &parts.headers, body).await?;

        let mut last_outcome: Option<LastOutcome> = None;
        for attempt in 1..=MAX_RETRIES {
            let lease = match self.pool.acquire(&scope) {
                Ok(lease) => lease,
                Err(source) => {
                    // With an upstream status already in hand, an empty pool
                    // must not mask it; burn the attempt and keep going.
                    if matches!(last_outcome, Some(LastOutcome::Status(_))) {
                        tracing::warn!(
                            scope = %scope,
                            attempt,
                            error = %source,
                            "no key available; keeping last upstream status"
                        );
                        continue;
                    }
                    tracing::warn!(scope = %scope, attempt, error = %source, "failed to acquire key");
                    return Err(ProxyError::CredentialUnavailable { scope, source });
                }
            };

            let mut url = base_url.clone();
            let mut headers = base_headers.clone();
            if use_header_auth {
                tracing::debug!(
                    scope = %scope,
                    attempt,
                    index = lease.index,
                    "authenticating via Authorization header"
                );
                let value = HeaderValue::try_from(format!("Bearer {}", lease.key))
                    .map_err(|_| ProxyError::Transport("API key is not a valid header value".into()))?;
                headers.insert(header::AUTHORIZATION, value);
                remove_query_param(&mut url, &self.key_param);
            } else {
                tracing::debug!(
                    scope = %scope,
                    attempt,
                    index = lease.index,
                    param = %self.key_param,
                    "authenticating via query parameter"
                );
                headers.remove(header::AUTHORIZATION);
                set_query_param(&mut url, &self.key_param, &lease.key);
            }

            let mut outbound = self.client.request(parts.method.clone(), url).headers(headers);
            if let Some(attempt_body) = body.for_attempt() {
                outbound = outbound.body(attempt_body);
            }

            match outbound.send().await {
                Err(err) if is_transient(&err) => {
                    tracing::warn!(
                        scope = %scope,
                        attempt,
                        index = lease.index,
                        error = %err,
                        "transient transport error; retrying"
                    );
                    last_outcome = Some(LastOutcome::TransportError(err));
                }
                Err(err) => {
                    tracing::error!(
                        scope = %scope,
                        attempt,
                        index = lease.index,
                        error = %err,
                        "transport error"
                    );
                    return Err(ProxyError::Transport(err.to_string()));
                }
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        tracing::warn!(
                            scope = %scope,
                            attempt,
                            index = lease.index,
                            "upstream rate limited this key; sidelining and retrying"
                        );
                        self.pool.mark_failed(&scope, lease.index);
                        drain(response).await;
                        last_outcome = Some(LastOutcome::Status(status));
                    } else if is_retryable_server_error(status) {
                        tracing::warn!(
                            scope = %scope,
                            attempt,
                            index = lease.index,
                            status = %status,
                            "upstream server error; retrying"
                        );
                        drain(response).await;
                        last_outcome = Some(LastOutcome::Status(status));
                    } else {
                        return Ok(UpstreamResponse {
                            response,
                            lease,
                            scope,
                        });
                    }
                }
            }
        }

        tracing::warn!(scope = %scope, max_retries = MAX_RETRIES, "retries exhausted");
        match last_outcome {
            Some(LastOutcome::Status(status)) => Err(ProxyError::UpstreamExhausted {
                status,
                scope,
                attempts: MAX_RETRIES,
            }),
            Some(LastOutcome::TransportError(err)) => Err(ProxyError::Transport(err.to_string())),
            None => Err(ProxyError::Transport(
                "retry loop exited without an outcome".into(),
            )),
        }
    }
}

/// Buffer the inbound body when a retry may need to resend it.
///
/// Idempotent methods stream through untouched; non-idempotent methods with
/// a body are read into memory up to [`BODY_READ_LIMIT`]. An over-limit body
/// is truncated with a warning and forwarded anyway.
async fn buffer_inbound(method: &Method, headers: &HeaderMap, body: Body) -> Result<InboundBody> {
    if !has_body(headers) {
        return Ok(InboundBody::Empty);
    }
    if is_idempotent(method) {
        return Ok(InboundBody::Stream(Some(body)));
    }

    let mut buf = BytesMut::new();
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|_| ProxyError::Canceled)?;
        if buf.len() + chunk.len() > BODY_READ_LIMIT {
            let room = BODY_READ_LIMIT - buf.len();
            buf.extend_from_slice(&chunk[..room]);
            tracing::warn!(
                limit = BODY_READ_LIMIT,
                "request body exceeded the buffer limit; forwarding truncated"
            );
            break;
        }
        buf.extend_from_slice(&chunk);
    }

    if buf.is_empty() {
        Ok(InboundBody::Empty)
    } else {
        Ok(InboundBody::Buffered(buf.freeze()))
    }
}

/// Methods whose bodies are not buffered for retries.
fn is_idempotent(method: &Method) -> bool {
    method == Method::GET
        || method == Method::HEAD
        || method == Method::OPTIONS
        || method == Method::TRACE
        || method == Method::PUT
        || method == Method::DELETE
}

/// Whether the inbound request declares a body.
fn has_body(headers: &HeaderMap) -> bool {
    if let Some(len) = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        return len > 0;
    }
    headers.contains_key(header::TRANSFER_ENCODING)
}

/// Timeouts, connect failures, and unexpected EOFs are worth another attempt
/// with a different key; anything else is returned as-is.
fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::UnexpectedEof {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

/// 5xx responses are retried except those that will not change on retry.
fn is_retryable_server_error(status: StatusCode) -> bool {
    status.is_server_error()
        && status != StatusCode::NOT_IMPLEMENTED
        && status != StatusCode::HTTP_VERSION_NOT_SUPPORTED
}

/// Consume a response body so the connection can return to the pool.
async fn drain(response: reqwest::Response) {
    let _ = response.bytes().await;
}

/// Headers copied from the inbound request onto each attempt. Hop-by-hop
/// headers stay behind, `Host` follows the target URL, and `Content-Length`
/// is recomputed from the attempt body.
fn outbound_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers
}

/// Upstream response headers passed back to the client.
pub(crate) fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    strip_hop_by_hop(&mut headers);
    headers
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    headers.remove(header::CONNECTION);
    headers.remove(header::PROXY_AUTHENTICATE);
    headers.remove(header::PROXY_AUTHORIZATION);
    headers.remove(header::TE);
    headers.remove(header::TRAILER);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::UPGRADE);
    headers.remove(HeaderName::from_static("keep-alive"));
}

fn set_query_param(url: &mut Url, name: &str, value: &str) {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != name)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    for (k, v) in &retained {
        pairs.append_pair(k, v);
    }
    pairs.append_pair(name, value);
}

fn remove_query_param(url: &mut Url, name: &str) {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != name)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if retained.is_empty() {
        url.set_query(None);
        return;
    }
    let mut pairs = url.query_pairs_mut();
    pairs.clear();
    for (k, v) in &retained {
        pairs.append_pair(k, v);
    }
}
