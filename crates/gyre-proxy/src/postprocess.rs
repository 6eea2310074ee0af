//! Response post-processing: error-body logging and key sidelining.
//!
//! Runs on every response the transport decided is terminal. Successful
//! responses stream straight through; anything else is buffered so its body
//! can be logged (size-capped) and still delivered to the client, and
//! non-retryable client errors sideline the key that produced them.

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use bytes::Bytes;

use gyre_pool::KeyPool;

use crate::transport::{response_headers, UpstreamResponse};

/// Cap on logged response bodies.
pub(crate) const LOG_BODY_LIMIT: usize = 512;

/// Turn a terminal upstream response into the client response, updating pool
/// state along the way.
pub async fn forward_response(upstream: UpstreamResponse, pool: &KeyPool) -> Response {
    let UpstreamResponse {
        response,
        lease,
        scope,
    } = upstream;
    let status = response.status();
    let headers = response_headers(response.headers());

    if status.is_success() {
        let mut out = Response::new(Body::from_stream(response.bytes_stream()));
        *out.status_mut() = status;
        *out.headers_mut() = headers;
        return out;
    }

    // Non-2xx: read the body so it can be logged, then hand the same bytes
    // to the client.
    let body = match response.bytes().await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(
                scope = %scope,
                status = %status,
                error = %err,
                "failed to read upstream error body"
            );
            Bytes::new()
        }
    };
    tracing::warn!(
        scope = %scope,
        index = lease.index,
        status = %status,
        body = %preview(&body),
        "upstream returned non-2xx status"
    );

    // 429 is excluded: the transport already sidelined the key for it.
    // Other 4xx mean this key will not succeed for this scope.
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        tracing::info!(
            scope = %scope,
            index = lease.index,
            status = %status,
            "sidelining key after non-retryable client error"
        );
        pool.mark_failed(&scope, lease.index);
    }

    let mut out = Response::new(Body::from(body));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

/// Size-capped, lossy-UTF-8 rendering of a response body for logs.
fn preview(body: &[u8]) -> String {
    if body.len() <= LOG_BODY_LIMIT {
        String::from_utf8_lossy(body).into_owned()
    } else {
        format!(
            "{}... (truncated {} bytes)",
            String::from_utf8_lossy(&body[..LOG_BODY_LIMIT]),
            body.len() - LOG_BODY_LIMIT
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_short_body_untouched() {
        assert_eq!(preview(b"error detail"), "error detail");
    }

    #[test]
    fn test_preview_exact_limit_untouched() {
        let body = vec![b'a'; LOG_BODY_LIMIT];
        assert_eq!(preview(&body).len(), LOG_BODY_LIMIT);
    }

    #[test]
    fn test_preview_caps_long_body() {
        let body = vec![b'a'; LOG_BODY_LIMIT + 100];
        let rendered = preview(&body);
        assert!(rendered.starts_with(&"a".repeat(LOG_BODY_LIMIT)));
        assert!(rendered.ends_with("(truncated 100 bytes)"));
    }

    #[test]
    fn test_preview_handles_invalid_utf8() {
        let rendered = preview(&[0xff, 0xfe, b'o', b'k']);
        assert!(rendered.contains("ok"));
    }
}
