//! Terminal error kinds and their HTTP rendering.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use gyre_pool::PoolError;

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors surfaced to the client after the transport has decided no further
/// retry is possible.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// No key could be acquired for the request's scope.
    #[error("scope '{scope}': failed to acquire an API key: {source}")]
    CredentialUnavailable {
        scope: String,
        #[source]
        source: PoolError,
    },

    /// Retries were exhausted while the last attempt still produced an
    /// upstream response; its status is preserved for the client.
    #[error("upstream server returned status {status} after {attempts} attempts (scope '{scope}')")]
    UpstreamExhausted {
        status: StatusCode,
        scope: String,
        attempts: u32,
    },

    /// The client went away before the request completed.
    #[error("client connection closed")]
    Canceled,

    /// A transport failure the retry loop could not absorb.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The request body could not be rewritten.
    #[error("failed to rewrite request body: {0}")]
    BadBody(String),
}

impl ProxyError {
    /// The HTTP status this error renders as.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::CredentialUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamExhausted { status, .. } => *status,
            Self::Canceled => StatusCode::REQUEST_TIMEOUT,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::BadBody(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Canceled => "Client connection closed".to_string(),
            Self::Transport(_) => "Proxy Error: Upstream server failed after retries".to_string(),
            other => other.to_string(),
        };
        tracing::error!(status = %status, error = %self, "terminal proxy error");
        (status, body).into_response()
    }
}
