//! Outbound request direction: target scheme/host plus the inbound path.

use axum::http::Uri;
use url::Url;

use gyre_pool::scope_key;

/// Builds outbound URLs and scope strings for inbound requests.
///
/// Only the target's scheme, host, and port are kept; path and query always
/// come from the inbound request.
#[derive(Debug, Clone)]
pub struct Director {
    target: Url,
}

impl Director {
    /// Create a director for a validated target URL.
    pub fn new(target: Url) -> Self {
        Self { target }
    }

    /// The configured upstream base URL.
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Build the outbound URL for an inbound request URI.
    pub fn direct(&self, uri: &Uri) -> Url {
        let mut url = self.target.clone();
        url.set_path(uri.path());
        url.set_query(uri.query());
        url
    }

    /// The availability scope for an inbound request URI. Host and path are
    /// taken from the directed URL, which does not change across retries.
    pub fn scope(&self, uri: &Uri) -> String {
        scope_key(&self.scope_host(), uri.path())
    }

    fn scope_host(&self) -> String {
        let host = self.target.host_str().unwrap_or_default();
        match self.target.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }
}
