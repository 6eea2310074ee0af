//! Proxy configuration.

use std::net::SocketAddr;

use url::Url;

/// Default upstream base URL.
pub const DEFAULT_TARGET: &str = "https://generativelanguage.googleapis.com";

/// Default query parameter used to inject the API key.
pub const DEFAULT_KEY_PARAM: &str = "key";

/// Default path substring that switches to Authorization-header auth.
pub const DEFAULT_HEADER_AUTH_PATH: &str = "/openai";

/// Default trigger word for forcing the search tool into a request.
pub const DEFAULT_SEARCH_TRIGGER: &str = "search";

/// Request paths whose POST bodies go through the search-tool rewriter.
pub const GEMINI_MODEL_PATH_PATTERN: &str = "^/v1beta/models/gemini-";

/// Configuration errors reported at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The target URL is unusable as an upstream base.
    #[error("target URL '{0}' must include an http(s) scheme and a host")]
    InvalidTarget(String),

    /// A configured pattern failed to compile.
    #[error("invalid path or trigger pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// The outbound HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the server binds to.
    pub listen: SocketAddr,
    /// Upstream base URL; only its scheme, host, and port are used.
    pub target: Url,
    /// Query parameter that carries the API key.
    pub key_param: String,
    /// Path substrings that switch a request to Authorization-header auth.
    pub header_auth_paths: Vec<String>,
    /// Rewrite Gemini generate requests to carry the google_search tool.
    pub add_google_search: bool,
    /// Word that forces the search tool into a request.
    pub search_trigger: String,
    /// Log a line per completed request.
    pub request_logging: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".parse().expect("default listen address"),
            target: Url::parse(DEFAULT_TARGET).expect("default target URL"),
            key_param: DEFAULT_KEY_PARAM.to_string(),
            header_auth_paths: vec![DEFAULT_HEADER_AUTH_PATH.to_string()],
            add_google_search: true,
            search_trigger: DEFAULT_SEARCH_TRIGGER.to_string(),
            request_logging: true,
        }
    }
}

impl ProxyConfig {
    /// Create a config pointing at the given upstream.
    pub fn new(target: Url) -> Result<Self, ConfigError> {
        validate_target(&target)?;
        Ok(Self {
            target,
            ..Default::default()
        })
    }

    /// Set the listen address.
    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    /// Set the API key query parameter name.
    pub fn with_key_param(mut self, key_param: impl Into<String>) -> Self {
        self.key_param = key_param.into();
        self
    }

    /// Set the path substrings that trigger header auth.
    pub fn with_header_auth_paths(mut self, paths: Vec<String>) -> Self {
        self.header_auth_paths = paths;
        self
    }

    /// Enable or disable the search-tool body rewrite.
    pub fn with_add_google_search(mut self, enabled: bool) -> Self {
        self.add_google_search = enabled;
        self
    }

    /// Set the search trigger word.
    pub fn with_search_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.search_trigger = trigger.into();
        self
    }

    /// Enable or disable request logging.
    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.request_logging = enabled;
        self
    }
}

/// Check that a URL can serve as an upstream base: http(s) scheme and a host.
pub fn validate_target(target: &Url) -> Result<(), ConfigError> {
    let scheme_ok = matches!(target.scheme(), "http" | "https");
    if !scheme_ok || target.host_str().is_none() {
        return Err(ConfigError::InvalidTarget(target.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.target.as_str(), format!("{DEFAULT_TARGET}/"));
        assert_eq!(config.key_param, "key");
        assert_eq!(config.header_auth_paths, vec!["/openai".to_string()]);
        assert!(config.add_google_search);
        assert_eq!(config.search_trigger, "search");
        assert_eq!(config.listen.port(), 8080);
    }

    #[test]
    fn test_builder_methods() {
        let config = ProxyConfig::new(Url::parse("https://example.com").unwrap())
            .unwrap()
            .with_listen("127.0.0.1:9090".parse().unwrap())
            .with_key_param("api_key")
            .with_header_auth_paths(vec!["/openai/".to_string(), "/v2/".to_string()])
            .with_add_google_search(false)
            .with_search_trigger("lookup")
            .with_request_logging(false);

        assert_eq!(config.listen.port(), 9090);
        assert_eq!(config.key_param, "api_key");
        assert_eq!(config.header_auth_paths.len(), 2);
        assert!(!config.add_google_search);
        assert_eq!(config.search_trigger, "lookup");
        assert!(!config.request_logging);
    }

    #[test]
    fn test_validate_target_rejects_schemeless_and_hostless() {
        assert!(validate_target(&Url::parse("unix:/tmp/sock").unwrap()).is_err());
        assert!(validate_target(&Url::parse("data:text/plain,hi").unwrap()).is_err());
        assert!(validate_target(&Url::parse("ftp://example.com").unwrap()).is_err());
        assert!(validate_target(&Url::parse("http://example.com:9000").unwrap()).is_ok());
    }

    #[test]
    fn test_new_rejects_bad_target() {
        let err = ProxyConfig::new(Url::parse("file:///etc/passwd").unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTarget(_)));
    }
}
