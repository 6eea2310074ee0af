//! Key-rotating reverse proxy for generative-language HTTP APIs.
//!
//! Sits between untrusted clients and an upstream API, multiplexing
//! requests across a pool of API keys. Rate-limit and authorization
//! failures are isolated per key and per `host|path` scope, transient
//! failures retry across keys, and Gemini generate requests can be
//! rewritten to carry the google_search tool.
//!
//! # Components
//!
//! - [`transport`] — retry loop: key selection, auth injection, outcome classification
//! - [`director`] — outbound URL construction from the target base
//! - [`postprocess`] — error-body logging and key sidelining on terminal responses
//! - [`rewrite`] — search-tool injection into request bodies
//! - [`server`] — axum front end: CORS, preflights, body rewrite dispatch
//! - [`config`] / [`error`] — configuration and terminal error rendering

pub mod config;
pub mod director;
pub mod error;
pub mod postprocess;
pub mod rewrite;
pub mod server;
pub mod transport;

pub use config::{ConfigError, ProxyConfig};
pub use director::Director;
pub use error::{ProxyError, Result};
pub use rewrite::SearchToolRewriter;
pub use server::ProxyServer;
pub use transport::{RetryTransport, UpstreamResponse, BODY_READ_LIMIT, MAX_RETRIES};
