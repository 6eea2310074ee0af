//! Gyre - API key rotating reverse proxy for the Gemini API.
//!
//! Main entry point: flag and environment parsing, validation, and server
//! startup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use url::Url;

use gyre_pool::KeyPool;
use gyre_proxy::{ProxyConfig, ProxyServer};

/// API key rotating reverse proxy for the Gemini API.
#[derive(Parser, Debug)]
#[command(name = "gyre")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Comma-separated list of API keys (required)
    #[arg(long, env = "GEMINI_API_KEYS")]
    keys: String,

    /// Upstream base URL; must include scheme and host
    #[arg(long, default_value = gyre_proxy::config::DEFAULT_TARGET)]
    target: Url,

    /// Address and port to listen on (":8080" binds all interfaces)
    #[arg(long, default_value = ":8080")]
    listen: String,

    /// How long a failing key stays sidelined per scope
    #[arg(long = "removal-duration", default_value = "1h", value_parser = humantime::parse_duration)]
    removal_duration: Duration,

    /// Query parameter that carries the API key
    #[arg(long = "key-param", default_value = gyre_proxy::config::DEFAULT_KEY_PARAM)]
    key_param: String,

    /// Comma-separated path substrings that switch to Authorization-header auth
    #[arg(long = "header-auth-paths", default_value = gyre_proxy::config::DEFAULT_HEADER_AUTH_PATH)]
    header_auth_paths: String,

    /// Rewrite Gemini generate requests to carry the google_search tool
    #[arg(long = "add-google-search", default_value_t = true, action = clap::ArgAction::Set)]
    add_google_search: bool,

    /// Word that forces the search tool into a request
    #[arg(long = "search-trigger", default_value = gyre_proxy::config::DEFAULT_SEARCH_TRIGGER)]
    search_trigger: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let keys = split_list(&cli.keys);
    anyhow::ensure!(
        !keys.is_empty(),
        "no non-empty API keys provided via --keys or GEMINI_API_KEYS"
    );

    let listen = normalize_listen(&cli.listen)?;

    let pool = Arc::new(
        KeyPool::new(keys, cli.removal_duration).context("failed to initialize key pool")?,
    );
    let _reactivation = Arc::clone(&pool).spawn_reactivation();

    let config = ProxyConfig::new(cli.target)
        .context("invalid --target")?
        .with_listen(listen)
        .with_key_param(cli.key_param)
        .with_header_auth_paths(split_list(&cli.header_auth_paths))
        .with_add_google_search(cli.add_google_search)
        .with_search_trigger(cli.search_trigger);

    tracing::info!(
        listen = %listen,
        target = %config.target,
        key_param = %config.key_param,
        removal_duration = %humantime::format_duration(cli.removal_duration),
        add_google_search = config.add_google_search,
        "starting gyre"
    );

    let server = ProxyServer::new(pool, config).context("failed to build proxy server")?;
    server.run().await.context("server error")?;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gyre=info,gyre_proxy=info,gyre_pool=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Split a comma-separated flag value, trimming whitespace and dropping
/// empty entries.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse a listen address, accepting the ":PORT" shorthand for all
/// interfaces.
fn normalize_listen(raw: &str) -> Result<SocketAddr> {
    let candidate = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    candidate
        .parse()
        .with_context(|| format!("invalid listen address '{raw}'"))
}
