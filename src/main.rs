//! Proxychain - Chained Forward Proxy
//!
//! Runs the local proxy endpoint from the command line: reads chain
//! directives from a file, publishes the chain, and serves until
//! interrupted.

use anyhow::{Context, Result};
use base64::Engine;
use clap::Parser;
use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxychain::{BasicAuth, ProxyEngine};

/// CLI arguments for proxychain
#[derive(Parser, Debug)]
#[command(name = "proxychain")]
#[command(about = "Local HTTP proxy that tunnels through a chain of SOCKS5/HTTP upstreams")]
#[command(version)]
#[command(long_about = "
Local HTTP forward proxy that relays traffic through an ordered chain of
upstream SOCKS5/HTTP proxies, resolving hop hostnames over DNS-over-HTTPS.

The chain file holds one directive per line:

  socks5://[user:pass@]host[:port]
  http://[user:pass@]host[:port]
  https://[user:pass@]host[:port]
  doh=<https-url>
  doh=strict:<https-url>

Blank lines are ignored; unparsable lines are skipped. Without a chain file
the proxy connects to destinations directly.
")]
pub struct CliArgs {
    /// Port for the loopback proxy endpoint
    #[arg(short, long, default_value_t = 8080, help = "Port to listen on (loopback only)")]
    pub port: u16,

    /// Chain configuration file, one directive per line
    #[arg(short, long, help = "Path to chain configuration file")]
    pub config: Option<PathBuf>,

    /// Username required from local proxy clients
    #[arg(long, requires = "password", help = "Require Basic auth with this username")]
    pub username: Option<String>,

    /// Password required from local proxy clients
    #[arg(long, requires = "username", help = "Require Basic auth with this password")]
    pub password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", help = "Log level")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args)?;

    info!("Starting proxychain v{}", env!("CARGO_PKG_VERSION"));

    let engine = ProxyEngine::new();
    engine.init().await;

    if let Some(path) = &args.config {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read chain file {}", path.display()))?;
        // The engine speaks the host-application transport: base64 lines
        let encoded = base64::engine::general_purpose::STANDARD.encode(text.as_bytes());
        engine
            .update(&encoded)
            .await
            .context("failed to apply chain configuration")?;
    }

    let auth = match (args.username, args.password) {
        (Some(username), Some(password)) => Some(BasicAuth { username, password }),
        _ => None,
    };

    engine.start_local_proxy(args.port, auth).await?;
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    engine.destroy().await;

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
