//! Binary entry point - the composition root.
//!
//! Configuration comes from the environment (optionally a `.env` file);
//! `--host`/`--port` flags override the listen address for ad-hoc runs.

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use copilot_proxy::config::{Config, flag_from_env};
use copilot_proxy::{ProxyState, serve};

#[derive(Debug, Parser)]
#[command(name = "copilot-proxy", version, about)]
struct Cli {
    /// Override LISTEN_HOST.
    #[arg(long)]
    host: Option<String>,

    /// Override LISTEN_PORT.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logging; VERBOSE=1 raises the default filter to debug.
    let default_filter = if flag_from_env("VERBOSE") {
        "copilot_proxy=debug,tower_http=debug"
    } else {
        "copilot_proxy=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(host) = cli.host {
        config.listen_host = host;
    }
    if let Some(port) = cli.port {
        config.listen_port = port;
    }

    info!(
        "copilot-proxy {} — Ollama-compatible bridge to an OpenAI-style server",
        env!("CARGO_PKG_VERSION")
    );
    info!("upstream target: {}", config.upstream);
    info!(
        mode = %config.thinking_mode,
        debug = config.thinking_debug,
        "thinking mode configuration"
    );

    let addr = format!("{}:{}", config.listen_host, config.listen_port);
    let state = ProxyState::new(config)?;

    // Extension point: runs shortly after the last active stream ends.
    state
        .streams
        .set_drain_hook(|| debug!("processing queued /api/show requests (no-op)"));

    let listener = TcpListener::bind(&addr).await?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    serve(listener, state, cancel).await
}
