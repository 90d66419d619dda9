use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

use terminal_hub::config::DEFAULT_CONFIG_FILE;
use terminal_hub::{AppState, HubConfig, router};

#[derive(Parser)]
#[command(name = "terminal-hub")]
#[command(about = "Shared shell sessions for collaborative projects")]
struct Cli {
    /// Configuration file (missing file = defaults)
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Host to bind to (overrides [server].host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port to listen on (overrides [server].port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "terminal_hub=debug,pty_manager=debug,tower_http=debug,info"
    } else {
        "terminal_hub=info,pty_manager=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut config = HubConfig::load(&cli.config)?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let addr = config.listen_addr()?;
    let state = AppState::local(&config);
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Terminal hub listening on ws://{}/ws/{{project_id}}", addr);

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    state.shutdown().await;
    info!("Shutdown complete");
    server_result
}
