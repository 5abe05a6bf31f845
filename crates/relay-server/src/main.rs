//! # Relay Server
//!
//! Line-protocol chat relay with groups and file downloads.
//!
//! ## Usage
//!
//! ```bash
//! # Listen on port 12000
//! relay-server 12000
//!
//! # With a custom config
//! relay-server 4000 --config /path/to/relay.toml
//!
//! # Serve files from another directory
//! SERVER_SHARED_FILES=/srv/files relay-server 12000
//! ```

use anyhow::Result;
use clap::Parser;
use relay_server::{metrics, Config, Server};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Relay chat server.
#[derive(Debug, Parser)]
#[command(name = "relay-server", version, about)]
struct Cli {
    /// Port to listen on (overrides config and RELAY_PORT).
    port: u16,

    /// Configuration file (defaults to the usual search paths).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shared file directory (overrides config and SERVER_SHARED_FILES).
    #[arg(long)]
    shared_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    config.port = cli.port;
    if let Some(dir) = cli.shared_dir {
        config.shared_dir = dir;
    }

    tracing::info!(
        "Starting relay server on {}:{} serving {}",
        config.host,
        config.port,
        config.shared_dir.display()
    );

    // Initialize metrics
    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            tracing::error!("Failed to start metrics server: {}", e);
        }
    }

    Server::bind(&config).await?.run().await
}
