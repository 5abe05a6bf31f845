//! # Relay Client
//!
//! ```bash
//! relay-client alice 127.0.0.1 12000
//! ```

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Interactive relay chat client.
#[derive(Debug, Parser)]
#[command(name = "relay-client", version, about)]
struct Cli {
    /// Display name to register with.
    name: String,

    /// Server host.
    host: String,

    /// Server port.
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they stay out of the chat.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    relay_client::run(&cli.name, &cli.host, cli.port).await
}
