//! Stdio Tunnel Server
//!
//! Runs on the far side of the carrier (typically launched by the client
//! through a remote shell). Announces readiness on stdout, then terminates
//! every virtual connection on the configured TCP destination.
//!
//! Stdout belongs to the protocol, so all logging goes to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use stdio_tunnel::{server::run_server, Config};
use tracing::info;

/// Stdio Tunnel Server - terminate virtual connections on a TCP destination
#[derive(Parser, Debug)]
#[command(name = "stdio-tunnel-server")]
#[command(about = "Serve tunnel requests arriving on stdio against a TCP destination")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Destination host (overrides config)
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Destination port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    let mut server = config.server.unwrap_or_default();
    if let Some(host) = args.host {
        server.host = host;
    }
    if let Some(port) = args.port {
        server.port = port;
    }

    info!("Stdio Tunnel Server v{}", stdio_tunnel::VERSION);
    run_server(server).await.context("server failed")?;
    Ok(())
}
