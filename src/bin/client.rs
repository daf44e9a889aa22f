//! Stdio Tunnel Client
//!
//! Spawns a carrier command, waits for the server-ready marker on its
//! stdout, then forwards every connection accepted on a local TCP port
//! through the carrier as a virtual connection.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use stdio_tunnel::{client::run_client, Config};
use tracing::info;

/// Stdio Tunnel Client - forward a local port over a command's stdio
#[derive(Parser, Debug)]
#[command(name = "stdio-tunnel-client")]
#[command(about = "Forward a local TCP port over the stdio of a spawned command")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Local listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Carrier command to spawn, e.g. "ssh gateway stdio-tunnel-server -p 5432"
    #[arg(short = 'e', long)]
    command: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.as_str())
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    let mut client = config.client.unwrap_or_default();
    if let Some(port) = args.port {
        client.port = port;
    }
    if let Some(command) = args.command {
        client.command = command;
    }
    if client.command.trim().is_empty() {
        return Err(anyhow!(
            "no carrier command configured (pass --command or set [client] command)"
        ));
    }

    info!("Stdio Tunnel Client v{}", stdio_tunnel::VERSION);
    run_client(client).await.context("client failed")?;
    Ok(())
}
