//! Server-side harness
//!
//! Announces readiness on stdout, then serves a server bridge over stdio.
//! Every accepted connection request is dialed out to the configured TCP
//! destination. Logging must go to stderr here; stdout is the carrier.

use crate::config::ServerConfig;
use crate::tunnel::{Bridge, BridgeConfig, TcpDialer};
use crate::Result;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Run the server over this process's stdin/stdout.
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(config.ready_token.as_bytes()).await?;
    stdout.flush().await?;

    let dialer = Arc::new(TcpDialer::new(config.host.clone(), config.port));
    let bridge = Bridge::new(tokio::io::stdin(), stdout, BridgeConfig::server());
    info!(host = %config.host, port = config.port, "serving tunnel requests over stdio");
    bridge.serve(Some(dialer)).await;
    info!("carrier closed, server exiting");
    Ok(())
}
