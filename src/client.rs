//! Client-side harness
//!
//! Spawns the carrier command, waits for the server's ready marker on its
//! stdout, then runs a client bridge and a local TCP acceptor. Each accepted
//! socket becomes one virtual connection.

use crate::config::ClientConfig;
use crate::tunnel::{Bridge, BridgeConfig};
use crate::{Error, Result};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

/// Scan carrier output until the ready marker has been seen.
///
/// The marker may arrive split across any read boundaries, so a sliding
/// window of the last `token.len()` bytes is matched after every byte.
/// Chunks read before the marker (banners, shell noise) are echoed to
/// `echo`; the chunk containing the marker is swallowed. EOF before the
/// marker means the command died during initialization.
pub async fn await_server_ready<R, W>(reader: &mut R, echo: &mut W, token: &[u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    debug_assert!(!token.is_empty());
    let mut window = vec![0u8; token.len()];
    let mut filled = 0usize;
    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::Config(
                "carrier command exited during initialization".to_string(),
            ));
        }
        for &byte in &buf[..n] {
            if filled == window.len() {
                window.rotate_left(1);
                window[filled - 1] = byte;
            } else {
                window[filled] = byte;
                filled += 1;
            }
            if filled == window.len() && window == token {
                return Ok(());
            }
        }
        echo.write_all(&buf[..n]).await?;
        echo.flush().await?;
    }
}

/// Spawn the carrier command with piped stdio.
pub fn spawn_carrier(command: &str) -> Result<(Child, ChildStdout, ChildStdin)> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| Error::Config("carrier command must not be empty".to_string()))?;
    let mut child = Command::new(program)
        .args(parts)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Config("carrier stdout not captured".to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Config("carrier stdin not captured".to_string()))?;
    Ok((child, stdout, stdin))
}

/// Run the client: carrier, bridge, local acceptor.
pub async fn run_client(config: ClientConfig) -> Result<()> {
    let (_child, mut carrier_out, carrier_in) = spawn_carrier(&config.command)?;
    info!(command = %config.command, "carrier command spawned");

    let mut stdout = tokio::io::stdout();
    await_server_ready(&mut carrier_out, &mut stdout, config.ready_token.as_bytes()).await?;
    info!("carrier ready, entering protocol mode");

    let bridge = Bridge::new(
        carrier_out,
        carrier_in,
        BridgeConfig::client().max_vid(config.max_vid),
    );
    tokio::spawn(bridge.clone().serve(None));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "listening for local connections");

    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(%peer, "local connection accepted");
        socket.set_nodelay(true).ok();
        let (vid, closed) = bridge.open_tunnel(Box::new(socket)).await;
        tokio::spawn(async move {
            match closed.await {
                Ok(Some(reason)) => info!(vid, %peer, %reason, "tunnel closed"),
                Ok(None) => info!(vid, %peer, "tunnel closed"),
                Err(_) => debug!(vid, %peer, "tunnel dropped without a close signal"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_marker_in_one_chunk() {
        let (mut near, mut far) = tokio::io::duplex(4096);
        let token = crate::READY_TOKEN.as_bytes();

        near.write_all(token).await.unwrap();

        let mut echo = Vec::new();
        await_server_ready(&mut far, &mut echo, token).await.unwrap();
        assert!(echo.is_empty());
    }

    #[tokio::test]
    async fn test_ready_marker_split_across_reads() {
        let (mut near, mut far) = tokio::io::duplex(4096);
        let token = crate::READY_TOKEN.as_bytes();

        let scan = tokio::spawn(async move {
            let mut echo = Vec::new();
            await_server_ready(&mut far, &mut echo, crate::READY_TOKEN.as_bytes())
                .await
                .unwrap();
            echo
        });

        near.write_all(b"Last login: banner noise\n").await.unwrap();
        near.flush().await.unwrap();
        // drip the marker through several writes
        for piece in [&token[..7], &token[7..13], &token[13..]] {
            near.write_all(piece).await.unwrap();
            near.flush().await.unwrap();
        }

        let echo = scan.await.unwrap();
        // banner chunks surface; the chunk completing the marker does not
        assert!(echo.starts_with(b"Last login: banner noise\n"));
        let token_tail = &token[token.len() - 5..];
        assert!(!echo.ends_with(token_tail));
    }

    #[tokio::test]
    async fn test_ready_eof_is_an_error() {
        let (near, mut far) = tokio::io::duplex(4096);
        drop(near);

        let mut echo = Vec::new();
        let err = await_server_ready(&mut far, &mut echo, b"::token::")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_spawn_rejects_empty_command() {
        assert!(matches!(spawn_carrier("   "), Err(Error::Config(_))));
    }
}
