//! # Stdio Tunnel
//!
//! A port forwarder that multiplexes many TCP connections over the standard
//! input/output of a single spawned command.
//!
//! The client listens on a local TCP port and launches a carrier command
//! (typically a remote shell). Every accepted connection becomes a *virtual
//! connection* carried as framed segments over the command's stdin/stdout.
//! On the far side the server terminates each virtual connection on a real
//! TCP endpoint.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  TCP  ┌─────────────────────┐  stdio  ┌─────────────────────┐  TCP  ┌─────────────┐
//! │ local client │ ────> │ stdio-tunnel-client │ ──────> │ stdio-tunnel-server │ ────> │ target host │
//! │              │ <──── │ bridge + acceptor   │ <────── │ bridge + dialer     │ <──── │             │
//! └──────────────┘       └─────────────────────┘         └─────────────────────┘       └─────────────┘
//! ```
//!
//! The multiplexing layer lives in [`tunnel`]: the segment wire format, the
//! serialized carrier writer, the streaming reader, the per-connection
//! [`tunnel::Tunnel`] state machine and the [`tunnel::Bridge`] that owns
//! them all.

pub mod client;
pub mod config;
pub mod server;
pub mod tunnel;

pub use config::Config;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Token the server prints on stdout once it is ready to speak the tunnel
/// protocol. The client discards carrier output until it has seen this
/// marker.
pub const READY_TOKEN: &str = "::stdiotunnel-server-ready::";

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
