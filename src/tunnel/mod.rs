//! Multiplexing layer
//!
//! Provides:
//! - Segment encoding/decoding (the wire format on the carrier)
//! - Serialized carrier writer and streaming carrier reader
//! - Per-virtual-connection tunnels with the close half-protocol
//! - The bridge that owns the carrier and the tunnel table

mod bridge;
mod codec;
mod conn;
mod segment;

pub use bridge::{Bridge, BridgeConfig, Dialer, TcpDialer};
pub use codec::SegmentTx;
pub use conn::{ClosedSignal, Tunnel};
pub use segment::{Method, Segment, SegmentDecoder};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Multiplexing layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("carrier write failed: {0}")]
    WriteFailed(String),

    #[error("Connection exhausted (max = {0})")]
    Exhausted(u16),

    #[error("unknown method: {0}")]
    UnknownMethod(u8),
}

/// Which side of the carrier a bridge sits on.
///
/// The role is fixed at construction. It decides who may open virtual
/// connections (the client) and which half of the close protocol applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// A bidirectional byte stream a tunnel bridges to the far side.
pub trait EndpointStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> EndpointStream for T {}

/// Boxed endpoint stream, as produced by acceptors and dialers.
pub type BoxedEndpoint = Box<dyn EndpointStream>;

/// Protocol version carried in every segment header
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed segment header size in bytes
pub const HEADER_SIZE: usize = 8;

/// Highest virtual connection id a bridge will allocate. Id 0 is reserved.
pub const DEFAULT_MAX_VID: u16 = u16::MAX - 1;

/// Read size for endpoint forwarders and the carrier reader
pub(crate) const READ_CHUNK: usize = 4096;

/// Depth of the segment queues feeding the carrier writer and reader
pub(crate) const SEGMENT_QUEUE_DEPTH: usize = 64;

/// Teardown reason handed to every tunnel when the carrier breaks
pub(crate) const LINE_BREAK_REASON: &str = "line break";
