//! Per-virtual-connection state and the close half-protocol

use super::codec::SegmentTx;
use super::segment::Segment;
use super::{BoxedEndpoint, Role, READ_CHUNK};
use bytes::Bytes;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, trace};

/// Single-fire notifier carrying the optional terminal reason of a tunnel.
pub type ClosedSignal = oneshot::Receiver<Option<String>>;

/// One virtual connection.
///
/// A tunnel bridges an endpoint byte stream with the segment stream in both
/// directions: its forwarder task turns endpoint reads into data segments,
/// and the bridge hands inbound payloads to [`Tunnel::deliver`].
///
/// The close protocol is asymmetric. The server owns the real endpoint and
/// tears down immediately, then notifies the peer; the client notifies the
/// peer first and keeps its side open until the close is echoed back, so
/// data still in flight from the server is not lost.
pub struct Tunnel {
    role: Role,
    writer: SegmentTx,
    /// 0 once the tunnel has been torn down locally
    vid: AtomicU16,
    state: Mutex<TunnelState>,
    /// Wakes the forwarder out of a blocked endpoint read on teardown
    closed: Notify,
}

struct TunnelState {
    conn: Option<WriteHalf<BoxedEndpoint>>,
    /// Endpoint read half, held until the forwarder starts
    pending_read: Option<ReadHalf<BoxedEndpoint>>,
    closed_tx: Option<oneshot::Sender<Option<String>>>,
}

impl Tunnel {
    pub(crate) fn new(
        vid: u16,
        endpoint: BoxedEndpoint,
        role: Role,
        writer: SegmentTx,
    ) -> (Arc<Self>, ClosedSignal) {
        let (read_half, write_half) = tokio::io::split(endpoint);
        let (closed_tx, closed_rx) = oneshot::channel();
        let tunnel = Arc::new(Self {
            role,
            writer,
            vid: AtomicU16::new(vid),
            state: Mutex::new(TunnelState {
                conn: Some(write_half),
                pending_read: Some(read_half),
                closed_tx: Some(closed_tx),
            }),
            closed: Notify::new(),
        });
        (tunnel, closed_rx)
    }

    /// Current virtual connection id, 0 when torn down
    pub fn vid(&self) -> u16 {
        self.vid.load(Ordering::Acquire)
    }

    /// Start forwarding endpoint reads to the carrier.
    ///
    /// Runs once: the client calls it when the ack arrives, the server right
    /// after dialing. Later calls (a duplicate ack, a torn-down tunnel) find
    /// no read half and do nothing.
    pub(crate) async fn start_forwarder(self: &Arc<Self>) {
        let read_half = self.state.lock().await.pending_read.take();
        let Some(read_half) = read_half else {
            debug!(role = ?self.role, vid = self.vid(), "forwarder not started, no endpoint");
            return;
        };
        let vid = self.vid();
        if vid == 0 {
            return;
        }
        let tunnel = Arc::clone(self);
        tokio::spawn(tunnel.run_forwarder(read_half, vid));
    }

    async fn run_forwarder(self: Arc<Self>, mut read_half: ReadHalf<BoxedEndpoint>, vid: u16) {
        let mut buf = vec![0u8; READ_CHUNK];
        // None: torn down externally, nothing left to do
        // Some(reason): endpoint finished or failed, run the local close
        let outcome = loop {
            tokio::select! {
                _ = self.closed.notified() => break None,
                result = read_half.read(&mut buf) => match result {
                    Ok(0) => break Some(None),
                    Ok(n) => {
                        let segment = Segment::data(vid, Bytes::copy_from_slice(&buf[..n]));
                        if let Err(err) = self.writer.send(segment).await {
                            break Some(Some(err.to_string()));
                        }
                    }
                    Err(err) => break Some(Some(err.to_string())),
                }
            }
        };
        debug!(role = ?self.role, vid, "forwarder exited");
        if let Some(reason) = outcome {
            self.initiate_local_close(reason).await;
        }
    }

    /// Write an inbound data payload to the endpoint.
    ///
    /// A payload for a torn-down tunnel is dropped. A write failure starts
    /// the local close, outside the state lock.
    pub(crate) async fn deliver(&self, payload: &[u8]) {
        let failure = {
            let mut state = self.state.lock().await;
            match state.conn.as_mut() {
                Some(conn) => conn.write_all(payload).await.err(),
                None => {
                    trace!(vid = self.vid(), "payload for torn-down tunnel dropped");
                    return;
                }
            }
        };
        if let Some(err) = failure {
            self.initiate_local_close(Some(err.to_string())).await;
        }
    }

    /// Local endpoint failure or EOF: run this side's half of the close
    /// protocol.
    pub(crate) async fn initiate_local_close(&self, reason: Option<String>) {
        let vid = self.vid();
        if vid == 0 {
            return;
        }
        match self.role {
            Role::Server => {
                self.close(reason.clone()).await;
                if let Err(err) = self.writer.send(Segment::close(vid, reason.as_deref())).await {
                    debug!(vid, error = %err, "close notice not sent");
                }
            }
            Role::Client => {
                // stay open until the peer echoes the close; the carrier
                // teardown covers us if the echo never comes
                if let Err(err) = self.writer.send(Segment::close(vid, reason.as_deref())).await {
                    debug!(vid, error = %err, "close notice not sent");
                }
            }
        }
    }

    /// The peer sent a close for this tunnel.
    pub(crate) async fn handle_remote_close(&self, reason: Option<String>) {
        let vid = self.vid();
        if vid == 0 {
            return;
        }
        match self.role {
            Role::Client => self.close(reason).await,
            Role::Server => {
                self.close(reason.clone()).await;
                if let Err(err) = self.writer.send(Segment::close(vid, reason.as_deref())).await {
                    debug!(vid, error = %err, "close echo not sent");
                }
            }
        }
    }

    /// Tear down the local side. Idempotent: the closed signal fires exactly
    /// once and the endpoint is released exactly once.
    pub(crate) async fn close(&self, reason: Option<String>) {
        let mut state = self.state.lock().await;
        let was_open = self.vid.swap(0, Ordering::AcqRel) != 0;
        if was_open {
            trace!(role = ?self.role, "tunnel half closed");
            if let Some(closed_tx) = state.closed_tx.take() {
                let _ = closed_tx.send(reason);
            }
        }
        if let Some(mut conn) = state.conn.take() {
            let _ = conn.shutdown().await;
        }
        state.pending_read = None;
        drop(state);
        self.closed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::codec::spawn_segment_writer;

    fn test_tunnel(vid: u16, role: Role) -> (Arc<Tunnel>, ClosedSignal, tokio::io::DuplexStream) {
        let (carrier, _carrier_far) = tokio::io::duplex(65536);
        let (writer, _shutdown) = spawn_segment_writer(carrier);
        let (endpoint, far) = tokio::io::duplex(4096);
        let (tunnel, closed) = Tunnel::new(vid, Box::new(endpoint), role, writer);
        (tunnel, closed, far)
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (tunnel, closed, _far) = test_tunnel(1, Role::Client);

        tunnel.close(Some("first".to_string())).await;
        tunnel.close(Some("second".to_string())).await;

        assert_eq!(tunnel.vid(), 0);
        let reason = closed.await.unwrap();
        assert_eq!(reason.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_close_releases_endpoint() {
        let (tunnel, _closed, mut far) = test_tunnel(1, Role::Server);

        tunnel.close(None).await;

        // both endpoint halves are gone, the far side reads EOF
        let n = far.read(&mut [0u8; 8]).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_deliver_after_close_is_noop() {
        let (tunnel, closed, _far) = test_tunnel(1, Role::Client);

        tunnel.close(None).await;
        tunnel.deliver(b"late payload").await;

        assert_eq!(closed.await.unwrap(), None);
    }
}
