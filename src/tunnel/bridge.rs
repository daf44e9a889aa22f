//! The bridge: one multiplexer per carrier
//!
//! Owns the carrier's two directions and the tunnel table, dispatches
//! inbound segments, allocates and recycles virtual connection ids, and
//! tears everything down when the carrier breaks.

use super::codec::{spawn_segment_reader, spawn_segment_writer, SegmentTx};
use super::conn::{ClosedSignal, Tunnel};
use super::segment::{Method, Segment};
use super::{BoxedEndpoint, Role, TunnelError, DEFAULT_MAX_VID, LINE_BREAK_REASON};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

/// Produces a fresh endpoint stream for each accepted connection request.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<BoxedEndpoint>;
}

/// TCP dialer for a fixed destination
pub struct TcpDialer {
    host: String,
    port: u16,
}

impl TcpDialer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxedEndpoint> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true).ok();
        Ok(Box::new(stream))
    }
}

/// Bridge construction parameters
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub role: Role,
    /// Highest virtual connection id this bridge will hand out
    pub max_vid: u16,
}

impl BridgeConfig {
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            max_vid: DEFAULT_MAX_VID,
        }
    }

    pub fn server() -> Self {
        Self {
            role: Role::Server,
            max_vid: DEFAULT_MAX_VID,
        }
    }

    pub fn max_vid(mut self, max_vid: u16) -> Self {
        self.max_vid = max_vid;
        self
    }
}

/// Carrier read direction, consumed by [`Bridge::serve`]
struct CarrierRx {
    segments: mpsc::Receiver<Segment>,
    closed: oneshot::Receiver<io::Error>,
}

/// The multiplexer for one carrier.
///
/// Slot 0 of the tunnel table is permanently unused; a slot whose occupant
/// has been torn down (vid 0) is reusable. Every non-zero vid occurs at most
/// once in the table.
pub struct Bridge {
    role: Role,
    max_vid: u16,
    writer: SegmentTx,
    writer_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    carrier_rx: Mutex<Option<CarrierRx>>,
    tunnels: Mutex<Vec<Option<Arc<Tunnel>>>>,
}

impl Bridge {
    /// Create a bridge over the two carrier directions. The reader and
    /// writer tasks start immediately; call [`Bridge::serve`] to dispatch.
    pub fn new<R, W>(reader: R, writer: W, config: BridgeConfig) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (segments, closed) = spawn_segment_reader(reader);
        let (segment_tx, writer_shutdown) = spawn_segment_writer(writer);
        Arc::new(Self {
            role: config.role,
            max_vid: config.max_vid,
            writer: segment_tx,
            writer_shutdown: Mutex::new(Some(writer_shutdown)),
            carrier_rx: Mutex::new(Some(CarrierRx { segments, closed })),
            tunnels: Mutex::new(vec![None]),
        })
    }

    /// The segment write capability shared with this bridge's tunnels.
    pub fn writer(&self) -> SegmentTx {
        self.writer.clone()
    }

    /// Open a new virtual connection for an accepted endpoint stream.
    ///
    /// Client side only. Returns the allocated vid and the signal that fires
    /// once, with the terminal reason, when the tunnel closes. When every id
    /// up to `max_vid` is live the open fails synchronously: the signal
    /// already carries the exhaustion reason and the endpoint is closed.
    pub async fn open_tunnel(&self, endpoint: BoxedEndpoint) -> (u16, ClosedSignal) {
        let mut table = self.tunnels.lock().await;
        let reusable = table
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, slot)| match slot {
                Some(tunnel) => tunnel.vid() == 0,
                None => true,
            })
            .map(|(index, _)| index as u16);
        let vid = match reusable {
            Some(vid) => Some(vid),
            None if table.len() <= self.max_vid as usize => {
                table.push(None);
                Some((table.len() - 1) as u16)
            }
            None => None,
        };

        let Some(vid) = vid else {
            drop(table);
            let reason = TunnelError::Exhausted(self.max_vid).to_string();
            warn!(%reason, "refusing new tunnel");
            let (closed_tx, closed_rx) = oneshot::channel();
            let _ = closed_tx.send(Some(reason));
            let mut endpoint = endpoint;
            let _ = endpoint.shutdown().await;
            return (0, closed_rx);
        };

        let (tunnel, closed_rx) = Tunnel::new(vid, endpoint, self.role, self.writer.clone());
        table[vid as usize] = Some(Arc::clone(&tunnel));
        drop(table);

        debug!(vid, "tunnel requested");
        if let Err(err) = self.writer.send(Segment::request(vid)).await {
            tunnel.close(Some(err.to_string())).await;
        }
        (vid, closed_rx)
    }

    /// Dispatch inbound segments until the carrier breaks, then tear down.
    ///
    /// The server side passes its dialer; the client passes `None`.
    pub async fn serve(self: Arc<Self>, dialer: Option<Arc<dyn Dialer>>) {
        let carrier_rx = self.carrier_rx.lock().await.take();
        let Some(CarrierRx {
            mut segments,
            closed,
        }) = carrier_rx
        else {
            warn!(role = ?self.role, "bridge already serving");
            return;
        };

        while let Some(segment) = segments.recv().await {
            self.dispatch(segment, dialer.as_deref()).await;
        }

        let reason = match closed.await {
            Ok(err) => err.to_string(),
            Err(_) => "carrier closed".to_string(),
        };
        debug!(role = ?self.role, %reason, "carrier ended, tearing down");
        self.close_all_tunnels().await;
        if let Some(shutdown) = self.writer_shutdown.lock().await.take() {
            let _ = shutdown.send(());
        }
    }

    async fn dispatch(&self, segment: Segment, dialer: Option<&dyn Dialer>) {
        trace!(
            role = ?self.role,
            vid = segment.vid,
            method = segment.method,
            len = segment.payload.len(),
            "segment received"
        );
        match Method::try_from(segment.method) {
            Ok(Method::ReqConn) => self.handle_request(segment.vid, dialer).await,
            Ok(Method::AckConn) => self.handle_ack(segment.vid).await,
            Ok(Method::SendData) => match self.tunnel_at(segment.vid).await {
                Some(tunnel) => tunnel.deliver(&segment.payload).await,
                None => trace!(vid = segment.vid, "data for unknown tunnel dropped"),
            },
            Ok(Method::CloseConn) => {
                let reason = close_reason(&segment.payload);
                match self.tunnel_at(segment.vid).await {
                    Some(tunnel) => tunnel.handle_remote_close(reason).await,
                    None => trace!(vid = segment.vid, "close for unknown tunnel ignored"),
                }
            }
            Ok(Method::Heartbeat) => trace!("heartbeat"),
            Err(_) => trace!(method = segment.method, "unknown method ignored"),
        }
    }

    /// Server side of `ReqConn`: dial the destination, install the tunnel
    /// and ack, or reject with a close carrying the dial error.
    async fn handle_request(&self, vid: u16, dialer: Option<&dyn Dialer>) {
        let dialer = match (self.role, dialer) {
            (Role::Server, Some(dialer)) => dialer,
            _ => {
                warn!(role = ?self.role, vid, "unexpected connection request ignored");
                return;
            }
        };
        if vid == 0 {
            warn!("connection request for reserved vid 0 ignored");
            return;
        }
        match dialer.dial().await {
            Ok(endpoint) => {
                let (tunnel, _closed) = Tunnel::new(vid, endpoint, self.role, self.writer.clone());
                self.install(vid, Arc::clone(&tunnel)).await;
                tunnel.start_forwarder().await;
                if let Err(err) = self.writer.send(Segment::ack(vid)).await {
                    debug!(vid, error = %err, "ack not sent");
                }
            }
            Err(err) => {
                debug!(vid, error = %err, "dial failed, rejecting connection request");
                let reason = err.to_string();
                if let Err(err) = self.writer.send(Segment::close(vid, Some(reason.as_str()))).await {
                    debug!(vid, error = %err, "rejection not sent");
                }
            }
        }
    }

    /// Client side of `AckConn`: the peer accepted, start forwarding.
    async fn handle_ack(&self, vid: u16) {
        if self.role != Role::Client {
            warn!(role = ?self.role, vid, "unexpected connection ack ignored");
            return;
        }
        match self.tunnel_at(vid).await {
            Some(tunnel) => tunnel.start_forwarder().await,
            None => warn!(vid, "ack for unknown tunnel ignored"),
        }
    }

    async fn tunnel_at(&self, vid: u16) -> Option<Arc<Tunnel>> {
        self.tunnels
            .lock()
            .await
            .get(vid as usize)
            .and_then(|slot| slot.clone())
    }

    async fn install(&self, vid: u16, tunnel: Arc<Tunnel>) {
        let mut table = self.tunnels.lock().await;
        if table.len() <= vid as usize {
            table.resize(vid as usize + 1, None);
        }
        table[vid as usize] = Some(tunnel);
    }

    async fn close_all_tunnels(&self) {
        let live: Vec<Arc<Tunnel>> = self
            .tunnels
            .lock()
            .await
            .iter()
            .flatten()
            .filter(|tunnel| tunnel.vid() != 0)
            .cloned()
            .collect();
        for tunnel in live {
            tunnel.close(Some(LINE_BREAK_REASON.to_string())).await;
        }
    }
}

/// A non-empty close payload is the peer's reason, as text
fn close_reason(payload: &[u8]) -> Option<String> {
    if payload.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(payload).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bridge over an idle in-memory carrier. The far end is returned so the
    /// carrier stays healthy for the test's lifetime.
    fn idle_bridge(config: BridgeConfig) -> (Arc<Bridge>, tokio::io::DuplexStream) {
        let (carrier, far) = tokio::io::duplex(65536);
        let (reader, writer) = tokio::io::split(carrier);
        (Bridge::new(reader, writer, config), far)
    }

    fn endpoint() -> (BoxedEndpoint, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        (Box::new(near), far)
    }

    #[tokio::test]
    async fn test_vid_allocation_is_sequential() {
        let (bridge, _carrier) = idle_bridge(BridgeConfig::client());

        let (ep1, _f1) = endpoint();
        let (ep2, _f2) = endpoint();
        let (ep3, _f3) = endpoint();
        let (vid1, _c1) = bridge.open_tunnel(ep1).await;
        let (vid2, _c2) = bridge.open_tunnel(ep2).await;
        let (vid3, _c3) = bridge.open_tunnel(ep3).await;

        assert_eq!((vid1, vid2, vid3), (1, 2, 3));
    }

    #[tokio::test]
    async fn test_vid_reuse_after_close() {
        let (bridge, _carrier) = idle_bridge(BridgeConfig::client());

        let (ep1, _f1) = endpoint();
        let (ep2, _f2) = endpoint();
        let (vid1, _c1) = bridge.open_tunnel(ep1).await;
        let (vid2, _c2) = bridge.open_tunnel(ep2).await;
        assert_eq!((vid1, vid2), (1, 2));

        let tunnel1 = bridge.tunnel_at(1).await.unwrap();
        tunnel1.close(None).await;

        let (ep3, _f3) = endpoint();
        let (vid3, _c3) = bridge.open_tunnel(ep3).await;
        assert_eq!(vid3, 1);

        // the live ids stay unique
        let table = bridge.tunnels.lock().await;
        let mut live: Vec<u16> = table
            .iter()
            .flatten()
            .map(|tunnel| tunnel.vid())
            .filter(|vid| *vid != 0)
            .collect();
        live.sort_unstable();
        assert_eq!(live, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_exhaustion_fails_synchronously() {
        let (bridge, _carrier) = idle_bridge(BridgeConfig::client().max_vid(1));

        let (ep1, _f1) = endpoint();
        let (vid1, _c1) = bridge.open_tunnel(ep1).await;
        assert_eq!(vid1, 1);

        let (ep2, f2) = endpoint();
        let (vid2, closed2) = bridge.open_tunnel(ep2).await;
        assert_eq!(vid2, 0);
        let reason = closed2.await.unwrap();
        assert_eq!(reason.as_deref(), Some("Connection exhausted (max = 1)"));

        // the refused endpoint was closed
        let mut f2 = f2;
        let n = tokio::io::AsyncReadExt::read(&mut f2, &mut [0u8; 8])
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
