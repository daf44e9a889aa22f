//! Carrier reader and writer tasks
//!
//! One task owns each direction of the carrier. The writer drains a segment
//! queue and writes each encoded segment as one uninterrupted unit; the
//! reader feeds carrier bytes through a [`SegmentDecoder`] and streams the
//! segments out. Either task publishes its first fatal error on a terminal
//! channel and stops.

use super::segment::{Segment, SegmentDecoder};
use super::{TunnelError, READ_CHUNK, SEGMENT_QUEUE_DEPTH};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, trace};

/// Cloneable handle that enqueues segments for the carrier writer.
///
/// This is the only write capability tunnels receive; they never see the
/// bridge itself. A mutex serializes every sender's check-then-send, so a
/// sender observes a failed carrier at the send call rather than losing the
/// segment silently.
#[derive(Clone)]
pub struct SegmentTx {
    inner: Arc<TxShared>,
}

struct TxShared {
    gate: Mutex<()>,
    queue: mpsc::Sender<Segment>,
    failed: watch::Receiver<Option<String>>,
}

impl SegmentTx {
    /// Enqueue one segment. Fails fast with the sticky write error once the
    /// carrier write side has broken.
    pub async fn send(&self, segment: Segment) -> Result<(), TunnelError> {
        let _gate = self.inner.gate.lock().await;
        if let Some(reason) = self.inner.failed.borrow().clone() {
            return Err(TunnelError::WriteFailed(reason));
        }
        if self.inner.queue.send(segment).await.is_err() {
            let reason = self
                .inner
                .failed
                .borrow()
                .clone()
                .unwrap_or_else(|| "carrier writer stopped".to_string());
            return Err(TunnelError::WriteFailed(reason));
        }
        Ok(())
    }

    /// The sticky write error, if the carrier write side has failed.
    pub fn failure(&self) -> Option<String> {
        self.inner.failed.borrow().clone()
    }
}

/// Spawn the writer task for the carrier write half.
///
/// Returns the segment sender and a shutdown handle that closes the sink.
/// The first write error is recorded for [`SegmentTx::failure`] and every
/// later send.
pub(crate) fn spawn_segment_writer<W>(mut sink: W) -> (SegmentTx, oneshot::Sender<()>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (queue_tx, mut queue_rx) = mpsc::channel::<Segment>(SEGMENT_QUEUE_DEPTH);
    let (failed_tx, failed_rx) = watch::channel(None::<String>);
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                segment = queue_rx.recv() => {
                    let Some(segment) = segment else { break };
                    let bytes = segment.encode();
                    let result = async {
                        sink.write_all(&bytes).await?;
                        sink.flush().await
                    }
                    .await;
                    match result {
                        Ok(()) => trace!(
                            method = segment.method,
                            vid = segment.vid,
                            len = bytes.len(),
                            "segment written"
                        ),
                        Err(err) => {
                            debug!(error = %err, "carrier write failed, writer stopping");
                            let _ = failed_tx.send(Some(err.to_string()));
                            break;
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    debug!("carrier writer shut down");
                    let _ = sink.shutdown().await;
                    break;
                }
            }
        }
    });

    let tx = SegmentTx {
        inner: Arc::new(TxShared {
            gate: Mutex::new(()),
            queue: queue_tx,
            failed: failed_rx,
        }),
    };
    (tx, shutdown_tx)
}

/// Spawn the reader task for the carrier read half.
///
/// Segments stream out of the returned receiver until the carrier breaks;
/// the terminal error (EOF included) then arrives on the oneshot and the
/// segment channel closes.
pub(crate) fn spawn_segment_reader<R>(
    mut source: R,
) -> (mpsc::Receiver<Segment>, oneshot::Receiver<io::Error>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let (segment_tx, segment_rx) = mpsc::channel::<Segment>(SEGMENT_QUEUE_DEPTH);
    let (closed_tx, closed_rx) = oneshot::channel::<io::Error>();

    tokio::spawn(async move {
        let mut decoder = SegmentDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let reason = loop {
            match source.read(&mut buf).await {
                Ok(0) => break io::Error::new(io::ErrorKind::UnexpectedEof, "carrier closed"),
                Ok(n) => {
                    for segment in decoder.feed(&buf[..n]) {
                        if segment_tx.send(segment).await.is_err() {
                            // receiver gone, nobody left to notify
                            return;
                        }
                    }
                }
                Err(err) => break err,
            }
        };
        debug!(error = %reason, "carrier read ended");
        let _ = closed_tx.send(reason);
    });

    (segment_rx, closed_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_writer_preserves_order() {
        let (sink, mut far_end) = tokio::io::duplex(65536);
        let (tx, _shutdown) = spawn_segment_writer(sink);

        let segments: Vec<Segment> = (1..=5u16)
            .map(|vid| Segment::data(vid, Bytes::from(vec![vid as u8; 10])))
            .collect();
        for segment in &segments {
            tx.send(segment.clone()).await.unwrap();
        }

        let mut decoder = SegmentDecoder::new();
        let mut decoded = Vec::new();
        let mut buf = [0u8; 256];
        while decoded.len() < segments.len() {
            let n = far_end.read(&mut buf).await.unwrap();
            decoded.extend(decoder.feed(&buf[..n]));
        }
        assert_eq!(decoded, segments);
    }

    #[tokio::test]
    async fn test_writer_failure_is_sticky() {
        let (sink, far_end) = tokio::io::duplex(16);
        let (tx, _shutdown) = spawn_segment_writer(sink);
        drop(far_end);

        // the first send may still be buffered, but the broken pipe must
        // surface within a bounded number of attempts and then stick
        let mut first_error = None;
        for _ in 0..10 {
            if let Err(err) = tx.send(Segment::data(1, Bytes::from_static(b"payload"))).await {
                first_error = Some(err);
                break;
            }
        }
        let first_error = first_error.expect("broken carrier never surfaced");
        assert!(matches!(first_error, TunnelError::WriteFailed(_)));

        let err = tx
            .send(Segment::data(2, Bytes::from_static(b"more")))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::WriteFailed(_)));
        assert!(tx.failure().is_some());
    }

    #[tokio::test]
    async fn test_reader_streams_then_terminates() {
        let (mut near_end, source) = tokio::io::duplex(65536);
        let (mut segments, closed) = spawn_segment_reader(source);

        let sent = Segment::data(3, Bytes::from_static(b"across the pipe"));
        let wire = sent.encode();
        // split the frame across two writes
        near_end.write_all(&wire[..5]).await.unwrap();
        near_end.flush().await.unwrap();
        near_end.write_all(&wire[5..]).await.unwrap();
        near_end.flush().await.unwrap();

        let received = segments.recv().await.unwrap();
        assert_eq!(received, sent);

        drop(near_end);
        assert!(segments.recv().await.is_none());
        let err = closed.await.unwrap();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
