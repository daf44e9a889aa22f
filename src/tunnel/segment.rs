//! Segment encoding/decoding for the tunnel protocol
//!
//! Segment format (big-endian):
//! ```text
//! +---------+---------+-------------------+
//! | Version |  Method |     VID (2B)      |
//! +---------+---------+-------------------+
//! |          Payload Length (4B)          |
//! +---------------------------------------+
//! |                Payload                |
//! +---------------------------------------+
//! ```
//!
//! `VID` is the virtual connection id; 0 is reserved and never allocated.

use super::{TunnelError, HEADER_SIZE, PROTOCOL_VERSION};
use bytes::{BufMut, Bytes, BytesMut};

/// Segment methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Method {
    /// Request a new virtual connection
    ReqConn = 1,
    /// Acknowledge a virtual connection
    AckConn = 2,
    /// Application data for a virtual connection
    SendData = 3,
    /// Close a virtual connection, payload is an optional reason
    CloseConn = 4,
    /// Keepalive
    Heartbeat = 5,
}

impl TryFrom<u8> for Method {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Method::ReqConn),
            2 => Ok(Method::AckConn),
            3 => Ok(Method::SendData),
            4 => Ok(Method::CloseConn),
            5 => Ok(Method::Heartbeat),
            other => Err(TunnelError::UnknownMethod(other)),
        }
    }
}

/// One unit of the multiplexing protocol on the carrier.
///
/// The method byte is kept raw so segments with methods this build does not
/// know about still decode; the dispatcher decides what to ignore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Protocol version
    pub version: u8,
    /// Method byte
    pub method: u8,
    /// Virtual connection id (0 for none)
    pub vid: u16,
    /// Payload data
    pub payload: Bytes,
}

impl Segment {
    /// Create a connection request segment
    pub fn request(vid: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            method: Method::ReqConn as u8,
            vid,
            payload: Bytes::new(),
        }
    }

    /// Create a connection acknowledgement segment
    pub fn ack(vid: u16) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            method: Method::AckConn as u8,
            vid,
            payload: Bytes::new(),
        }
    }

    /// Create a data segment
    pub fn data(vid: u16, payload: Bytes) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            method: Method::SendData as u8,
            vid,
            payload,
        }
    }

    /// Create a close segment. A reason, when given, travels as the payload.
    pub fn close(vid: u16, reason: Option<&str>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            method: Method::CloseConn as u8,
            vid,
            payload: match reason {
                Some(reason) => Bytes::copy_from_slice(reason.as_bytes()),
                None => Bytes::new(),
            },
        }
    }

    /// Create a heartbeat segment
    pub fn heartbeat() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            method: Method::Heartbeat as u8,
            vid: 0,
            payload: Bytes::new(),
        }
    }

    /// Encode segment to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.version);
        buf.put_u8(self.method);
        buf.put_u16(self.vid);
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Total encoded size of this segment
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Decode step the state machine is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Version,
    Method,
    Vid,
    PayloadLength,
    Payload,
}

/// Streaming segment decoder.
///
/// Feeds of arbitrarily chunked bytes produce the same segment sequence as
/// one contiguous feed. The decoder never looks beyond the bytes it is
/// given; multi-byte fields accumulate in a small partial buffer until
/// complete.
#[derive(Debug)]
pub struct SegmentDecoder {
    step: Step,
    partial: [u8; 4],
    partial_len: usize,
    version: u8,
    method: u8,
    vid: u16,
    remaining: u32,
    payload: BytesMut,
}

impl Default for SegmentDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentDecoder {
    pub fn new() -> Self {
        Self {
            step: Step::Version,
            partial: [0u8; 4],
            partial_len: 0,
            version: 0,
            method: 0,
            vid: 0,
            remaining: 0,
            payload: BytesMut::new(),
        }
    }

    /// Consume a chunk of carrier bytes, returning every segment completed
    /// by it. A segment with an empty payload completes as soon as its
    /// length field does.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Segment> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < chunk.len() {
            match self.step {
                Step::Version => {
                    self.version = chunk[i];
                    self.step = Step::Method;
                    i += 1;
                }
                Step::Method => {
                    self.method = chunk[i];
                    self.step = Step::Vid;
                    i += 1;
                }
                Step::Vid => {
                    self.partial[self.partial_len] = chunk[i];
                    self.partial_len += 1;
                    i += 1;
                    if self.partial_len == 2 {
                        self.vid = u16::from_be_bytes([self.partial[0], self.partial[1]]);
                        self.partial_len = 0;
                        self.step = Step::PayloadLength;
                    }
                }
                Step::PayloadLength => {
                    self.partial[self.partial_len] = chunk[i];
                    self.partial_len += 1;
                    i += 1;
                    if self.partial_len == 4 {
                        self.remaining = u32::from_be_bytes(self.partial);
                        self.partial_len = 0;
                        self.payload =
                            BytesMut::with_capacity(self.remaining.min(4096) as usize);
                        self.step = Step::Payload;
                    }
                }
                Step::Payload => {
                    let take = (self.remaining as usize).min(chunk.len() - i);
                    self.payload.extend_from_slice(&chunk[i..i + take]);
                    self.remaining -= take as u32;
                    i += take;
                }
            }
            if self.step == Step::Payload && self.remaining == 0 {
                out.push(self.complete());
            }
        }
        out
    }

    /// Take the finished segment and reset for the next one
    fn complete(&mut self) -> Segment {
        let segment = Segment {
            version: self.version,
            method: self.method,
            vid: self.vid,
            payload: std::mem::take(&mut self.payload).freeze(),
        };
        self.step = Step::Version;
        segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let segment = Segment::data(0x0102, Bytes::from_static(b"ab"));
        let encoded = segment.encode();

        assert_eq!(
            &encoded[..],
            &[1, 3, 0x01, 0x02, 0, 0, 0, 2, b'a', b'b']
        );
    }

    #[test]
    fn test_empty_payload_constructors() {
        for segment in [
            Segment::request(7),
            Segment::ack(7),
            Segment::close(7, None),
            Segment::heartbeat(),
        ] {
            assert!(segment.payload.is_empty());
            assert_eq!(segment.encoded_size(), HEADER_SIZE);
        }
    }

    #[test]
    fn test_close_reason_payload() {
        let segment = Segment::close(3, Some("dial refused"));
        assert_eq!(&segment.payload[..], b"dial refused");

        let mut decoder = SegmentDecoder::new();
        let decoded = decoder.feed(&segment.encode());
        assert_eq!(decoded, vec![segment]);
    }

    #[test]
    fn test_roundtrip_single_feed() {
        let segments = vec![
            Segment::request(1),
            Segment::ack(1),
            Segment::data(1, Bytes::from_static(b"hello tunnel")),
            Segment::close(1, Some("bye")),
            Segment::heartbeat(),
        ];

        let mut wire = BytesMut::new();
        for segment in &segments {
            wire.extend_from_slice(&segment.encode());
        }

        let mut decoder = SegmentDecoder::new();
        assert_eq!(decoder.feed(&wire), segments);
    }

    #[test]
    fn test_roundtrip_byte_by_byte() {
        let segments = vec![
            Segment::data(9999, Bytes::from_static(b"chunked")),
            Segment::close(42, None),
            Segment::data(1, Bytes::new()),
        ];

        let mut wire = BytesMut::new();
        for segment in &segments {
            wire.extend_from_slice(&segment.encode());
        }

        let mut decoder = SegmentDecoder::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            decoded.extend(decoder.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(decoded, segments);
    }

    #[test]
    fn test_zero_payload_emits_on_length() {
        // a header alone must produce a segment, with no payload byte to
        // trigger it
        let mut decoder = SegmentDecoder::new();
        let decoded = decoder.feed(&Segment::request(5).encode());
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].vid, 5);
        assert!(decoded[0].payload.is_empty());
    }

    #[test]
    fn test_unknown_method_passes_codec() {
        let odd = Segment {
            version: PROTOCOL_VERSION,
            method: 250,
            vid: 3,
            payload: Bytes::from_static(b"future"),
        };
        let mut decoder = SegmentDecoder::new();
        let decoded = decoder.feed(&odd.encode());
        assert_eq!(decoded, vec![odd]);
        assert!(Method::try_from(250u8).is_err());
    }

    #[test]
    fn test_split_inside_header() {
        let segment = Segment::data(300, Bytes::from_static(b"payload"));
        let wire = segment.encode();

        let mut decoder = SegmentDecoder::new();
        assert!(decoder.feed(&wire[..3]).is_empty());
        assert!(decoder.feed(&wire[3..6]).is_empty());
        let decoded = decoder.feed(&wire[6..]);
        assert_eq!(decoded, vec![segment]);
    }
}
