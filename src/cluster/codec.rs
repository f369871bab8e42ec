//! Binary frame codec for the cluster transport.
//!
//! Frame layout, all fields host-byte-order (peers share a host -- they are
//! forked children of the same binary, so there is no cross-architecture
//! concern):
//!
//! ```text
//! offset 0  : u32 channel_len
//! offset 4  : u32 payload_len
//! offset 8  : u32 type
//! offset 12 : i32 filter
//! offset 16 : channel_len bytes of channel
//! offset 16 + channel_len : payload_len bytes of payload
//! ```

use crate::{Error, Result};

/// Size in bytes of the fixed frame header.
pub const HEADER_LEN: usize = 16;
/// Largest `channel_len` a frame may declare.
pub const MAX_CHANNEL_LEN: usize = 16 * 1024 * 1024;
/// Largest `payload_len` a frame may declare.
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// The frame `type` field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameType {
    /// A raw publish, forwarded to every other process and dispatched locally.
    Forward = 0,
    /// Same as `Forward`, but channel/payload are JSON-encoded.
    Json = 1,
    /// A publish addressed to the root process only.
    Root = 2,
    /// Same as `Root`, but channel/payload are JSON-encoded.
    RootJson = 3,
    /// Announces (or replays) an exact-match subscription to the root.
    PubsubSub = 4,
    /// Withdraws a previously announced exact-match subscription.
    PubsubUnsub = 5,
    /// Announces (or replays) a pattern subscription to the root.
    PatternSub = 6,
    /// Withdraws a previously announced pattern subscription.
    PatternUnsub = 7,
    /// Orderly shutdown notice.
    Shutdown = 8,
    /// Reserved for protocol-level error reporting.
    Error = 9,
    /// Liveness probe.
    Ping = 10,
}

impl FrameType {
    /// Recovers a `FrameType` from its wire value, or `None` if unrecognized.
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => FrameType::Forward,
            1 => FrameType::Json,
            2 => FrameType::Root,
            3 => FrameType::RootJson,
            4 => FrameType::PubsubSub,
            5 => FrameType::PubsubUnsub,
            6 => FrameType::PatternSub,
            7 => FrameType::PatternUnsub,
            8 => FrameType::Shutdown,
            9 => FrameType::Error,
            10 => FrameType::Ping,
            _ => return None,
        })
    }
}

/// A fully decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// What kind of frame this is.
    pub frame_type: FrameType,
    /// Non-zero for a filter-channel publish; `0` otherwise.
    pub filter: i32,
    /// Raw channel/pattern bytes.
    pub channel: Vec<u8>,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a frame from its parts.
    #[must_use]
    pub fn new(frame_type: FrameType, filter: i32, channel: Vec<u8>, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            filter,
            channel,
            payload,
        }
    }

    /// A zero-payload frame of the given type (used for `PING`/`SHUTDOWN`).
    #[must_use]
    pub fn control(frame_type: FrameType) -> Self {
        Self::new(frame_type, 0, Vec::new(), Vec::new())
    }

    /// Encodes this frame to its wire representation. Fails with
    /// `Error::FrameTooLarge` if either length limit is violated; callers
    /// treat that as fatal to the connection.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self.frame_type, self.filter, &self.channel, &self.payload)
    }
}

/// Encodes a frame from its parts without allocating a `Frame` first.
pub fn encode(frame_type: FrameType, filter: i32, channel: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    if channel.len() >= MAX_CHANNEL_LEN {
        return Err(Error::FrameTooLarge {
            field: "channel_len",
            len: channel.len(),
            limit: MAX_CHANNEL_LEN,
        });
    }
    if payload.len() >= MAX_PAYLOAD_LEN {
        return Err(Error::FrameTooLarge {
            field: "payload_len",
            len: payload.len(),
            limit: MAX_PAYLOAD_LEN,
        });
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + channel.len() + payload.len());
    buf.extend_from_slice(&(channel.len() as u32).to_ne_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
    buf.extend_from_slice(&(frame_type as u32).to_ne_bytes());
    buf.extend_from_slice(&filter.to_ne_bytes());
    buf.extend_from_slice(channel);
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[derive(Clone, Copy)]
enum ParseState {
    Header,
    Body {
        frame_type: FrameType,
        filter: i32,
        channel_len: usize,
        payload_len: usize,
    },
}

/// Streaming per-connection frame parser.
///
/// Bytes arrive in arbitrary chunks from the socket; `feed` buffers
/// whatever is incomplete and returns every frame that became complete as a
/// result of this call. A growable `Vec<u8>` plus `drain` handles the
/// unconsumed tail, which is the idiomatic Rust shape for a buffer with no
/// fixed upper size (frame bodies run up to 64 MiB).
pub struct Parser {
    buf: Vec<u8>,
    state: ParseState,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            state: ParseState::Header,
        }
    }
}

impl Parser {
    /// Creates a parser with no buffered bytes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds newly-read bytes into the parser, returning every frame that
    /// completed as a result. Errors are fatal to the connection, including
    /// an unrecognized `type`, since a peer can only be another instance of
    /// this same binary.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            match self.state {
                ParseState::Header => {
                    if self.buf.len() < HEADER_LEN {
                        break;
                    }
                    let channel_len =
                        u32::from_ne_bytes(self.buf[0..4].try_into().unwrap()) as usize;
                    let payload_len =
                        u32::from_ne_bytes(self.buf[4..8].try_into().unwrap()) as usize;
                    let type_raw = u32::from_ne_bytes(self.buf[8..12].try_into().unwrap());
                    let filter = i32::from_ne_bytes(self.buf[12..16].try_into().unwrap());

                    if channel_len >= MAX_CHANNEL_LEN {
                        return Err(Error::FrameTooLarge {
                            field: "channel_len",
                            len: channel_len,
                            limit: MAX_CHANNEL_LEN,
                        });
                    }
                    if payload_len >= MAX_PAYLOAD_LEN {
                        return Err(Error::FrameTooLarge {
                            field: "payload_len",
                            len: payload_len,
                            limit: MAX_PAYLOAD_LEN,
                        });
                    }
                    let frame_type = FrameType::from_u32(type_raw)
                        .ok_or(Error::UnknownFrameType(type_raw))?;

                    self.state = ParseState::Body {
                        frame_type,
                        filter,
                        channel_len,
                        payload_len,
                    };
                }
                ParseState::Body {
                    frame_type,
                    filter,
                    channel_len,
                    payload_len,
                } => {
                    let total = HEADER_LEN + channel_len + payload_len;
                    if self.buf.len() < total {
                        break;
                    }
                    let channel = self.buf[HEADER_LEN..HEADER_LEN + channel_len].to_vec();
                    let payload = self.buf[HEADER_LEN + channel_len..total].to_vec();
                    frames.push(Frame::new(frame_type, filter, channel, payload));
                    self.buf.drain(0..total);
                    self.state = ParseState::Header;
                }
            }
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_header_layout_snapshot() {
        let encoded = encode(FrameType::PatternSub, -7, b"user.*", b"\x00").unwrap();
        insta::assert_debug_snapshot!(&encoded[..HEADER_LEN]);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        for (channel, payload) in [
            (b"".as_slice(), b"".as_slice()),
            (b"news".as_slice(), b"hello".as_slice()),
            (b"x".repeat(1000).leak() as &[u8], b"y".repeat(5000).leak() as &[u8]),
        ] {
            let encoded = encode(FrameType::Forward, 0, channel, payload).unwrap();
            let mut parser = Parser::new();
            let frames = parser.feed(&encoded).unwrap();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].channel, channel);
            assert_eq!(frames[0].payload, payload);
            assert_eq!(frames[0].frame_type, FrameType::Forward);
        }
    }

    #[test]
    fn test_feed_in_arbitrary_chunks() {
        let encoded = encode(FrameType::PubsubSub, 0, b"chan", b"payload").unwrap();
        let mut parser = Parser::new();
        let mut frames = Vec::new();
        for byte in &encoded {
            frames.extend(parser.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, b"chan");
        assert_eq!(frames[0].payload, b"payload");
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut encoded = encode(FrameType::Ping, 0, b"", b"").unwrap();
        encoded.extend(encode(FrameType::Shutdown, 0, b"", b"").unwrap());
        let mut parser = Parser::new();
        let frames = parser.feed(&encoded).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame_type, FrameType::Ping);
        assert_eq!(frames[1].frame_type, FrameType::Shutdown);
    }

    #[test]
    fn test_channel_len_over_limit_is_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&(MAX_CHANNEL_LEN as u32).to_ne_bytes());
        header.extend_from_slice(&0u32.to_ne_bytes());
        header.extend_from_slice(&(FrameType::Forward as u32).to_ne_bytes());
        header.extend_from_slice(&0i32.to_ne_bytes());
        let mut parser = Parser::new();
        assert!(matches!(
            parser.feed(&header),
            Err(Error::FrameTooLarge { field: "channel_len", .. })
        ));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let mut header = Vec::new();
        header.extend_from_slice(&0u32.to_ne_bytes());
        header.extend_from_slice(&0u32.to_ne_bytes());
        header.extend_from_slice(&999u32.to_ne_bytes());
        header.extend_from_slice(&0i32.to_ne_bytes());
        let mut parser = Parser::new();
        assert!(matches!(parser.feed(&header), Err(Error::UnknownFrameType(999))));
    }
}
