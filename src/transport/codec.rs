//! Frame codecs for agent byte streams.
//!
//! Two framings are supported:
//!
//! - [`NdjsonCodec`]: one UTF-8 JSON value per `\n`-terminated line, built on
//!   [`tokio_util::codec::LinesCodec`].
//! - [`ContentLengthCodec`]: LSP-style `Content-Length: N` header block
//!   followed by exactly `N` body bytes.
//!
//! Both enforce a maximum frame size so a misbehaving agent cannot make the
//! client allocate unbounded memory for a single message.
//!
//! # Recoverable faults
//!
//! An `Err` returned from a decoder ends a [`tokio_util::codec::FramedRead`]
//! stream. Oversized, non-UTF-8 or badly-headed frames are therefore yielded
//! as [`Frame::Rejected`] items so the reader can log them and keep going;
//! only I/O failures surface as errors.

use bytes::{Buf, BytesMut};
use serde::Deserialize;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{Result, RpcError};

/// Default maximum frame size: 1 MiB.
pub const MAX_FRAME_BYTES: usize = 1_048_576;

/// Header blocks longer than this are discarded as garbage.
const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Wire framing used on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Newline-delimited JSON.
    #[default]
    Ndjson,
    /// `Content-Length` header framing.
    ContentLength,
}

/// One decoded unit from the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete message payload.
    Message(String),
    /// A frame that was skipped, with the reason.
    Rejected(String),
}

// ── NDJSON ────────────────────────────────────────────────────────────────────

/// NDJSON codec for agent streams.
///
/// Delegates line-framing to [`LinesCodec`] with a fixed maximum length.
/// Each newline-terminated UTF-8 string is one complete message; a trailing
/// `\r` is stripped by [`LinesCodec`].
#[derive(Debug)]
pub struct NdjsonCodec {
    lines: LinesCodec,
    max_bytes: usize,
}

impl NdjsonCodec {
    /// Create a codec with the given maximum line length.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_bytes),
            max_bytes,
        }
    }

    fn map_line(
        &self,
        result: std::result::Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Frame>> {
        match result {
            Ok(line) => Ok(line.map(Frame::Message)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Frame::Rejected(format!(
                "line too long: exceeded {} bytes",
                self.max_bytes
            )))),
            Err(LinesCodecError::Io(err)) if err.kind() == std::io::ErrorKind::InvalidData => {
                Ok(Some(Frame::Rejected(format!("invalid utf-8 line: {err}"))))
            }
            Err(LinesCodecError::Io(err)) => Err(RpcError::Io(err.to_string())),
        }
    }
}

impl Default for NdjsonCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl Decoder for NdjsonCodec {
    type Item = Frame;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let result = self.lines.decode(src);
        self.map_line(result)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let result = self.lines.decode_eof(src);
        self.map_line(result)
    }
}

impl Encoder<String> for NdjsonCodec {
    type Error = RpcError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        // LinesCodec::encode does not enforce a max line length;
        // the limit applies only to decoding.
        self.lines
            .encode(item, dst)
            .map_err(|e| RpcError::Io(e.to_string()))
    }
}

// ── Content-Length ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    /// Waiting for a complete header block.
    Header,
    /// Header parsed; waiting for `n` body bytes.
    Body(usize),
    /// Skipping `n` bytes of an oversized body.
    Discard(usize),
}

/// `Content-Length` codec.
///
/// ```text
/// Content-Length: <length>\r\n
/// \r\n
/// <payload>
/// ```
///
/// Header names are matched case-insensitively, other headers (such as
/// `Content-Type`) are ignored, and bare `\n` line endings are accepted.
#[derive(Debug)]
pub struct ContentLengthCodec {
    max_bytes: usize,
    state: HeaderState,
}

impl ContentLengthCodec {
    /// Create a codec with the given maximum body length.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            state: HeaderState::Header,
        }
    }
}

impl Default for ContentLengthCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl Decoder for ContentLengthCodec {
    type Item = Frame;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.state {
                HeaderState::Header => {
                    let Some((header_len, block_len)) = find_header_end(src) else {
                        if src.len() > MAX_HEADER_BYTES {
                            src.clear();
                            return Ok(Some(Frame::Rejected(format!(
                                "header block exceeded {MAX_HEADER_BYTES} bytes"
                            ))));
                        }
                        return Ok(None);
                    };

                    let block = src.split_to(block_len);
                    let length = match parse_content_length(&block[..header_len]) {
                        Ok(length) => length,
                        Err(reason) => return Ok(Some(Frame::Rejected(reason))),
                    };

                    if length > self.max_bytes {
                        self.state = HeaderState::Discard(length);
                        return Ok(Some(Frame::Rejected(format!(
                            "frame too large: {length} bytes exceeds {} bytes",
                            self.max_bytes
                        ))));
                    }
                    self.state = HeaderState::Body(length);
                }

                HeaderState::Body(length) => {
                    if src.len() < length {
                        src.reserve(length - src.len());
                        return Ok(None);
                    }
                    let body = src.split_to(length);
                    self.state = HeaderState::Header;
                    return Ok(Some(match String::from_utf8(body.to_vec()) {
                        Ok(text) => Frame::Message(text),
                        Err(e) => Frame::Rejected(format!("invalid utf-8 body: {e}")),
                    }));
                }

                HeaderState::Discard(remaining) => {
                    let n = remaining.min(src.len());
                    src.advance(n);
                    if n < remaining {
                        self.state = HeaderState::Discard(remaining - n);
                        return Ok(None);
                    }
                    self.state = HeaderState::Header;
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let leftover = src.len();
                src.clear();
                self.state = HeaderState::Header;
                Ok(Some(Frame::Rejected(format!(
                    "stream ended inside a frame ({leftover} bytes dropped)"
                ))))
            }
        }
    }
}

impl Encoder<String> for ContentLengthCodec {
    type Error = RpcError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        let header = format!("Content-Length: {}\r\n\r\n", item.len());
        dst.reserve(header.len() + item.len());
        dst.extend_from_slice(header.as_bytes());
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}

// ── Framing-selected codec ────────────────────────────────────────────────────

/// Codec chosen at runtime from a [`Framing`].
#[derive(Debug)]
pub enum FrameCodec {
    /// Newline-delimited JSON.
    Ndjson(NdjsonCodec),
    /// `Content-Length` header framing.
    ContentLength(ContentLengthCodec),
}

impl FrameCodec {
    /// Build the codec for `framing` with the given frame-size limit.
    #[must_use]
    pub fn new(framing: Framing, max_bytes: usize) -> Self {
        match framing {
            Framing::Ndjson => Self::Ndjson(NdjsonCodec::new(max_bytes)),
            Framing::ContentLength => Self::ContentLength(ContentLengthCodec::new(max_bytes)),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self {
            Self::Ndjson(codec) => codec.decode(src),
            Self::ContentLength(codec) => codec.decode(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self {
            Self::Ndjson(codec) => codec.decode_eof(src),
            Self::ContentLength(codec) => codec.decode_eof(src),
        }
    }
}

impl Encoder<String> for FrameCodec {
    type Error = RpcError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        match self {
            Self::Ndjson(codec) => codec.encode(item, dst),
            Self::ContentLength(codec) => codec.encode(item, dst),
        }
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

/// Locate the blank line ending a header block.
///
/// Returns `(header_len, block_len)`: the header text length and the length
/// including the terminator (`\r\n\r\n` or `\n\n`).
fn find_header_end(src: &[u8]) -> Option<(usize, usize)> {
    let crlf = src.windows(4).position(|w| w == b"\r\n\r\n");
    let lf = src.windows(2).position(|w| w == b"\n\n");
    match (crlf, lf) {
        (Some(c), Some(l)) if l < c => Some((l, l + 2)),
        (Some(c), _) => Some((c, c + 4)),
        (None, Some(l)) => Some((l, l + 2)),
        (None, None) => None,
    }
}

/// Extract the `Content-Length` value from a header block.
fn parse_content_length(block: &[u8]) -> std::result::Result<usize, String> {
    let text = std::str::from_utf8(block).map_err(|e| format!("invalid header encoding: {e}"))?;
    let mut length = None;
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(format!("invalid header line: {}", line.trim()));
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let parsed = value
                .trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid content-length: {}", value.trim()))?;
            length = Some(parsed);
        }
    }
    length.ok_or_else(|| "missing content-length header".to_owned())
}
