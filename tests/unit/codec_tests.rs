//! Unit tests for the NDJSON and `Content-Length` frame codecs.
//!
//! Covers:
//! - partial reads are buffered until a frame is complete
//! - several frames in one buffer are yielded one by one
//! - oversized and undecodable frames are rejected without ending the stream
//! - header parsing tolerates case and line-ending variations
//! - encoders produce the exact wire bytes

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use agent_rpc::transport::codec::{
    ContentLengthCodec, Frame, FrameCodec, Framing, NdjsonCodec, MAX_FRAME_BYTES,
};

fn message(text: &str) -> Option<Frame> {
    Some(Frame::Message(text.to_owned()))
}

// ── NDJSON ───────────────────────────────────────────────────────────────────

/// A line that arrives in two pieces is only yielded once its newline lands.
#[test]
fn ndjson_partial_line_is_buffered() {
    let mut codec = NdjsonCodec::default();
    let mut buf = BytesMut::from("{\"method\":\"tool.start\"");

    assert_eq!(codec.decode(&mut buf).unwrap(), None, "no newline yet");

    buf.extend_from_slice(b",\"params\":{}}\n");
    assert_eq!(
        codec.decode(&mut buf).unwrap(),
        message("{\"method\":\"tool.start\",\"params\":{}}"),
        "complete line must be yielded without the newline"
    );
}

/// Two lines delivered in one read come out as two frames.
#[test]
fn ndjson_batched_lines_are_split() {
    let mut codec = NdjsonCodec::default();
    let mut buf = BytesMut::from("{\"id\":1}\n{\"id\":2}\r\n");

    assert_eq!(codec.decode(&mut buf).unwrap(), message("{\"id\":1}"));
    assert_eq!(
        codec.decode(&mut buf).unwrap(),
        message("{\"id\":2}"),
        "trailing carriage return must be stripped"
    );
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
}

/// A line over the limit is rejected and the following line still decodes.
#[test]
fn ndjson_oversized_line_is_rejected_then_recovers() {
    let mut codec = NdjsonCodec::new(16);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&[b'x'; 40]);
    buf.extend_from_slice(b"\n{\"id\":7}\n");

    let mut frames = Vec::new();
    while let Some(frame) = codec.decode(&mut buf).unwrap() {
        frames.push(frame);
    }

    assert!(
        matches!(frames.first(), Some(Frame::Rejected(reason)) if reason.contains("line too long")),
        "first frame must be rejected, got {frames:?}"
    );
    assert_eq!(frames.last(), Some(&Frame::Message("{\"id\":7}".into())));
}

/// Invalid UTF-8 on a line is reported as a rejected frame, not an error.
#[test]
fn ndjson_invalid_utf8_is_rejected() {
    let mut codec = NdjsonCodec::default();
    let mut buf = BytesMut::from(&b"\xff\xfe\n"[..]);

    let frame = codec.decode(&mut buf).expect("must not be a stream error");
    assert!(matches!(frame, Some(Frame::Rejected(_))), "got {frame:?}");
}

/// A final line without a newline is still delivered at end of stream.
#[test]
fn ndjson_final_line_without_newline_is_delivered_at_eof() {
    let mut codec = NdjsonCodec::default();
    let mut buf = BytesMut::from("{\"id\":3}");

    assert_eq!(codec.decode_eof(&mut buf).unwrap(), message("{\"id\":3}"));
}

/// The encoder appends exactly one newline.
#[test]
fn ndjson_encoder_appends_newline() {
    let mut codec = NdjsonCodec::default();
    let mut dst = BytesMut::new();

    codec.encode("{\"id\":1}".to_owned(), &mut dst).unwrap();

    assert_eq!(&dst[..], b"{\"id\":1}\n");
}

// ── Content-Length ───────────────────────────────────────────────────────────

/// A CRLF-framed message split across header and body reads decodes once.
#[test]
fn content_length_split_frame_is_buffered() {
    let mut codec = ContentLengthCodec::default();
    let mut buf = BytesMut::from("Content-Length: 8\r\n");

    assert_eq!(codec.decode(&mut buf).unwrap(), None, "header incomplete");

    buf.extend_from_slice(b"\r\n{\"id\"");
    assert_eq!(codec.decode(&mut buf).unwrap(), None, "body incomplete");

    buf.extend_from_slice(b":1}");
    assert_eq!(codec.decode(&mut buf).unwrap(), message("{\"id\":1}"));
    assert!(buf.is_empty(), "no bytes may be left behind");
}

/// Header names are case-insensitive, bare LF is accepted and extra headers
/// are ignored.
#[test]
fn content_length_accepts_header_variations() {
    let mut codec = ContentLengthCodec::default();
    let mut buf = BytesMut::from(
        "content-length: 2\n\n{}Content-Type: application/json\r\nCONTENT-LENGTH: 4\r\n\r\nnull",
    );

    assert_eq!(codec.decode(&mut buf).unwrap(), message("{}"));
    assert_eq!(codec.decode(&mut buf).unwrap(), message("null"));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);
}

/// An oversized body is skipped in full and the next frame decodes.
#[test]
fn content_length_oversized_body_is_discarded() {
    let mut codec = ContentLengthCodec::new(4);
    let mut buf = BytesMut::from("Content-Length: 10\r\n\r\n0123456789Content-Length: 2\r\n\r\n[]");

    let first = codec.decode(&mut buf).unwrap();
    assert!(
        matches!(first, Some(Frame::Rejected(ref reason)) if reason.contains("frame too large")),
        "got {first:?}"
    );
    assert_eq!(codec.decode(&mut buf).unwrap(), message("[]"));
}

/// An oversized body arriving over several reads is discarded across them.
#[test]
fn content_length_discard_spans_reads() {
    let mut codec = ContentLengthCodec::new(4);
    let mut buf = BytesMut::from("Content-Length: 6\r\n\r\nabc");

    assert!(matches!(codec.decode(&mut buf).unwrap(), Some(Frame::Rejected(_))));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);

    buf.extend_from_slice(b"defContent-Length: 1\r\n\r\n1");
    assert_eq!(codec.decode(&mut buf).unwrap(), message("1"));
}

/// A header block without `Content-Length` is rejected.
#[test]
fn content_length_missing_header_is_rejected() {
    let mut codec = ContentLengthCodec::default();
    let mut buf = BytesMut::from("Content-Type: application/json\r\n\r\n");

    let frame = codec.decode(&mut buf).unwrap();
    assert!(
        matches!(frame, Some(Frame::Rejected(ref reason)) if reason.contains("missing content-length")),
        "got {frame:?}"
    );
}

/// End of stream in the middle of a body yields a rejection, not a hang.
#[test]
fn content_length_eof_inside_frame_is_rejected() {
    let mut codec = ContentLengthCodec::default();
    let mut buf = BytesMut::from("Content-Length: 50\r\n\r\n{\"partial\"");

    let frame = codec.decode_eof(&mut buf).unwrap();
    assert!(
        matches!(frame, Some(Frame::Rejected(ref reason)) if reason.contains("stream ended")),
        "got {frame:?}"
    );
    assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
}

/// The encoder writes the byte length of the body, not its char count.
#[test]
fn content_length_encoder_counts_bytes() {
    let mut codec = ContentLengthCodec::default();
    let mut dst = BytesMut::new();

    codec.encode("\"é\"".to_owned(), &mut dst).unwrap();

    assert_eq!(&dst[..], "Content-Length: 4\r\n\r\n\"é\"".as_bytes());
}

// ── Runtime selection ────────────────────────────────────────────────────────

/// `FrameCodec` delegates to the codec named by its framing.
#[test]
fn frame_codec_follows_framing() {
    let mut ndjson = FrameCodec::new(Framing::Ndjson, MAX_FRAME_BYTES);
    let mut lsp = FrameCodec::new(Framing::ContentLength, MAX_FRAME_BYTES);
    let mut a = BytesMut::new();
    let mut b = BytesMut::new();

    ndjson.encode("{}".to_owned(), &mut a).unwrap();
    lsp.encode("{}".to_owned(), &mut b).unwrap();

    assert_eq!(&a[..], b"{}\n");
    assert_eq!(&b[..], b"Content-Length: 2\r\n\r\n{}");
    assert_eq!(lsp.decode(&mut b).unwrap(), message("{}"));
}
