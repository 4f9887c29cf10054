//! gRPC-Web wire framing.
//!
//! `tonic-web` already speaks this framing for HTTP/1.1 POST bodies. It has
//! no support for the WebSocket-wrapped `grpc-websockets` sub-protocol the
//! guest endpoint also accepts, so [`crate::mux`] bridges that variant by
//! hand using the encoder/decoder in this module.
//!
//! Frame layout: one byte of flags, four bytes of big-endian length, then
//! that many bytes of payload. The high bit of the flags byte (`0x80`)
//! marks a trailer frame; everything else is a data frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

const TRAILER_FLAG: u8 = 0x80;
const HEADER_LEN: usize = 5;

/// Encodes one gRPC-Web data frame.
pub fn encode_data_frame(payload: &[u8]) -> Bytes {
    encode_frame(0, payload)
}

/// Encodes the trailer frame. `trailers` is rendered as `key: value\r\n`
/// pairs, the format gRPC-Web expects for trailing metadata.
pub fn encode_trailer_frame(trailers: &[(&str, &str)]) -> Bytes {
    let mut body = String::new();
    for (key, value) in trailers {
        body.push_str(key);
        body.push_str(": ");
        body.push_str(value);
        body.push_str("\r\n");
    }
    encode_frame(TRAILER_FLAG, body.as_bytes())
}

fn encode_frame(flags: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(flags);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// One decoded gRPC-Web frame.
pub struct Frame {
    pub is_trailer: bool,
    pub payload: Bytes,
}

/// Incremental decoder for a byte stream that may deliver frames split
/// across arbitrary chunk boundaries (as WebSocket binary messages do).
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pops one complete frame off the front of the buffer, if present.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let flags = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < HEADER_LEN + len {
            return None;
        }
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Some(Frame {
            is_trailer: flags & TRAILER_FLAG != 0,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_data_frame() {
        let encoded = encode_data_frame(b"hello");
        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);
        let frame = decoder.next_frame().expect("frame");
        assert!(!frame.is_trailer);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn marks_trailer_frames_via_high_bit() {
        let encoded = encode_trailer_frame(&[("grpc-status", "0")]);
        let mut decoder = FrameDecoder::new();
        decoder.push(&encoded);
        let frame = decoder.next_frame().expect("frame");
        assert!(frame.is_trailer);
        assert_eq!(&frame.payload[..], b"grpc-status: 0\r\n");
    }

    #[test]
    fn handles_frames_split_across_chunks() {
        let encoded = encode_data_frame(b"chunked payload");
        let mut decoder = FrameDecoder::new();
        for byte in encoded.iter() {
            assert!(decoder.next_frame().is_none());
            decoder.push(&[*byte]);
        }
        let frame = decoder.next_frame().expect("frame");
        assert_eq!(&frame.payload[..], b"chunked payload");
    }

    #[test]
    fn decodes_multiple_frames_queued_in_one_push() {
        let mut combined = Vec::new();
        combined.extend_from_slice(&encode_data_frame(b"one"));
        combined.extend_from_slice(&encode_data_frame(b"two"));
        let mut decoder = FrameDecoder::new();
        decoder.push(&combined);
        assert_eq!(&decoder.next_frame().unwrap().payload[..], b"one");
        assert_eq!(&decoder.next_frame().unwrap().payload[..], b"two");
        assert!(decoder.next_frame().is_none());
    }
}
