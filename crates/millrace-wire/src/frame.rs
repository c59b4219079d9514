// Length-prefixed frame codec and the streaming parser that feeds it.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::document::{Document, Value, decode_field};
use crate::{Error, LEN_PREFIX, Result};

/// Reserved field name that carries the frame kind as the record's first
/// field.
const KIND_FIELD: &str = "frame";

/// Encode a frame: big-endian total length (including itself) followed by
/// the record, whose first field is the frame kind.
///
/// ```
/// use millrace_wire::{Document, encode_frame, decode_frame};
///
/// let wire = encode_frame("PING", &Document::new());
/// let (kind, body) = decode_frame(wire.slice(4..)).expect("decode");
/// assert_eq!(kind, "PING");
/// assert!(body.is_empty());
/// ```
pub fn encode_frame(kind: &str, body: &Document) -> Bytes {
    let record = Document::new().put(KIND_FIELD, kind);
    let mut buf = BytesMut::new();
    buf.put_u32(0);
    // First the kind field, then the body fields, sharing one end tag.
    let mut record_bytes = BytesMut::from(&record.to_bytes()[..]);
    record_bytes.truncate(record_bytes.len() - 1);
    buf.put_slice(&record_bytes);
    buf.put_slice(&body.to_bytes());
    let total = buf.len() as u32;
    buf[0..LEN_PREFIX].copy_from_slice(&total.to_be_bytes());
    buf.freeze()
}

/// Decode a record payload (the bytes after the length prefix) into its
/// frame kind and body.
pub fn decode_frame(mut payload: Bytes) -> Result<(String, Document)> {
    let kind = match decode_field(&mut payload)? {
        Some((name, Value::Str(kind))) if name == KIND_FIELD => kind,
        _ => return Err(Error::MissingKind),
    };
    let body = Document::decode(&mut payload)?;
    Ok((kind, body))
}

/// Streaming frame parser: accumulate bytes, emit complete record payloads.
///
/// Purely byte-driven per-connection state. Feeding it never blocks; a
/// malformed or oversized length is an error the caller must treat as fatal
/// to the connection.
#[derive(Debug)]
pub struct FrameParser {
    buf: BytesMut,
    max_frame_bytes: usize,
}

impl FrameParser {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_bytes,
        }
    }

    /// Append raw bytes read off the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Yield the next complete record payload, with the length prefix
    /// stripped, or `None` until enough bytes have arrived.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
            as usize;
        if length < LEN_PREFIX {
            return Err(Error::FrameTooShort(length));
        }
        if length > self.max_frame_bytes {
            return Err(Error::FrameTooLarge {
                length,
                max: self.max_frame_bytes,
            });
        }
        if self.buf.len() < length {
            return Ok(None);
        }
        let mut frame = self.buf.split_to(length).freeze();
        frame.advance(LEN_PREFIX);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let body = Document::new().put("channel", "orders").put("ok", true);
        let wire = encode_frame("PUBLISH", &body);
        let mut parser = FrameParser::new(1024);
        parser.extend(&wire);
        let payload = parser.next_frame().expect("parse").expect("complete");
        let (kind, decoded) = decode_frame(payload).expect("decode");
        assert_eq!(kind, "PUBLISH");
        assert_eq!(decoded, body);
    }

    #[test]
    fn parser_handles_byte_at_a_time_delivery() {
        let wire = encode_frame("PING", &Document::new());
        let mut parser = FrameParser::new(1024);
        for (i, byte) in wire.iter().enumerate() {
            parser.extend(std::slice::from_ref(byte));
            let frame = parser.next_frame().expect("parse");
            if i + 1 < wire.len() {
                assert!(frame.is_none());
            } else {
                assert!(frame.is_some());
            }
        }
    }

    #[test]
    fn parser_emits_back_to_back_frames() {
        let first = encode_frame("PING", &Document::new());
        let second = encode_frame("CONNECT", &Document::new());
        let mut parser = FrameParser::new(1024);
        parser.extend(&first);
        parser.extend(&second);
        let (kind, _) = decode_frame(parser.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(kind, "PING");
        let (kind, _) = decode_frame(parser.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(kind, "CONNECT");
        assert!(parser.next_frame().unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_fatal() {
        let mut parser = FrameParser::new(16);
        parser.extend(&1024u32.to_be_bytes());
        let err = parser.next_frame().expect_err("too large");
        assert!(matches!(err, Error::FrameTooLarge { length: 1024, .. }));
    }

    #[test]
    fn undersized_length_is_fatal() {
        let mut parser = FrameParser::new(16);
        parser.extend(&2u32.to_be_bytes());
        let err = parser.next_frame().expect_err("too short");
        assert!(matches!(err, Error::FrameTooShort(2)));
    }

    #[test]
    fn record_without_kind_is_rejected() {
        let body = Document::new().put("ok", true);
        let err = decode_frame(body.to_bytes()).expect_err("no kind");
        assert!(matches!(err, Error::MissingKind));
    }
}
