// Self-describing record encoding: named, typed fields.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

const TAG_END: u8 = 0x00;
const TAG_STR: u8 = 0x01;
const TAG_I32: u8 = 0x02;
const TAG_I64: u8 = 0x03;
const TAG_BOOL: u8 = 0x04;
const TAG_DOC: u8 = 0x05;
const TAG_BIN: u8 = 0x06;

/// A single typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    I32(i32),
    I64(i64),
    Bool(bool),
    Doc(Document),
    Bin(Bytes),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Document> for Value {
    fn from(value: Document) -> Self {
        Value::Doc(value)
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Bin(value)
    }
}

/// An ordered set of named fields.
///
/// ```
/// use millrace_wire::Document;
///
/// let doc = Document::new().put("channel", "orders").put("count", 3i32);
/// assert_eq!(doc.get_str("channel"), Some("orders"));
/// assert_eq!(doc.get_i32("count"), Some(3));
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Builder-style insert; later fields with the same name shadow earlier
    /// ones on lookup.
    pub fn put(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(Value::Str(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        match self.get(name) {
            Some(Value::I32(value)) => Some(*value),
            _ => None,
        }
    }

    /// Integer fields widen: an i32 on the wire satisfies an i64 lookup.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(Value::I64(value)) => Some(*value),
            Some(Value::I32(value)) => Some(i64::from(*value)),
            _ => None,
        }
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(Value::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_doc(&self, name: &str) -> Option<&Document> {
        match self.get(name) {
            Some(Value::Doc(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_bin(&self, name: &str) -> Option<&Bytes> {
        match self.get(name) {
            Some(Value::Bin(value)) => Some(value),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Subset equality: every field of `self` must be present in `other`
    /// with an equal value. Nested documents compare recursively the same
    /// way.
    pub fn subset_of(&self, other: &Document) -> bool {
        self.fields.iter().all(|(name, value)| {
            match (value, other.get(name)) {
                (Value::Doc(inner), Some(Value::Doc(theirs))) => inner.subset_of(theirs),
                (mine, Some(theirs)) => mine == theirs,
                (_, None) => false,
            }
        })
    }

    /// Encode all fields followed by the end tag.
    pub fn encode(&self, buf: &mut BytesMut) {
        for (name, value) in &self.fields {
            encode_field(buf, name, value);
        }
        buf.put_u8(TAG_END);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a full record, consuming through its end tag.
    pub fn decode(buf: &mut Bytes) -> Result<Document> {
        let mut doc = Document::new();
        loop {
            match decode_field(buf)? {
                Some((name, value)) => doc.insert(name, value),
                None => return Ok(doc),
            }
        }
    }
}

fn encode_field(buf: &mut BytesMut, name: &str, value: &Value) {
    let tag = match value {
        Value::Str(_) => TAG_STR,
        Value::I32(_) => TAG_I32,
        Value::I64(_) => TAG_I64,
        Value::Bool(_) => TAG_BOOL,
        Value::Doc(_) => TAG_DOC,
        Value::Bin(_) => TAG_BIN,
    };
    buf.put_u8(tag);
    buf.put_u16(name.len() as u16);
    buf.put_slice(name.as_bytes());
    match value {
        Value::Str(value) => {
            buf.put_u32(value.len() as u32);
            buf.put_slice(value.as_bytes());
        }
        Value::I32(value) => buf.put_i32(*value),
        Value::I64(value) => buf.put_i64(*value),
        Value::Bool(value) => buf.put_u8(u8::from(*value)),
        Value::Doc(value) => {
            let encoded = value.to_bytes();
            buf.put_u32(encoded.len() as u32);
            buf.put_slice(&encoded);
        }
        Value::Bin(value) => {
            buf.put_u32(value.len() as u32);
            buf.put_slice(value);
        }
    }
}

/// Decode one field, or `None` on the end tag.
pub(crate) fn decode_field(buf: &mut Bytes) -> Result<Option<(String, Value)>> {
    if buf.remaining() < 1 {
        return Err(Error::Incomplete);
    }
    let tag = buf.get_u8();
    if tag == TAG_END {
        return Ok(None);
    }
    if buf.remaining() < 2 {
        return Err(Error::Incomplete);
    }
    let name_len = buf.get_u16() as usize;
    if buf.remaining() < name_len {
        return Err(Error::Incomplete);
    }
    let name = std::str::from_utf8(&buf.slice(0..name_len))
        .map_err(|_| Error::BadFieldName)?
        .to_string();
    buf.advance(name_len);
    let value = match tag {
        TAG_STR => {
            let bytes = take_len_prefixed(buf)?;
            let value = std::str::from_utf8(&bytes).map_err(|_| Error::BadString)?;
            Value::Str(value.to_string())
        }
        TAG_I32 => {
            if buf.remaining() < 4 {
                return Err(Error::Incomplete);
            }
            Value::I32(buf.get_i32())
        }
        TAG_I64 => {
            if buf.remaining() < 8 {
                return Err(Error::Incomplete);
            }
            Value::I64(buf.get_i64())
        }
        TAG_BOOL => {
            if buf.remaining() < 1 {
                return Err(Error::Incomplete);
            }
            Value::Bool(buf.get_u8() != 0)
        }
        TAG_DOC => {
            let mut bytes = take_len_prefixed(buf)?;
            Value::Doc(Document::decode(&mut bytes)?)
        }
        TAG_BIN => Value::Bin(take_len_prefixed(buf)?),
        other => return Err(Error::UnknownTag(other)),
    };
    Ok(Some((name, value)))
}

fn take_len_prefixed(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(Error::Incomplete);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(Error::Incomplete);
    }
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_value_kinds() {
        let doc = Document::new()
            .put("name", "orders")
            .put("small", 7i32)
            .put("large", 1_234_567_890_123i64)
            .put("flag", true)
            .put("nested", Document::new().put("id", 42i32))
            .put("raw", Bytes::from_static(b"\x00\x01\x02"));
        let mut encoded = doc.to_bytes();
        let decoded = Document::decode(&mut encoded).expect("decode");
        assert_eq!(decoded, doc);
        assert_eq!(decoded.get_str("name"), Some("orders"));
        assert_eq!(decoded.get_i32("small"), Some(7));
        assert_eq!(decoded.get_i64("large"), Some(1_234_567_890_123));
        assert_eq!(decoded.get_bool("flag"), Some(true));
        assert_eq!(
            decoded.get_doc("nested").and_then(|d| d.get_i32("id")),
            Some(42)
        );
        assert_eq!(decoded.get_bin("raw"), Some(&Bytes::from_static(b"\x00\x01\x02")));
    }

    #[test]
    fn i32_widens_to_i64_lookup() {
        let doc = Document::new().put("pos", 9i32);
        assert_eq!(doc.get_i64("pos"), Some(9));
        assert_eq!(doc.get_i32("pos"), Some(9));
    }

    #[test]
    fn missing_and_mistyped_fields_return_none() {
        let doc = Document::new().put("channel", "orders");
        assert_eq!(doc.get_str("missing"), None);
        assert_eq!(doc.get_i64("channel"), None);
    }

    #[test]
    fn truncated_record_is_incomplete() {
        let doc = Document::new().put("channel", "orders");
        let encoded = doc.to_bytes();
        let mut short = encoded.slice(0..encoded.len() - 3);
        let err = Document::decode(&mut short).expect_err("truncated");
        assert!(matches!(err, Error::Incomplete));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut buf = Bytes::from_static(&[0x7f, 0x00, 0x01, b'x', 0x00]);
        let err = Document::decode(&mut buf).expect_err("unknown tag");
        assert!(matches!(err, Error::UnknownTag(0x7f)));
    }

    #[test]
    fn subset_matching_is_recursive() {
        let event = Document::new()
            .put("type", "order")
            .put("body", Document::new().put("sku", "a1").put("qty", 2i32));
        let matcher = Document::new()
            .put("type", "order")
            .put("body", Document::new().put("sku", "a1"));
        assert!(matcher.subset_of(&event));
        let wrong = Document::new().put("type", "refund");
        assert!(!wrong.subset_of(&event));
    }
}
