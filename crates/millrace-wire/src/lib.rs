// Wire format for framing documents on the network.
//
// A frame is a 4-byte big-endian total length (including itself) followed by
// an encoded record whose first field carries the frame kind. Records are
// self-describing: named, typed fields that both sides can walk without a
// schema.

pub mod document;
pub mod frame;

pub use document::{Document, Value};
pub use frame::{FrameParser, decode_frame, encode_frame};

/// Size of the length prefix on every wire frame.
pub const LEN_PREFIX: usize = 4;

/// Default cap on a single frame, matching the server's default.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },
    #[error("frame length {0} is smaller than the length prefix")]
    FrameTooShort(usize),
    #[error("truncated record")]
    Incomplete,
    #[error("unknown field tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("field name is not valid utf-8")]
    BadFieldName,
    #[error("string value is not valid utf-8")]
    BadString,
    #[error("record does not start with a frame kind")]
    MissingKind,
}
