// Append-only channel logs: fixed-size pre-allocated chunk files of framed,
// checksummed records, plus the pure coordinate resolver that maps record
// numbers to byte offsets.

pub mod framing;
pub mod layout;
pub mod log;
pub mod registry;

pub use layout::{FileCoord, HEADER_SIZE, FRAME_SIZE};
pub use log::{Log, LogConfig, LogCursor, LogRecord};
pub use registry::LogRegistry;

pub type Result<T> = std::result::Result<T, LogError>;

#[derive(thiserror::Error, Debug)]
pub enum LogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid channel name: {0:?}")]
    BadChannelName(String),
    #[error("unparseable log file name: {0}")]
    BadFileName(String),
    #[error("log files not in expected sequence, can't find {0}")]
    NonContiguous(String),
    #[error("file {file} has unexpected size {actual}, expected {expected}")]
    UnexpectedFileSize {
        file: String,
        expected: u64,
        actual: u64,
    },
    #[error("bad log file header in {0}")]
    BadHeader(String),
    #[error("corrupt record at offset {pos} in file {file}")]
    Corruption { file: String, pos: u64 },
    #[error("record of {size} bytes cannot fit in a chunk of {chunk} bytes")]
    RecordTooLarge { size: u64, chunk: u64 },
    #[error("record payload failed to decode: {0}")]
    Decode(#[from] millrace_wire::Error),
    #[error("log closed")]
    Closed,
}
