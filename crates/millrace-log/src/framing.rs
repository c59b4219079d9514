// Record framing inside a chunk: `[crc32][length LE][payload]`.
//
// The resolver's skip path reads only the length; the checksum is verified
// whenever a record is actually read back.
use std::fs::File;
use std::os::unix::fs::FileExt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::layout::FRAME_SIZE;
use crate::{LogError, Result};

/// Frame a record payload for appending.
pub fn encode_record_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_SIZE as usize + payload.len());
    buf.put_u32_le(crc32fast::hash(payload));
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Read the record frame at `pos`, verifying its checksum.
///
/// Returns the payload and the position of the next record, or `None` at
/// the end of the records (zero length or too few bytes left for framing).
pub fn read_record_frame(
    file: &File,
    file_label: &str,
    size: u64,
    pos: u64,
) -> Result<Option<(Bytes, u64)>> {
    if size.saturating_sub(pos) < FRAME_SIZE {
        return Ok(None);
    }
    let mut framing = [0u8; FRAME_SIZE as usize];
    file.read_exact_at(&mut framing, pos)?;
    let checksum = u32::from_le_bytes(framing[0..4].try_into().unwrap_or_default());
    let length = u32::from_le_bytes(framing[4..8].try_into().unwrap_or_default()) as u64;
    if length == 0 {
        return Ok(None);
    }
    if pos + FRAME_SIZE + length > size {
        // A record can never claim to extend past its pre-allocated chunk.
        return Err(LogError::Corruption {
            file: file_label.to_string(),
            pos,
        });
    }
    let mut payload = vec![0u8; length as usize];
    file.read_exact_at(&mut payload, pos + FRAME_SIZE)?;
    if crc32fast::hash(&payload) != checksum {
        return Err(LogError::Corruption {
            file: file_label.to_string(),
            pos,
        });
    }
    Ok(Some((Bytes::from(payload), pos + FRAME_SIZE + length)))
}
