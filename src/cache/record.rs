//! On-disk record layout
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬───────────┬─────────┬───────────┐
//! │ magic u32│ crc32c   │ key_len  │ value_len │   key   │   value   │
//! │          │ u32      │ u32      │ u32       │         │           │
//! └──────────┴──────────┴──────────┴───────────┴─────────┴───────────┘
//! ```
//!
//! All integers are little-endian. The checksum covers both lengths, the
//! key and the value.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Record header magic
pub const RECORD_MAGIC: u32 = 0xB10C_CA5E;

/// Size of the fixed record header
pub const RECORD_HEADER_SIZE: usize = 16;

/// Largest key accepted by the record format
pub const MAX_KEY_SIZE: usize = 64 * 1024;

/// Largest value the 32-bit length field can describe
pub const MAX_VALUE_SIZE: usize = u32::MAX as usize;

/// Total on-disk size of a record
#[inline]
pub fn encoded_len(key_len: usize, value_len: usize) -> usize {
    RECORD_HEADER_SIZE + key_len + value_len
}

fn checksum(key: &[u8], value: &[u8]) -> u32 {
    let mut lens = [0u8; 8];
    lens[..4].copy_from_slice(&(key.len() as u32).to_le_bytes());
    lens[4..].copy_from_slice(&(value.len() as u32).to_le_bytes());
    let crc = crc32c::crc32c(&lens);
    let crc = crc32c::crc32c_append(crc, key);
    crc32c::crc32c_append(crc, value)
}

/// Encode a record into a fresh buffer.
///
/// Lengths must be within `MAX_KEY_SIZE` and `MAX_VALUE_SIZE`.
pub fn encode(key: &[u8], value: &[u8]) -> Bytes {
    debug_assert!(key.len() <= MAX_KEY_SIZE && value.len() <= MAX_VALUE_SIZE);
    let mut buf = BytesMut::with_capacity(encoded_len(key.len(), value.len()));
    buf.put_u32_le(RECORD_MAGIC);
    buf.put_u32_le(checksum(key, value));
    buf.put_u32_le(key.len() as u32);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(key);
    buf.put_slice(value);
    buf.freeze()
}

/// Parsed record header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub checksum: u32,
    pub key_len: usize,
    pub value_len: usize,
}

impl RecordHeader {
    /// Parse a header; the slice must hold at least `RECORD_HEADER_SIZE` bytes
    pub fn parse(mut src: &[u8]) -> Result<Self, DecodeError> {
        if src.len() < RECORD_HEADER_SIZE {
            return Err(DecodeError::Truncated);
        }
        if src.get_u32_le() != RECORD_MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let checksum = src.get_u32_le();
        let key_len = src.get_u32_le() as usize;
        let value_len = src.get_u32_le() as usize;
        if key_len > MAX_KEY_SIZE {
            return Err(DecodeError::BadLength);
        }
        Ok(Self {
            checksum,
            key_len,
            value_len,
        })
    }

    pub fn record_len(&self) -> usize {
        encoded_len(self.key_len, self.value_len)
    }
}

/// A decoded record, borrowing from the source bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
}

/// Record validation failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    Truncated,
    BadMagic,
    BadLength,
    ChecksumMismatch,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Truncated => write!(f, "record truncated"),
            DecodeError::BadMagic => write!(f, "bad record magic"),
            DecodeError::BadLength => write!(f, "record length out of range"),
            DecodeError::ChecksumMismatch => write!(f, "checksum mismatch"),
        }
    }
}

/// Decode the record at the start of `src`
pub fn decode(src: &Bytes) -> Result<Record, DecodeError> {
    let header = RecordHeader::parse(src)?;
    if src.len() < header.record_len() {
        return Err(DecodeError::Truncated);
    }
    let key_start = RECORD_HEADER_SIZE;
    let value_start = key_start + header.key_len;
    let key = src.slice(key_start..value_start);
    let value = src.slice(value_start..value_start + header.value_len);
    if checksum(&key, &value) != header.checksum {
        return Err(DecodeError::ChecksumMismatch);
    }
    Ok(Record { key, value })
}
