//! Replication Wire Framing
//!
//! Frames an index name together with an opaque serialized work queue into a
//! single buffer for cluster transport:
//!
//! ```text
//! [1 byte name length][name bytes][payload bytes]
//! ```
//!
//! There is no version field at this layer; payload compatibility belongs to
//! the work queue serialization. Every function here is pure and borrows its
//! input, so frames can be decoded concurrently from any number of tasks.


use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Maximum index name length, bounded by the single length byte
pub const MAX_INDEX_NAME_LEN: usize = u8::MAX as usize;

/// Error returned when a frame cannot be built
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Index name does not fit in the one-byte length prefix
    IndexNameTooLong(usize),
}

impl fmt::Display for EncodingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IndexNameTooLong(len) => write!(
                f,
                "index name is {} bytes, maximum is {}",
                len, MAX_INDEX_NAME_LEN
            ),
        }
    }
}

impl std::error::Error for EncodingError {}

/// Error returned when a frame cannot be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ends before the declared content
    InsufficientData,
    /// Declared message length is shorter than its own header
    InvalidLength,
    /// Index name bytes are not valid UTF-8
    InvalidUtf8,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidLength => write!(f, "message length shorter than frame header"),
            Self::InvalidUtf8 => write!(f, "index name is not valid UTF-8"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Build a frame from an index name and a serialized work queue
pub fn encode(index_name: &str, payload: &[u8]) -> Result<Bytes, EncodingError> {
    let name = index_name.as_bytes();
    if name.len() > MAX_INDEX_NAME_LEN {
        return Err(EncodingError::IndexNameTooLong(name.len()));
    }

    let mut buf = BytesMut::with_capacity(1 + name.len() + payload.len());
    buf.put_u8(name.len() as u8);
    buf.put_slice(name);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read the index name of the frame starting at `offset`
pub fn decode_index_name(offset: usize, buf: &[u8]) -> Result<&str, DecodeError> {
    let name_len = *buf.get(offset).ok_or(DecodeError::InsufficientData)? as usize;
    let start = offset + 1;
    let name = buf
        .get(start..start + name_len)
        .ok_or(DecodeError::InsufficientData)?;
    std::str::from_utf8(name).map_err(|_| DecodeError::InvalidUtf8)
}

/// Read the payload of the frame starting at `offset`
///
/// `total_len` is the length of the whole frame (header included); the
/// returned slice ends there even if `buf` carries trailing bytes.
pub fn decode_payload(offset: usize, total_len: usize, buf: &[u8]) -> Result<&[u8], DecodeError> {
    let name_len = *buf.get(offset).ok_or(DecodeError::InsufficientData)? as usize;
    let header_len = 1 + name_len;
    if total_len < header_len {
        return Err(DecodeError::InvalidLength);
    }
    buf.get(offset + header_len..offset + total_len)
        .ok_or(DecodeError::InsufficientData)
}

/// A decoded frame borrowing from the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFrame<'a> {
    pub index_name: &'a str,
    pub payload: &'a [u8],
}

impl<'a> WireFrame<'a> {
    /// Decode a buffer holding exactly one frame
    pub fn decode(buf: &'a [u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            index_name: decode_index_name(0, buf)?,
            payload: decode_payload(0, buf.len(), buf)?,
        })
    }
}
