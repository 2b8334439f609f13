// Copyright 2020 Joyent, Inc.

//! Length-prefixed wire buffer.
//!
//! A `Buffer` is appended to at its end and extracted from at its cursor.
//! All integers are big-endian. Strings are encoded as a `u32` length that
//! includes a trailing NUL byte followed by the bytes and the NUL; a length of
//! zero encodes the null string.

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::str;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

/// Upper bound on any counted array or string extracted from the wire.
pub const MAX_ARRAY_LEN: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub enum UnpackError {
    /// Fewer bytes remain than the field requires.
    ShortBuffer { needed: usize, remaining: usize },
    /// A string was not NUL terminated.
    Unterminated,
    /// A string contained invalid UTF-8.
    Utf8,
    /// A count or length exceeded `MAX_ARRAY_LEN`.
    InsaneCount(u32),
    /// A value was outside of the range its field allows.
    BadValue { field: &'static str, value: u64 },
    /// A required string was null.
    NullString(&'static str),
}

impl fmt::Display for UnpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnpackError::ShortBuffer { needed, remaining } => write!(
                f,
                "short buffer: needed {} bytes, {} remaining",
                needed, remaining
            ),
            UnpackError::Unterminated => {
                write!(f, "string is not NUL terminated")
            }
            UnpackError::Utf8 => write!(f, "string is not valid UTF-8"),
            UnpackError::InsaneCount(count) => {
                write!(f, "insane element count {}", count)
            }
            UnpackError::BadValue { field, value } => {
                write!(f, "invalid value {} for {}", value, field)
            }
            UnpackError::NullString(field) => {
                write!(f, "null string for required field {}", field)
            }
        }
    }
}

impl StdError for UnpackError {}

impl From<UnpackError> for io::Error {
    fn from(error: UnpackError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, error)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Buffer {
    data: BytesMut,
    processed: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: BytesMut::with_capacity(capacity),
            processed: 0,
        }
    }

    /// Wrap received bytes for extraction, cursor at the start.
    pub fn from_bytes(data: &[u8]) -> Buffer {
        Buffer {
            data: BytesMut::from(data),
            processed: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.processed
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn freeze(self) -> Bytes {
        self.data.freeze()
    }

    fn take(&mut self, needed: usize) -> Result<&[u8], UnpackError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(UnpackError::ShortBuffer { needed, remaining });
        }
        let start = self.processed;
        self.processed += needed;
        Ok(&self.data[start..start + needed])
    }

    pub fn pack_u8(&mut self, val: u8) {
        self.data.put_u8(val);
    }

    pub fn pack_bool(&mut self, val: bool) {
        self.data.put_u8(val as u8);
    }

    pub fn pack_u16(&mut self, val: u16) {
        self.data.put_u16(val);
    }

    pub fn pack_u32(&mut self, val: u32) {
        self.data.put_u32(val);
    }

    pub fn pack_i32(&mut self, val: i32) {
        self.data.put_u32(val as u32);
    }

    pub fn pack_u64(&mut self, val: u64) {
        self.data.put_u64(val);
    }

    pub fn pack_time(&mut self, val: i64) {
        self.data.put_u64(val as u64);
    }

    pub fn pack_str(&mut self, val: &str) {
        self.data.put_u32(val.len() as u32 + 1);
        self.data.put_slice(val.as_bytes());
        self.data.put_u8(0);
    }

    pub fn pack_str_or_null(&mut self, val: Option<&str>) {
        match val {
            Some(s) => self.pack_str(s),
            None => self.data.put_u32(0),
        }
    }

    pub fn pack_str_array(&mut self, vals: &[String]) {
        self.data.put_u32(vals.len() as u32);
        for val in vals {
            self.pack_str(val);
        }
    }

    pub fn pack_u32_array(&mut self, vals: &[u32]) {
        self.data.put_u32(vals.len() as u32);
        for val in vals {
            self.data.put_u32(*val);
        }
    }

    pub fn pack_bytes(&mut self, val: &[u8]) {
        self.data.put_u32(val.len() as u32);
        self.data.put_slice(val);
    }

    /// Reserve four bytes for a length written later by `finish_len`.
    pub fn reserve_len(&mut self) -> usize {
        let offset = self.data.len();
        self.data.put_u32(0);
        offset
    }

    /// Overwrite the reservation at `offset` with the number of bytes
    /// appended after it.
    pub fn finish_len(&mut self, offset: usize) {
        let payload = self.data.len() - offset - 4;
        BigEndian::write_u32(&mut self.data[offset..offset + 4], payload as u32);
    }

    pub fn unpack_u8(&mut self) -> Result<u8, UnpackError> {
        Ok(self.take(1)?[0])
    }

    pub fn unpack_bool(&mut self) -> Result<bool, UnpackError> {
        match self.unpack_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(UnpackError::BadValue {
                field: "bool",
                value: u64::from(other),
            }),
        }
    }

    pub fn unpack_u16(&mut self) -> Result<u16, UnpackError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn unpack_u32(&mut self) -> Result<u32, UnpackError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn unpack_i32(&mut self) -> Result<i32, UnpackError> {
        Ok(self.unpack_u32()? as i32)
    }

    pub fn unpack_u64(&mut self) -> Result<u64, UnpackError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn unpack_time(&mut self) -> Result<i64, UnpackError> {
        Ok(self.unpack_u64()? as i64)
    }

    fn unpack_count(&mut self) -> Result<usize, UnpackError> {
        let count = self.unpack_u32()?;
        if count as usize > MAX_ARRAY_LEN {
            return Err(UnpackError::InsaneCount(count));
        }
        Ok(count as usize)
    }

    pub fn unpack_str_or_null(&mut self) -> Result<Option<String>, UnpackError> {
        let len = self.unpack_count()?;
        if len == 0 {
            return Ok(None);
        }
        let raw = self.take(len)?;
        let (nul, body) = raw.split_last().ok_or(UnpackError::Unterminated)?;
        if *nul != 0 {
            return Err(UnpackError::Unterminated);
        }
        str::from_utf8(body)
            .map(|s| Some(s.to_string()))
            .map_err(|_| UnpackError::Utf8)
    }

    /// Extract a string that must not be null.
    pub fn unpack_str(&mut self, field: &'static str) -> Result<String, UnpackError> {
        self.unpack_str_or_null()?
            .ok_or(UnpackError::NullString(field))
    }

    pub fn unpack_str_array(&mut self) -> Result<Vec<String>, UnpackError> {
        let count = self.unpack_count()?;
        let mut vals = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            vals.push(self.unpack_str("array element")?);
        }
        Ok(vals)
    }

    pub fn unpack_u32_array(&mut self) -> Result<Vec<u32>, UnpackError> {
        let count = self.unpack_count()?;
        let mut vals = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            vals.push(self.unpack_u32()?);
        }
        Ok(vals)
    }

    pub fn unpack_bytes(&mut self) -> Result<Vec<u8>, UnpackError> {
        let len = self.unpack_count()?;
        Ok(self.take(len)?.to_vec())
    }
}

/// Typed, version-aware encoding of a wire structure.
///
/// `pack` is total. `unpack` fails with `UnpackError` on any structural
/// violation. Fields introduced in a later protocol version are skipped when
/// packing for an older version and defaulted when unpacking from one.
pub trait Pack: Sized {
    fn pack(&self, buf: &mut Buffer, version: u16);
    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError>;
}

impl<T: Pack> Pack for Vec<T> {
    fn pack(&self, buf: &mut Buffer, version: u16) {
        buf.pack_u32(self.len() as u32);
        for item in self {
            item.pack(buf, version);
        }
    }

    fn unpack(buf: &mut Buffer, version: u16) -> Result<Self, UnpackError> {
        let count = buf.unpack_count()?;
        let mut items = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            items.push(T::unpack(buf, version)?);
        }
        Ok(items)
    }
}
