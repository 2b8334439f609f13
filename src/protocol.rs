/*
 * Copyright 2020 Joyent, Inc.
 */

//! Persistent connection framing.
//!
//! Every frame is `u16 version || u32 length || length bytes`. The version is
//! not counted by the length. The frame body begins with the `u16` message
//! type followed by the payload packed for that version.

use std::error::Error as StdError;
use std::fmt;
use std::io::{Error, ErrorKind};

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::msg::{Message, MsgBody, MsgType};
use crate::pack::{Buffer, UnpackError};

pub const PROTOCOL_VERSION_CURRENT: u16 = 0x2600;
pub const PROTOCOL_VERSION_PREV: u16 = 0x2500;
pub const PROTOCOL_VERSION_MIN: u16 = 0x2400;

pub const FRAME_HEADER_SZ: usize = 6;
pub const DEFAULT_MAX_FRAME_SZ: usize = 16 * 1024 * 1024;

pub const PERSIST_FLAG_NONE: u16 = 0x0000;
pub const PERSIST_FLAG_DBD: u16 = 0x0001;
pub const PERSIST_FLAG_RECONNECT: u16 = 0x0002;
pub const PERSIST_FLAG_SUPPRESS_ERR: u16 = 0x0010;
/// Forces every privilege predicate to false for the connection.
pub const PERSIST_FLAG_DROP_PRIV: u16 = 0x0040;

/// One frame as read from or written to a persistent connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub version: u16,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameError {
    /// The declared length exceeds the configured maximum.
    InsaneLength { length: usize, limit: usize },
    /// The body is too short to hold a message type.
    MissingType { length: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::InsaneLength { length, limit } => write!(
                f,
                "insane message length {} (limit {})",
                length, limit
            ),
            FrameError::MissingType { length } => {
                write!(f, "frame of {} bytes has no message type", length)
            }
        }
    }
}

impl StdError for FrameError {}

impl From<FrameError> for Error {
    fn from(error: FrameError) -> Self {
        Error::new(ErrorKind::InvalidData, error)
    }
}

/// Failure to turn a frame body into a `Message`.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// The leading message type is not one this daemon knows. The frame
    /// cannot be answered.
    UnknownType(u16),
    /// The message type is known but its payload is malformed.
    Body(MsgType, UnpackError),
    Frame(FrameError),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownType(t) => write!(f, "unknown message type {}", t),
            DecodeError::Body(t, e) => {
                write!(f, "failed to unpack {}: {}", t.as_str(), e)
            }
            DecodeError::Frame(e) => write!(f, "{}", e),
        }
    }
}

impl StdError for DecodeError {}

impl From<DecodeError> for Error {
    fn from(error: DecodeError) -> Self {
        Error::new(ErrorKind::InvalidData, error)
    }
}

/// Pack `body` into a frame for `version`.
pub fn encode_message(body: &MsgBody, version: u16) -> Frame {
    let mut buf = Buffer::new();
    buf.pack_u16(body.msg_type() as u16);
    body.pack(&mut buf, version);
    Frame {
        version,
        body: buf.freeze(),
    }
}

/// Unpack the body of `frame` using `version` for the payload.
pub fn decode_message(frame: &Frame, version: u16) -> Result<Message, DecodeError> {
    decode_body(&frame.body, version)
}

/// Unpack `u16 msg_type || payload`. Used for frame bodies and for the inner
/// buffers of a multi-message.
pub fn decode_body(body: &[u8], version: u16) -> Result<Message, DecodeError> {
    if body.len() < 2 {
        return Err(DecodeError::Frame(FrameError::MissingType {
            length: body.len(),
        }));
    }
    let mut buf = Buffer::from_bytes(body);
    let raw_type = buf
        .unpack_u16()
        .map_err(|_| DecodeError::UnknownType(0))?;
    let msg_type =
        MsgType::from_u16(raw_type).ok_or(DecodeError::UnknownType(raw_type))?;
    let body = MsgBody::unpack(msg_type, &mut buf, version)
        .map_err(|e| DecodeError::Body(msg_type, e))?;
    Ok(Message { version, body })
}

/// Pack a message type and body without the frame header, as carried inside
/// `SendMultMsg` and `ResponseMultMsg`.
pub fn encode_body(body: &MsgBody, version: u16) -> Vec<u8> {
    let mut buf = Buffer::new();
    buf.pack_u16(body.msg_type() as u16);
    body.pack(&mut buf, version);
    buf.as_slice().to_vec()
}

pub struct PersistCodec {
    max_frame: usize,
}

impl PersistCodec {
    pub fn new(max_frame: usize) -> PersistCodec {
        PersistCodec { max_frame }
    }
}

impl Default for PersistCodec {
    fn default() -> Self {
        PersistCodec::new(DEFAULT_MAX_FRAME_SZ)
    }
}

impl Decoder for PersistCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if buf.len() < FRAME_HEADER_SZ {
            return Ok(None);
        }

        let version = BigEndian::read_u16(&buf[0..2]);
        let length = BigEndian::read_u32(&buf[2..6]) as usize;
        if length > self.max_frame || length > i32::max_value() as usize {
            return Err(FrameError::InsaneLength {
                length,
                limit: self.max_frame,
            }
            .into());
        }

        if buf.len() < FRAME_HEADER_SZ + length {
            buf.reserve(FRAME_HEADER_SZ + length - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SZ);
        let body = buf.split_to(length).freeze();
        Ok(Some(Frame { version, body }))
    }
}

impl Encoder<Frame> for PersistCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, buf: &mut BytesMut) -> Result<(), Error> {
        if item.body.len() > self.max_frame {
            return Err(FrameError::InsaneLength {
                length: item.body.len(),
                limit: self.max_frame,
            }
            .into());
        }
        buf.reserve(FRAME_HEADER_SZ + item.body.len());
        buf.put_u16(item.version);
        buf.put_u32(item.body.len() as u32);
        buf.put_slice(&item.body);
        Ok(())
    }
}
