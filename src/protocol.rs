//! Header codec for the 24-byte binary protocol header.
//!
//! Layout (all multi-byte integers big-endian):
//!
//! ```text
//! 0      1       2         4          5           6        8          12       16    24
//! +------+-------+---------+----------+-----------+--------+----------+--------+-----+
//! |magic |opcode | key_len |extra_len | data_type | status | body_len | opaque | cas |
//! +------+-------+---------+----------+-----------+--------+----------+--------+-----+
//! ```
//!
//! `body_len` counts extras + key + value together.

use thiserror::Error;

use crate::config::MAX_BODY_LEN;
use crate::constants::{
    HEADER_LEN, OPCODE_GET, OPCODE_SET, REQUEST_MAGIC, RESPONSE_MAGIC, STATUS_INVALID_ARGUMENTS,
    STATUS_KEY_NOT_FOUND, STATUS_NO_ERROR, STATUS_UNKNOWN_COMMAND, STATUS_VALUE_TOO_LARGE,
};

/// Malformed or unsupported request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unexpected magic {0:#04x}")]
    BadMagic(u8),

    #[error("unsupported opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error(
        "body length {body_len} inconsistent with key length {key_len} and extras length {extra_len}"
    )]
    BadLengths {
        body_len: u32,
        key_len: u16,
        extra_len: u8,
    },

    #[error("declared body of {declared} bytes exceeds limit of {limit}")]
    Oversized { declared: usize, limit: usize },
}

impl ProtocolError {
    /// Status to report before closing, if the framing is trustworthy enough to answer.
    pub fn reply_status(&self) -> Option<Status> {
        match self {
            ProtocolError::BadMagic(_) => None,
            ProtocolError::UnknownOpcode(_) => Some(Status::UnknownCommand),
            ProtocolError::BadLengths { .. } => Some(Status::InvalidArguments),
            ProtocolError::Oversized { .. } => Some(Status::ValueTooLarge),
        }
    }
}

/// The two supported operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Fetch: key only, no value payload.
    Get,
    /// Store: extras + key + value.
    Set,
}

impl Opcode {
    pub fn from_u8(raw: u8) -> Result<Self, ProtocolError> {
        match raw {
            OPCODE_GET => Ok(Opcode::Get),
            OPCODE_SET => Ok(Opcode::Set),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Opcode::Get => OPCODE_GET,
            Opcode::Set => OPCODE_SET,
        }
    }
}

/// Response status codes this server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NoError,
    KeyNotFound,
    ValueTooLarge,
    InvalidArguments,
    UnknownCommand,
}

impl Status {
    pub fn to_u16(self) -> u16 {
        match self {
            Status::NoError => STATUS_NO_ERROR,
            Status::KeyNotFound => STATUS_KEY_NOT_FOUND,
            Status::ValueTooLarge => STATUS_VALUE_TOO_LARGE,
            Status::InvalidArguments => STATUS_INVALID_ARGUMENTS,
            Status::UnknownCommand => STATUS_UNKNOWN_COMMAND,
        }
    }

    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            STATUS_NO_ERROR => Some(Status::NoError),
            STATUS_KEY_NOT_FOUND => Some(Status::KeyNotFound),
            STATUS_VALUE_TOO_LARGE => Some(Status::ValueTooLarge),
            STATUS_INVALID_ARGUMENTS => Some(Status::InvalidArguments),
            STATUS_UNKNOWN_COMMAND => Some(Status::UnknownCommand),
            _ => None,
        }
    }
}

/// Decoded protocol header. `status` holds the reserved field on requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extra_len: u8,
    pub data_type: u8,
    pub status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    pub const SIZE: usize = HEADER_LEN;

    /// Request header with the given lengths; `body_len` is derived.
    pub fn request(opcode: Opcode, key_len: u16, extra_len: u8, value_len: u32) -> Self {
        Self {
            magic: REQUEST_MAGIC,
            opcode: opcode.to_u8(),
            key_len,
            extra_len,
            body_len: u32::from(key_len) + u32::from(extra_len) + value_len,
            ..Self::default()
        }
    }

    /// Field-by-field decode with no validation.
    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            magic: buf[0],
            opcode: buf[1],
            key_len: u16::from_be_bytes([buf[2], buf[3]]),
            extra_len: buf[4],
            data_type: buf[5],
            status: u16::from_be_bytes([buf[6], buf[7]]),
            body_len: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        }
    }

    /// Decode a request header, rejecting anything without the request magic.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let header = Self::from_bytes(buf);
        if header.magic != REQUEST_MAGIC {
            return Err(ProtocolError::BadMagic(header.magic));
        }
        Ok(header)
    }

    /// Decode a response header, rejecting anything without the response magic.
    pub fn decode_response(buf: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let header = Self::from_bytes(buf);
        if header.magic != RESPONSE_MAGIC {
            return Err(ProtocolError::BadMagic(header.magic));
        }
        Ok(header)
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        self.encode_into(&mut buf);
        buf
    }

    pub fn encode_into(&self, buf: &mut [u8; HEADER_LEN]) {
        buf[0] = self.magic;
        buf[1] = self.opcode;
        buf[2..4].copy_from_slice(&self.key_len.to_be_bytes());
        buf[4] = self.extra_len;
        buf[5] = self.data_type;
        buf[6..8].copy_from_slice(&self.status.to_be_bytes());
        buf[8..12].copy_from_slice(&self.body_len.to_be_bytes());
        buf[12..16].copy_from_slice(&self.opaque.to_be_bytes());
        buf[16..24].copy_from_slice(&self.cas.to_be_bytes());
    }

    /// Bytes following extras and key.
    ///
    /// # Errors
    /// `BadLengths` if `body_len` is smaller than extras + key.
    pub fn value_len(&self) -> Result<usize, ProtocolError> {
        let prefix = u32::from(self.key_len) + u32::from(self.extra_len);
        self.body_len
            .checked_sub(prefix)
            .map(|v| v as usize)
            .ok_or(ProtocolError::BadLengths {
                body_len: self.body_len,
                key_len: self.key_len,
                extra_len: self.extra_len,
            })
    }

    /// Check a decoded request against the supported subset and return its opcode.
    ///
    /// Every discard segment is bounded by `body_len`, so capping `body_len` at
    /// `MAX_BODY_LEN` keeps each one within the discard scratch.
    pub fn validate_request(&self) -> Result<Opcode, ProtocolError> {
        let opcode = Opcode::from_u8(self.opcode)?;
        let value_len = self.value_len()?;
        if opcode == Opcode::Get && value_len != 0 {
            return Err(ProtocolError::BadLengths {
                body_len: self.body_len,
                key_len: self.key_len,
                extra_len: self.extra_len,
            });
        }
        let declared = self.body_len as usize;
        if declared > MAX_BODY_LEN {
            return Err(ProtocolError::Oversized {
                declared,
                limit: MAX_BODY_LEN,
            });
        }
        Ok(opcode)
    }

    /// Response header answering this request: opcode, opaque and cas echoed.
    pub fn response(&self, status: Status, extra_len: u8, body_len: u32) -> Header {
        Header {
            magic: RESPONSE_MAGIC,
            opcode: self.opcode,
            key_len: 0,
            extra_len,
            data_type: 0,
            status: status.to_u16(),
            body_len,
            opaque: self.opaque,
            cas: self.cas,
        }
    }
}
