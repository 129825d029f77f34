//! Envelope framing.
//!
//! Every envelope travels as one frame (all integers big-endian):
//!
//! ```text
//! i32      header version
//! [u8; 10] preamble "MESHLINK/1"
//! i32      body length N
//! i32      serializer version
//! [u8; N]  serialized envelope
//! ```
//!
//! The decoder consumes bytes from a [`BytesMut`] that the connection keeps
//! filling in arbitrary chunks. It yields nothing until a whole frame is
//! buffered, and fails as soon as the header version or any preamble byte
//! disagrees, without waiting for the rest of the frame. A decode error is
//! fatal for the connection: there is no resynchronisation.

use crate::serializer::EnvelopeSerializer;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use meshlink_types::{Envelope, MessagingError};
use std::sync::Arc;
use thiserror::Error;

/// Current frame header version.
pub const HEADER_VERSION: i32 = 1;

/// Magic bytes identifying a meshlink frame.
pub const PREAMBLE: [u8; 10] = *b"MESHLINK/1";

/// Bytes preceding the body: version, preamble, length, serializer version.
pub const HEADER_LEN: usize = 4 + PREAMBLE.len() + 4 + 4;

const PREAMBLE_OFFSET: usize = 4;
const LENGTH_OFFSET: usize = PREAMBLE_OFFSET + PREAMBLE.len();
const SERIALIZER_OFFSET: usize = LENGTH_OFFSET + 4;

/// Errors from framing or unframing an envelope.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("preamble mismatch")]
    PreambleMismatch,
    #[error("unsupported header version {0}")]
    UnsupportedHeaderVersion(i32),
    #[error("unsupported serializer version {found} (expected {expected})")]
    UnsupportedSerializerVersion { found: i32, expected: i32 },
    #[error("frame body of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("negative frame length {0}")]
    NegativeLength(i32),
    #[error("malformed envelope: {0}")]
    Serialization(String),
}

impl From<CodecError> for MessagingError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::FrameTooLarge { size, max } => MessagingError::FrameTooLarge { size, max },
            CodecError::Serialization(reason) => MessagingError::Serialization(reason),
            other => MessagingError::ProtocolMismatch(other.to_string()),
        }
    }
}

/// Encoder and decoder for one serializer and frame-size limit.
#[derive(Clone)]
pub struct EnvelopeCodec {
    serializer: Arc<dyn EnvelopeSerializer>,
    max_frame_size: usize,
}

impl EnvelopeCodec {
    pub fn new(serializer: Arc<dyn EnvelopeSerializer>, max_frame_size: usize) -> Self {
        Self {
            serializer,
            max_frame_size,
        }
    }

    pub fn serializer(&self) -> &dyn EnvelopeSerializer {
        self.serializer.as_ref()
    }

    /// Frame an envelope.
    pub fn encode(&self, envelope: &Envelope) -> Result<Bytes, CodecError> {
        let body = self
            .serializer
            .serialize(envelope)
            .map_err(|e| CodecError::Serialization(e.to_string()))?;
        if body.len() > self.max_frame_size || body.len() > i32::MAX as usize {
            return Err(CodecError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }

        let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
        frame.put_i32(HEADER_VERSION);
        frame.put_slice(&PREAMBLE);
        frame.put_i32(body.len() as i32);
        frame.put_i32(self.serializer.version());
        frame.put_slice(&body);
        Ok(frame.freeze())
    }

    /// Take one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; `buf` is left untouched
    /// in that case.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
        if buf.len() < PREAMBLE_OFFSET {
            return Ok(None);
        }
        let version = read_i32(buf, 0);
        if version != HEADER_VERSION {
            return Err(CodecError::UnsupportedHeaderVersion(version));
        }

        let seen = (buf.len() - PREAMBLE_OFFSET).min(PREAMBLE.len());
        if buf[PREAMBLE_OFFSET..PREAMBLE_OFFSET + seen] != PREAMBLE[..seen] {
            return Err(CodecError::PreambleMismatch);
        }
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = read_i32(buf, LENGTH_OFFSET);
        if length < 0 {
            return Err(CodecError::NegativeLength(length));
        }
        let length = length as usize;
        if length > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let serializer_version = read_i32(buf, SERIALIZER_OFFSET);
        if serializer_version != self.serializer.version() {
            return Err(CodecError::UnsupportedSerializerVersion {
                found: serializer_version,
                expected: self.serializer.version(),
            });
        }

        if buf.len() < HEADER_LEN + length {
            buf.reserve(HEADER_LEN + length - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let body = buf.split_to(length);
        self.serializer
            .deserialize(&body)
            .map(Some)
            .map_err(|e| CodecError::Serialization(e.to_string()))
    }
}

fn read_i32(buf: &[u8], at: usize) -> i32 {
    i32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
