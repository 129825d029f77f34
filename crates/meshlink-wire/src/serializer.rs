//! Pluggable envelope serializers.
//!
//! The codec frames whatever bytes the plugged [`EnvelopeSerializer`] produces
//! and stamps its [`version`](EnvelopeSerializer::version) into every frame
//! header, so two peers with different serializers reject each other instead
//! of misreading payloads.

use meshlink_types::Envelope;
use thiserror::Error;

/// Failure to turn an envelope into bytes or back.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SerializeError(pub String);

impl From<rmp_serde::encode::Error> for SerializeError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SerializeError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self(e.to_string())
    }
}

impl From<serde_json::Error> for SerializeError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// Turns the envelope object graph into bytes and back.
pub trait EnvelopeSerializer: Send + Sync + 'static {
    /// Format version written into the frame header.
    fn version(&self) -> i32;

    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>, SerializeError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Envelope, SerializeError>;
}

/// MessagePack with named fields. The default serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackSerializer;

impl EnvelopeSerializer for MsgPackSerializer {
    fn version(&self) -> i32 {
        1
    }

    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>, SerializeError> {
        Ok(rmp_serde::to_vec_named(envelope)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Envelope, SerializeError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// JSON; larger on the wire but readable in packet captures.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl EnvelopeSerializer for JsonSerializer {
    fn version(&self) -> i32 {
        2
    }

    fn name(&self) -> &'static str {
        "json"
    }

    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>, SerializeError> {
        Ok(serde_json::to_vec(envelope)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Envelope, SerializeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
