//! Envelopes: the logical unit of transfer.
//!
//! An [`Envelope`] carries a request id, the sender's [`Endpoint`], a type tag
//! and an opaque payload. Replies reuse the request's id and carry the
//! reserved [`REPLY`] tag, which user code can never produce: the only way to
//! build a non-reply envelope is through a validated [`MessageType`].

use crate::endpoint::Endpoint;
use crate::error::MessagingError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type tag reserved for reply envelopes.
pub const REPLY: &str = "REPLY";

/// A user-level message type tag. Never equal to [`REPLY`] and never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MessageType(String);

impl MessageType {
    /// Validate and wrap a type tag.
    pub fn new(name: impl Into<String>) -> Result<Self, MessagingError> {
        let name = name.into();
        if name.is_empty() {
            return Err(MessagingError::InvalidMessageType(
                "message type must not be empty".to_string(),
            ));
        }
        if name == REPLY {
            return Err(MessagingError::InvalidMessageType(format!(
                "'{REPLY}' is reserved for replies"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for MessageType {
    type Error = MessagingError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for MessageType {
    type Error = MessagingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(raw).map_err(serde::de::Error::custom)
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    id: u64,
    sender: Endpoint,
    #[serde(rename = "type")]
    message_type: String,
    payload: Bytes,
}

impl Envelope {
    /// A fresh request or notification.
    pub fn new(id: u64, sender: Endpoint, message_type: &MessageType, payload: Bytes) -> Self {
        Self {
            id,
            sender,
            message_type: message_type.as_str().to_string(),
            payload,
        }
    }

    /// A reply to request `id`, sent by `sender`.
    pub fn reply(id: u64, sender: Endpoint, payload: Bytes) -> Self {
        Self {
            id,
            sender,
            message_type: REPLY.to_string(),
            payload,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sender(&self) -> &Endpoint {
        &self.sender
    }

    /// The raw type tag (may be [`REPLY`]).
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_reply(&self) -> bool {
        self.message_type == REPLY
    }

    /// Consume the envelope, keeping only the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> Endpoint {
        Endpoint::new("127.0.0.1", 7000)
    }

    #[test]
    fn test_reply_type_is_reserved() {
        assert!(matches!(
            MessageType::new(REPLY),
            Err(MessagingError::InvalidMessageType(_))
        ));
        assert!(MessageType::new("").is_err());
        assert_eq!(MessageType::new("echo").unwrap().as_str(), "echo");
    }

    #[test]
    fn test_request_and_reply_kinds() {
        let ty = MessageType::new("echo").unwrap();
        let req = Envelope::new(7, sender(), &ty, Bytes::from_static(b"hi"));
        assert!(!req.is_reply());
        assert_eq!(req.message_type(), "echo");

        let rep = Envelope::reply(req.id(), sender(), Bytes::from_static(b"hi"));
        assert!(rep.is_reply());
        assert_eq!(rep.id(), 7);
    }

    #[test]
    fn test_message_type_deserialize_rejects_reply() {
        let err = serde_json::from_str::<MessageType>("\"REPLY\"");
        assert!(err.is_err());
        let ok: MessageType = serde_json::from_str("\"ping\"").unwrap();
        assert_eq!(ok.as_str(), "ping");
    }

    #[test]
    fn test_envelope_msgpack_fields() {
        let ty = MessageType::new("update").unwrap();
        let env = Envelope::new(u64::MAX, sender(), &ty, Bytes::from_static(&[0, 1, 2]));
        let bytes = rmp_serde::to_vec_named(&env).unwrap();
        let back: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.payload().as_ref(), &[0, 1, 2]);
    }
}
