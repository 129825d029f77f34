//! Error taxonomy of the messaging transport.

use crate::endpoint::Endpoint;
use thiserror::Error;

/// Errors surfaced to callers of the messaging service.
///
/// Send operations report these through their returned future, never by
/// panicking or blocking. Transport-internal failures (a garbled frame on an
/// inbound connection, a stale pooled connection) are handled where they
/// occur and only show up here when a specific send is affected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// Bad preamble, unsupported header or serializer version.
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// A connection could not be established or authenticated.
    #[error("Connect to {endpoint} failed: {reason}")]
    ConnectFailed {
        /// The unreachable peer.
        endpoint: Endpoint,
        /// Underlying cause.
        reason: String,
    },

    /// A write failed on an established connection.
    #[error("Connection to {endpoint} lost: {reason}")]
    Disconnected {
        /// The peer the connection belonged to.
        endpoint: Endpoint,
        /// Underlying cause.
        reason: String,
    },

    /// No reply arrived within the request's time-to-live.
    #[error("Request {id} timed out")]
    Timeout {
        /// The request id that expired.
        id: u64,
    },

    /// No handler is registered for the message type.
    #[error("No handler registered for message type '{0}'")]
    NoHandler(String),

    /// The message type tag is empty or reserved.
    #[error("Invalid message type: {0}")]
    InvalidMessageType(String),

    /// The service is not in the RUNNING state.
    #[error("Messaging service is not running")]
    NotRunning,

    /// The listener could not bind its local endpoint.
    #[error("Failed to bind {endpoint}: {reason}")]
    Bind {
        /// The local endpoint that was requested.
        endpoint: Endpoint,
        /// Underlying cause.
        reason: String,
    },

    /// The envelope could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A frame body exceeded the configured maximum.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Observed body length.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// The pending-request table is at capacity.
    #[error("Too many pending requests (capacity {capacity})")]
    TooManyPending {
        /// Configured table bound.
        capacity: usize,
    },

    /// TLS key or trust material could not be loaded.
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// An asynchronous handler completed with an error.
    #[error("Handler for '{message_type}' failed: {reason}")]
    HandlerFailed {
        /// The message type whose handler failed.
        message_type: String,
        /// Error reported by the handler.
        reason: String,
    },
}

/// Alias for messaging results.
pub type MessagingResult<T> = Result<T, MessagingError>;
