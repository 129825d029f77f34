//! Core types for the meshlink inter-node messaging transport.
//!
//! This crate defines the data that crosses the transport boundary: peer
//! identities, envelopes, the error taxonomy reported to callers, and the
//! service configuration. It contains no I/O.

pub mod config;
pub mod endpoint;
pub mod envelope;
pub mod error;

pub use config::{HandlerConflictPolicy, MessagingConfig, TlsConfig};
pub use endpoint::{Endpoint, EndpointParseError};
pub use envelope::{Envelope, MessageType, REPLY};
pub use error::{MessagingError, MessagingResult};
