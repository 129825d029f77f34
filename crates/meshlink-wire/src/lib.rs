//! meshlink wire transport: framed request/reply messaging between nodes.
//!
//! Nodes exchange envelopes over pooled TCP connections, optionally wrapped
//! in mutual TLS. Each envelope is dispatched by its message type to a
//! registered handler; replies are correlated to requests by id.
//!
//! ## Architecture
//!
//! - **MessagingService**: lifecycle plus the send / send-and-receive API
//! - **EnvelopeCodec**: preamble-checked, length-delimited frames
//! - **EnvelopeSerializer**: pluggable body encoding (MessagePack, JSON)
//! - **ConnectionPool**: exclusive-borrow pool of outbound connections
//! - **Dispatcher**: routes envelopes to handlers or pending requests
//! - **PendingRequests**: request id to waiting caller, with expiry

pub mod codec;
pub mod connector;
pub mod dispatcher;
pub mod handler;
pub mod listener;
pub mod pending;
pub mod pool;
pub mod serializer;
pub mod service;
pub mod tls;

pub use codec::{CodecError, EnvelopeCodec};
pub use handler::{Executor, Handler};
pub use serializer::{EnvelopeSerializer, JsonSerializer, MsgPackSerializer};
pub use service::{MessagingService, ServiceState};
