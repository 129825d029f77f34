//! Routing of decoded envelopes.
//!
//! Replies resolve pending requests. Everything else goes to the handler
//! registered for its type, on that handler's executor. Replies produced by
//! handlers are queued to an outbound channel that the messaging service
//! drains, so the dispatcher itself never touches a connection.

use crate::handler::{Handler, HandlerRegistry};
use crate::pending::PendingRequests;
use bytes::Bytes;
use meshlink_types::{Endpoint, Envelope, MessagingError};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A reply envelope waiting to be sent to `to`.
#[derive(Debug)]
pub struct OutboundReply {
    pub to: Endpoint,
    pub envelope: Envelope,
}

/// Routes every inbound envelope exactly once.
pub struct Dispatcher {
    local: Endpoint,
    handlers: Arc<HandlerRegistry>,
    pending: Arc<PendingRequests>,
    replies: mpsc::UnboundedSender<OutboundReply>,
    shared: Handle,
}

impl Dispatcher {
    pub fn new(
        local: Endpoint,
        handlers: Arc<HandlerRegistry>,
        pending: Arc<PendingRequests>,
        replies: mpsc::UnboundedSender<OutboundReply>,
        shared: Handle,
    ) -> Self {
        Self {
            local,
            handlers,
            pending,
            replies,
            shared,
        }
    }

    /// Route one envelope. Never blocks and never runs handler code inline.
    pub fn dispatch(&self, envelope: Envelope) {
        if envelope.is_reply() {
            let id = envelope.id();
            let from = envelope.sender().clone();
            if !self.pending.complete(id, envelope.into_payload()) {
                debug!(id, peer = %from, "Dropping reply with no pending request");
            }
            return;
        }

        let Some(registration) = self.handlers.get(envelope.message_type()) else {
            let error = MessagingError::NoHandler(envelope.message_type().to_string());
            warn!(peer = %envelope.sender(), id = envelope.id(), %error, "Dropping envelope");
            return;
        };

        match &registration.handler {
            Handler::FireAndForget(f) => {
                let f = Arc::clone(f);
                registration
                    .executor
                    .run_blocking(&self.shared, move || f(envelope));
            }
            Handler::SyncReply(f) => {
                let f = Arc::clone(f);
                let replier = self.replier(&envelope);
                registration.executor.run_blocking(&self.shared, move || {
                    if let Some(payload) = f(envelope) {
                        replier.send(payload);
                    }
                });
            }
            Handler::AsyncReply(f) => {
                let f = Arc::clone(f);
                let replier = self.replier(&envelope);
                let message_type = envelope.message_type().to_string();
                registration.executor.run_async(&self.shared, async move {
                    match f(envelope).await {
                        Ok(payload) => replier.send(payload),
                        Err(reason) => {
                            let error = MessagingError::HandlerFailed {
                                message_type,
                                reason,
                            };
                            warn!(id = replier.id, %error, "No reply sent");
                        }
                    }
                });
            }
        }
    }

    fn replier(&self, request: &Envelope) -> Replier {
        Replier {
            id: request.id(),
            to: request.sender().clone(),
            local: self.local.clone(),
            replies: self.replies.clone(),
        }
    }
}

/// Everything needed to answer one request from a handler thread.
struct Replier {
    id: u64,
    to: Endpoint,
    local: Endpoint,
    replies: mpsc::UnboundedSender<OutboundReply>,
}

impl Replier {
    fn send(self, payload: Bytes) {
        let reply = OutboundReply {
            to: self.to,
            envelope: Envelope::reply(self.id, self.local, payload),
        };
        if self.replies.send(reply).is_err() {
            debug!(id = self.id, "Reply dropped, messaging service stopped");
        }
    }
}
