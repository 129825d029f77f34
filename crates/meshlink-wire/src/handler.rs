//! Message handlers and their registry.
//!
//! A [`Handler`] is one of three kinds: fire-and-forget, synchronous reply or
//! asynchronous reply. Each registration pairs a handler with the
//! [`Executor`] it runs on. Handlers never run on the reactor threads.

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use meshlink_types::{Envelope, HandlerConflictPolicy, MessageType};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

type FireAndForgetFn = dyn Fn(Envelope) + Send + Sync;
type SyncReplyFn = dyn Fn(Envelope) -> Option<Bytes> + Send + Sync;
type AsyncReplyFn = dyn Fn(Envelope) -> BoxFuture<'static, Result<Bytes, String>> + Send + Sync;

/// Application callback for one message type.
#[derive(Clone)]
pub enum Handler {
    /// Consumes the message; nothing is sent back.
    FireAndForget(Arc<FireAndForgetFn>),
    /// Computes a reply inline; `None` means no reply.
    SyncReply(Arc<SyncReplyFn>),
    /// Produces a reply asynchronously; an `Err` is logged and no reply is sent.
    AsyncReply(Arc<AsyncReplyFn>),
}

impl Handler {
    /// Wrap a callback that consumes messages without replying.
    pub fn fire_and_forget<F>(f: F) -> Self
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        Self::FireAndForget(Arc::new(f))
    }

    /// Wrap a callback that returns its reply, or `None` for no reply.
    pub fn sync_reply<F>(f: F) -> Self
    where
        F: Fn(Envelope) -> Option<Bytes> + Send + Sync + 'static,
    {
        Self::SyncReply(Arc::new(f))
    }

    /// Wrap an async callback. Its error is rendered with `Display` and logged.
    pub fn async_reply<F, Fut, E>(f: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes, E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        Self::AsyncReply(Arc::new(move |envelope| {
            f(envelope).map(|r| r.map_err(|e| e.to_string())).boxed()
        }))
    }

    /// Short name of the handler kind, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FireAndForget(_) => "fire_and_forget",
            Self::SyncReply(_) => "sync_reply",
            Self::AsyncReply(_) => "async_reply",
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.kind()).finish()
    }
}

/// Where a handler runs.
#[derive(Debug, Clone, Default)]
pub enum Executor {
    /// The messaging service's blocking thread pool.
    #[default]
    Shared,
    /// A runtime supplied by the application.
    Runtime(Handle),
}

impl Executor {
    /// Run blocking work. `shared` is the service's own runtime handle.
    pub(crate) fn run_blocking<F>(&self, shared: &Handle, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self {
            Self::Shared => drop(shared.spawn_blocking(work)),
            Self::Runtime(handle) => drop(handle.spawn_blocking(work)),
        }
    }

    /// Run a future to completion off the reactor threads.
    pub(crate) fn run_async<F>(&self, shared: &Handle, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self {
            Self::Shared => {
                let handle = shared.clone();
                drop(shared.spawn_blocking(move || handle.block_on(work)));
            }
            Self::Runtime(handle) => drop(handle.spawn(work)),
        }
    }
}

/// A handler bound to its executor.
#[derive(Debug, Clone)]
pub struct Registration {
    pub handler: Handler,
    pub executor: Executor,
}

/// Concurrent map from message type to registration.
///
/// Lookups hand out an `Arc` snapshot, so an in-flight dispatch is unaffected
/// by a concurrent unregister.
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<Registration>>,
    policy: HandlerConflictPolicy,
}

impl HandlerRegistry {
    pub fn new(policy: HandlerConflictPolicy) -> Self {
        Self {
            handlers: DashMap::new(),
            policy,
        }
    }

    /// Register a handler. Returns `false` when an existing registration was
    /// kept under [`HandlerConflictPolicy::KeepFirst`].
    pub fn register(
        &self,
        message_type: MessageType,
        handler: Handler,
        executor: Executor,
    ) -> bool {
        let registration = Arc::new(Registration { handler, executor });
        let kind = registration.handler.kind();
        match self.policy {
            HandlerConflictPolicy::Replace => {
                if self
                    .handlers
                    .insert(message_type.as_str().to_string(), registration)
                    .is_some()
                {
                    debug!(message_type = %message_type, kind, "Replaced handler");
                }
                true
            }
            HandlerConflictPolicy::KeepFirst => {
                let mut installed = false;
                self.handlers
                    .entry(message_type.as_str().to_string())
                    .or_insert_with(|| {
                        installed = true;
                        registration
                    });
                if !installed {
                    warn!(
                        message_type = %message_type,
                        "Handler already registered, keeping existing"
                    );
                }
                installed
            }
        }
    }

    /// Remove the handler for `message_type`. Returns whether one was present.
    pub fn unregister(&self, message_type: &MessageType) -> bool {
        self.handlers.remove(message_type.as_str()).is_some()
    }

    pub fn get(&self, message_type: &str) -> Option<Arc<Registration>> {
        self.handlers.get(message_type).map(|r| Arc::clone(r.value()))
    }

    /// Registered message types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_types::Endpoint;

    fn ty(name: &str) -> MessageType {
        MessageType::new(name).unwrap()
    }

    fn envelope(payload: &'static [u8]) -> Envelope {
        Envelope::new(1, Endpoint::new("h", 1), &ty("t"), Bytes::from_static(payload))
    }

    fn reply_of(registration: &Registration) -> Option<Bytes> {
        match &registration.handler {
            Handler::SyncReply(f) => f(envelope(b"in")),
            other => panic!("expected sync handler, got {other:?}"),
        }
    }

    fn constant(reply: &'static [u8]) -> Handler {
        Handler::sync_reply(move |_| Some(Bytes::from_static(reply)))
    }

    #[test]
    fn test_replace_policy() {
        let registry = HandlerRegistry::new(HandlerConflictPolicy::Replace);
        assert!(registry.register(ty("echo"), constant(b"1"), Executor::Shared));
        assert!(registry.register(ty("echo"), constant(b"2"), Executor::Shared));
        let reg = registry.get("echo").unwrap();
        assert_eq!(reply_of(&reg), Some(Bytes::from_static(b"2")));
    }

    #[test]
    fn test_keep_first_policy() {
        let registry = HandlerRegistry::new(HandlerConflictPolicy::KeepFirst);
        assert!(registry.register(ty("echo"), constant(b"1"), Executor::Shared));
        assert!(!registry.register(ty("echo"), constant(b"2"), Executor::Shared));
        let reg = registry.get("echo").unwrap();
        assert_eq!(reply_of(&reg), Some(Bytes::from_static(b"1")));
    }

    #[test]
    fn test_unregister_keeps_snapshot_alive() {
        let registry = HandlerRegistry::new(HandlerConflictPolicy::Replace);
        let echo = Handler::sync_reply(|e| Some(e.into_payload()));
        registry.register(ty("echo"), echo, Executor::Shared);
        let snapshot = registry.get("echo").unwrap();
        assert!(registry.unregister(&ty("echo")));
        assert!(!registry.unregister(&ty("echo")));
        assert!(registry.get("echo").is_none());
        assert_eq!(reply_of(&snapshot), Some(Bytes::from_static(b"in")));
    }

    #[test]
    fn test_types_sorted() {
        let registry = HandlerRegistry::new(HandlerConflictPolicy::Replace);
        registry.register(ty("b"), Handler::fire_and_forget(|_| {}), Executor::Shared);
        registry.register(ty("a"), Handler::fire_and_forget(|_| {}), Executor::Shared);
        assert_eq!(registry.types(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_async_handler_error_is_stringified() {
        let handler =
            Handler::async_reply(|_| async { Err::<Bytes, _>(std::io::Error::other("boom")) });
        match handler {
            Handler::AsyncReply(f) => {
                assert_eq!(f(envelope(b"")).await, Err("boom".to_string()))
            }
            other => panic!("expected async handler, got {other:?}"),
        }
    }
}
