//! The messaging service: lifecycle and the caller-facing send API.
//!
//! A [`MessagingService`] owns everything it runs on. `start` binds the
//! listener and spins up a dedicated multi-threaded tokio runtime (the
//! reactor) that drives every socket, the reply pump and the two sweepers.
//! Handlers run on that runtime's blocking pool or on a runtime supplied at
//! registration, never on its worker threads. `stop` tears the runtime down
//! in the background, so it can be called from any thread, including from
//! inside another runtime.
//!
//! Send operations are `async` and report every failure through their
//! result. They may be awaited from any executor.

use crate::codec::EnvelopeCodec;
use crate::connector::{Connector, StreamConnector};
use crate::dispatcher::{Dispatcher, OutboundReply};
use crate::handler::{Executor, Handler, HandlerRegistry};
use crate::listener::{self, Inbound};
use crate::pending::PendingRequests;
use crate::pool::{Checkout, ConnectionPool, EstablishedReader};
use crate::serializer::{EnvelopeSerializer, MsgPackSerializer};
use crate::tls::TlsContext;
use bytes::Bytes;
use meshlink_types::{
    Endpoint, Envelope, MessageType, MessagingConfig, MessagingError, MessagingResult,
};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Lifecycle state of a [`MessagingService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Shared state of one RUNNING incarnation of the service.
struct Core {
    local: Endpoint,
    codec: EnvelopeCodec,
    pool: ConnectionPool,
    pending: Arc<PendingRequests>,
    dispatcher: Arc<Dispatcher>,
    io: Handle,
}

impl Core {
    /// Run `deliver` on the reactor and wait for it.
    async fn submit(self: &Arc<Self>, to: Endpoint, envelope: Envelope) -> MessagingResult<()> {
        let core = Arc::clone(self);
        self.io
            .spawn(async move { core.deliver(&to, envelope).await })
            .await
            .unwrap_or(Err(MessagingError::NotRunning))
    }

    /// Hand one envelope to its destination: in-process when it is addressed
    /// to this node, otherwise framed onto a pooled connection.
    async fn deliver(&self, to: &Endpoint, envelope: Envelope) -> MessagingResult<()> {
        if *to == self.local {
            self.dispatcher.dispatch(envelope);
            return Ok(());
        }

        let frame = self.codec.encode(&envelope)?;
        let Checkout {
            mut connection,
            established,
        } = self.pool.borrow(to).await?;
        if let Some(EstablishedReader { reader, liveness }) = established {
            let task = self.io.spawn(listener::read_loop(
                reader,
                to.to_string(),
                self.codec.clone(),
                Arc::clone(&self.dispatcher),
                Some(liveness),
            ));
            connection.attach_reader(task.abort_handle());
        }

        match connection.write_frame(&frame).await {
            Ok(()) => {
                self.pool.release(connection);
                Ok(())
            }
            Err(e) => {
                debug!(
                    peer = %to,
                    conn = connection.id(),
                    error = %e,
                    "Write failed, discarding connection"
                );
                Err(MessagingError::Disconnected {
                    endpoint: to.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

struct Running {
    runtime: Runtime,
    core: Arc<Core>,
}

/// Inter-node messaging transport.
///
/// Handler registrations belong to the service and survive restarts;
/// connections and pending requests belong to one RUNNING period.
pub struct MessagingService {
    config: MessagingConfig,
    serializer: Arc<dyn EnvelopeSerializer>,
    handlers: Arc<HandlerRegistry>,
    next_id: AtomicU64,
    /// Serialises `start` and `stop`.
    lifecycle: Mutex<()>,
    state: Mutex<ServiceState>,
    running: Mutex<Option<Running>>,
}

impl MessagingService {
    /// Create a stopped service using the MessagePack serializer.
    pub fn new(config: MessagingConfig) -> Self {
        Self::with_serializer(config, Arc::new(MsgPackSerializer))
    }

    /// Create a stopped service with a custom envelope serializer. Every
    /// node that talks to this one must plug in the same serializer.
    pub fn with_serializer(
        config: MessagingConfig,
        serializer: Arc<dyn EnvelopeSerializer>,
    ) -> Self {
        let handlers = Arc::new(HandlerRegistry::new(config.handler_conflict));
        Self {
            config,
            serializer,
            handlers,
            next_id: AtomicU64::new(1),
            lifecycle: Mutex::new(()),
            state: Mutex::new(ServiceState::Stopped),
            running: Mutex::new(None),
        }
    }

    /// The configuration this service was created with.
    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Bind the listener and start the reactor.
    ///
    /// Returns the local endpoint, whose port is the bound one when the
    /// configured port is 0. Calling `start` on a running service logs and
    /// returns the current endpoint.
    pub fn start(&self) -> MessagingResult<Endpoint> {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(local) = self.local_endpoint() {
            info!(local = %local, "Messaging service already running");
            return Ok(local);
        }

        self.set_state(ServiceState::Starting);
        match self.launch() {
            Ok(running) => {
                let local = running.core.local.clone();
                *self.running.lock().unwrap_or_else(|e| e.into_inner()) = Some(running);
                self.set_state(ServiceState::Running);
                info!(
                    local = %local,
                    tls = self.config.tls.is_some(),
                    serializer = self.serializer.name(),
                    "Messaging service started"
                );
                Ok(local)
            }
            Err(e) => {
                self.set_state(ServiceState::Stopped);
                warn!(error = %e, "Messaging service failed to start");
                Err(e)
            }
        }
    }

    fn launch(&self) -> MessagingResult<Running> {
        let tls = self
            .config
            .tls
            .as_ref()
            .map(TlsContext::load)
            .transpose()?;

        let requested = self.config.listen_endpoint();
        let advertised = self.config.advertised_host();
        if advertised.parse::<IpAddr>().is_ok_and(|ip| ip.is_unspecified()) {
            return Err(MessagingError::Bind {
                endpoint: requested,
                reason: format!("{advertised} is not reachable by peers; set advertise_host"),
            });
        }

        let std_listener = listener::bind(&requested)?;
        let local = std_listener
            .local_addr()
            .map(|addr| Endpoint::new(advertised, addr.port()))
            .map_err(|e| MessagingError::Bind {
                endpoint: requested.clone(),
                reason: e.to_string(),
            })?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.io_threads.max(1))
            .thread_name("meshlink-io")
            .enable_all()
            .build()
            .map_err(|e| MessagingError::Bind {
                endpoint: local.clone(),
                reason: format!("cannot start I/O runtime: {e}"),
            })?;

        let listener = {
            let _enter = runtime.enter();
            TcpListener::from_std(std_listener)
        };
        let listener = match listener {
            Ok(listener) => listener,
            Err(e) => {
                runtime.shutdown_background();
                return Err(MessagingError::Bind {
                    endpoint: local,
                    reason: e.to_string(),
                });
            }
        };

        let io = runtime.handle().clone();
        let codec = EnvelopeCodec::new(Arc::clone(&self.serializer), self.config.max_frame_size);
        let pending = Arc::new(PendingRequests::new(self.config.max_pending_requests));
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(
            local.clone(),
            Arc::clone(&self.handlers),
            Arc::clone(&pending),
            replies_tx,
            io.clone(),
        ));
        let connector: Arc<dyn Connector> = Arc::new(StreamConnector::new(
            self.config.connect_timeout(),
            tls.as_ref().cloned(),
        ));
        let core = Arc::new(Core {
            local,
            codec: codec.clone(),
            pool: ConnectionPool::new(
                connector,
                self.config.pool_idle_timeout(),
                self.config.max_idle_per_endpoint,
            ),
            pending: Arc::clone(&pending),
            dispatcher: Arc::clone(&dispatcher),
            io,
        });

        runtime.spawn(listener::accept_loop(
            listener,
            Inbound {
                codec,
                dispatcher,
                tls: tls.map(|t| t.acceptor),
                handshake_timeout: self.config.connect_timeout(),
            },
        ));
        runtime.spawn(pump_replies(Arc::clone(&core), replies_rx));
        runtime.spawn(sweep_pending(pending, self.config.pending_sweep_interval()));
        runtime.spawn(sweep_pool(Arc::clone(&core), self.config.pool_sweep_interval()));

        Ok(Running { runtime, core })
    }

    /// Close the pool, stop the listener and shut the reactor down.
    ///
    /// Outstanding requests fail with [`MessagingError::NotRunning`]. A no-op
    /// when already stopped.
    pub fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        let Some(running) = self.running.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        self.set_state(ServiceState::Stopping);

        let Running { runtime, core } = running;
        core.pool.close();
        let failed = core.pending.fail_all(MessagingError::NotRunning);
        runtime.shutdown_background();

        self.set_state(ServiceState::Stopped);
        info!(local = %core.local, failed_requests = failed, "Messaging service stopped");
    }

    /// Send `payload` to `to` without waiting for a reply.
    ///
    /// Completes once the envelope has been handed to the transport: written
    /// to a connection, or queued to a local handler.
    pub async fn send_async(
        &self,
        to: &Endpoint,
        message_type: &MessageType,
        payload: impl Into<Bytes>,
    ) -> MessagingResult<()> {
        let core = self.core()?;
        let envelope = Envelope::new(
            self.next_id(),
            core.local.clone(),
            message_type,
            payload.into(),
        );
        core.submit(to.clone(), envelope).await
    }

    /// Send `payload` to `to` and wait for the correlated reply.
    ///
    /// `timeout` defaults to the configured request TTL. Fails with
    /// [`MessagingError::Timeout`] when no reply arrives in time, or with the
    /// error that prevented the request from being sent.
    pub async fn send_and_receive(
        &self,
        to: &Endpoint,
        message_type: &MessageType,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> MessagingResult<Bytes> {
        let core = self.core()?;
        let id = self.next_id();
        let reply = core
            .pending
            .register(id, timeout.unwrap_or_else(|| self.config.request_ttl()))?;
        let envelope = Envelope::new(id, core.local.clone(), message_type, payload.into());
        if let Err(e) = core.submit(to.clone(), envelope).await {
            core.pending.fail(id, e);
        }
        // Holding the core would keep the entry's sender alive past `stop`.
        drop(core);
        reply.await
    }

    /// Register `handler` for `message_type` on the shared handler executor.
    pub fn register_handler(&self, message_type: MessageType, handler: Handler) -> bool {
        self.register_handler_with(message_type, handler, Executor::default())
    }

    /// Register `handler` for `message_type` on `executor`.
    ///
    /// Returns `false` when the conflict policy kept an existing handler.
    pub fn register_handler_with(
        &self,
        message_type: MessageType,
        handler: Handler,
        executor: Executor,
    ) -> bool {
        self.handlers.register(message_type, handler, executor)
    }

    /// Remove the handler for `message_type`. Returns `false` if none was
    /// registered.
    pub fn unregister_handler(&self, message_type: &MessageType) -> bool {
        self.handlers.unregister(message_type)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The endpoint this node listens on and sends as, while running.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|r| r.core.local.clone())
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.running_core().map(|c| c.pending.len()).unwrap_or(0)
    }

    /// Message types with a registered handler, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        self.handlers.types()
    }

    /// Outbound connections established during the current RUNNING period.
    pub fn connections_established(&self) -> u64 {
        self.running_core()
            .map(|c| c.pool.established_count())
            .unwrap_or(0)
    }

    /// Idle pooled connections to `endpoint`.
    pub fn idle_connections(&self, endpoint: &Endpoint) -> usize {
        self.running_core()
            .map(|c| c.pool.idle_count(endpoint))
            .unwrap_or(0)
    }

    fn core(&self) -> MessagingResult<Arc<Core>> {
        self.running_core().ok_or(MessagingError::NotRunning)
    }

    fn running_core(&self) -> Option<Arc<Core>> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|r| Arc::clone(&r.core))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn set_state(&self, state: ServiceState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

impl Drop for MessagingService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Send replies produced by handlers.
async fn pump_replies(core: Arc<Core>, mut replies: mpsc::UnboundedReceiver<OutboundReply>) {
    while let Some(OutboundReply { to, envelope }) = replies.recv().await {
        let core = Arc::clone(&core);
        tokio::spawn(async move {
            let id = envelope.id();
            if let Err(e) = core.deliver(&to, envelope).await {
                warn!(peer = %to, id, error = %e, "Failed to send reply");
            }
        });
    }
}

async fn sweep_pending(pending: Arc<PendingRequests>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let expired = pending.sweep_expired(Instant::now());
        if expired > 0 {
            debug!(expired, "Expired pending requests");
        }
    }
}

async fn sweep_pool(core: Arc<Core>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        core.pool.evict_idle();
    }
}
