//! Per-endpoint pool of outbound connections.
//!
//! Idle connections sit in a LIFO stack per [`Endpoint`]. [`ConnectionPool::borrow`]
//! pops the most recently used live connection, or establishes a new one when
//! none is available; the borrower owns the connection exclusively until it
//! hands it back with [`ConnectionPool::release`]. A connection whose stream
//! has closed is dropped on borrow, on release and by the idle sweep. Dropping
//! a [`PooledConnection`] closes its socket.

use crate::connector::{BoxedReader, BoxedWriter, Connector};
use dashmap::DashMap;
use meshlink_types::{Endpoint, MessagingResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::task::AbortHandle;
use tracing::debug;

/// Shared open/closed flag of one connection.
///
/// Cleared by the read loop when the peer hangs up, and by the pool when the
/// connection is discarded.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// An outbound connection owned by the pool or by exactly one borrower.
pub struct PooledConnection {
    id: u64,
    endpoint: Endpoint,
    writer: BoxedWriter,
    liveness: Liveness,
    last_used: Instant,
    reader_task: Option<AbortHandle>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn is_open(&self) -> bool {
        self.liveness.is_open()
    }

    /// Tie the read loop's lifetime to this connection.
    pub fn attach_reader(&mut self, task: AbortHandle) {
        self.reader_task = Some(task);
    }

    /// Write one complete frame and flush it.
    pub async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        let result = async {
            self.writer.write_all(frame).await?;
            self.writer.flush().await
        }
        .await;
        match result {
            Ok(()) => {
                self.last_used = Instant::now();
                Ok(())
            }
            Err(e) => {
                self.liveness.mark_closed();
                Err(e)
            }
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.liveness.mark_closed();
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

/// Read side of a connection that was just established by a borrow.
pub struct EstablishedReader {
    pub reader: BoxedReader,
    pub liveness: Liveness,
}

/// Result of a borrow.
pub struct Checkout {
    pub connection: PooledConnection,
    /// Present only when the connection was created by this borrow; the
    /// caller installs the inbound pipeline on it.
    pub established: Option<EstablishedReader>,
}

/// Pool of outbound connections keyed by endpoint.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    idle: DashMap<Endpoint, Vec<PooledConnection>>,
    next_id: AtomicU64,
    established: AtomicU64,
    idle_timeout: Duration,
    max_idle_per_endpoint: usize,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(
        connector: Arc<dyn Connector>,
        idle_timeout: Duration,
        max_idle_per_endpoint: usize,
    ) -> Self {
        Self {
            connector,
            idle: DashMap::new(),
            next_id: AtomicU64::new(1),
            established: AtomicU64::new(0),
            idle_timeout,
            max_idle_per_endpoint,
            closed: AtomicBool::new(false),
        }
    }

    /// Take an exclusive connection to `endpoint`, connecting if needed.
    pub async fn borrow(&self, endpoint: &Endpoint) -> MessagingResult<Checkout> {
        while let Some(connection) = self.pop_idle(endpoint) {
            if connection.is_open() {
                return Ok(Checkout {
                    connection,
                    established: None,
                });
            }
            debug!(peer = %endpoint, conn = connection.id, "Discarding closed pooled connection");
        }

        let raw = self.connector.connect(endpoint).await?;
        let liveness = Liveness::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.established.fetch_add(1, Ordering::Relaxed);
        debug!(peer = %endpoint, conn = id, "Established pooled connection");

        Ok(Checkout {
            connection: PooledConnection {
                id,
                endpoint: endpoint.clone(),
                writer: raw.writer,
                liveness: liveness.clone(),
                last_used: Instant::now(),
                reader_task: None,
            },
            established: Some(EstablishedReader {
                reader: raw.reader,
                liveness,
            }),
        })
    }

    /// Hand a borrowed connection back. Closed connections, connections
    /// beyond the per-endpoint idle cap, and anything returned after
    /// [`close`](Self::close) are dropped.
    pub fn release(&self, connection: PooledConnection) {
        if self.closed.load(Ordering::Acquire) || !connection.is_open() {
            return;
        }
        let mut stack = self.idle.entry(connection.endpoint.clone()).or_default();
        if stack.len() >= self.max_idle_per_endpoint {
            debug!(peer = %connection.endpoint, conn = connection.id, "Idle cap reached, closing");
            return;
        }
        stack.push(connection);
    }

    /// Close idle connections unused for longer than the idle timeout, or
    /// whose stream has closed. Returns how many were closed.
    pub fn evict_idle(&self) -> usize {
        let mut evicted = 0;
        self.idle.retain(|endpoint, stack| {
            let before = stack.len();
            stack.retain(|c| c.is_open() && c.last_used.elapsed() <= self.idle_timeout);
            let removed = before - stack.len();
            if removed > 0 {
                debug!(peer = %endpoint, removed, "Evicted idle connections");
            }
            evicted += removed;
            !stack.is_empty()
        });
        evicted
    }

    /// Close every pooled connection and refuse further returns.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.idle.clear();
    }

    /// Idle connections currently pooled for `endpoint`.
    pub fn idle_count(&self, endpoint: &Endpoint) -> usize {
        self.idle.get(endpoint).map(|s| s.len()).unwrap_or(0)
    }

    /// Connections established since the pool was created.
    pub fn established_count(&self) -> u64 {
        self.established.load(Ordering::Relaxed)
    }

    fn pop_idle(&self, endpoint: &Endpoint) -> Option<PooledConnection> {
        self.idle.get_mut(endpoint).and_then(|mut stack| stack.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::RawConnection;
    use meshlink_types::MessagingError;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::io::DuplexStream;

    /// In-memory connector; keeps the far ends alive so writes succeed.
    struct MemoryConnector {
        peers: Mutex<Vec<DuplexStream>>,
        refuse: AtomicBool,
    }

    impl MemoryConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                peers: Mutex::new(Vec::new()),
                refuse: AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, endpoint: &Endpoint) -> MessagingResult<RawConnection> {
            if self.refuse.load(Ordering::Relaxed) {
                return Err(MessagingError::ConnectFailed {
                    endpoint: endpoint.clone(),
                    reason: "refused".to_string(),
                });
            }
            let (local, remote) = tokio::io::duplex(64 * 1024);
            self.peers.lock().unwrap().push(remote);
            Ok(RawConnection::from_stream(local))
        }
    }

    fn peer() -> Endpoint {
        Endpoint::new("10.0.0.2", 9876)
    }

    #[tokio::test]
    async fn test_borrow_establishes_then_reuses() {
        let pool = ConnectionPool::new(MemoryConnector::new(), Duration::from_secs(60), 4);
        let first = pool.borrow(&peer()).await.unwrap();
        assert!(first.established.is_some());
        let id = first.connection.id();
        pool.release(first.connection);
        assert_eq!(pool.idle_count(&peer()), 1);

        let second = pool.borrow(&peer()).await.unwrap();
        assert!(second.established.is_none());
        assert_eq!(second.connection.id(), id);
        assert_eq!(pool.established_count(), 1);
    }

    #[tokio::test]
    async fn test_lifo_reuse() {
        let pool = ConnectionPool::new(MemoryConnector::new(), Duration::from_secs(60), 4);
        let a = pool.borrow(&peer()).await.unwrap().connection;
        let b = pool.borrow(&peer()).await.unwrap().connection;
        let b_id = b.id();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.borrow(&peer()).await.unwrap().connection.id(), b_id);
    }

    #[tokio::test]
    async fn test_closed_connection_not_reused() {
        let pool = ConnectionPool::new(MemoryConnector::new(), Duration::from_secs(60), 4);
        let checkout = pool.borrow(&peer()).await.unwrap();
        let stale_id = checkout.connection.id();
        let liveness = checkout.connection.liveness().clone();
        pool.release(checkout.connection);

        // Peer hung up while the connection sat idle.
        liveness.mark_closed();
        let fresh = pool.borrow(&peer()).await.unwrap();
        assert_ne!(fresh.connection.id(), stale_id);
        assert!(fresh.established.is_some());
    }

    #[tokio::test]
    async fn test_release_of_closed_connection_drops_it() {
        let pool = ConnectionPool::new(MemoryConnector::new(), Duration::from_secs(60), 4);
        let conn = pool.borrow(&peer()).await.unwrap().connection;
        conn.liveness().mark_closed();
        pool.release(conn);
        assert_eq!(pool.idle_count(&peer()), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates() {
        let connector = MemoryConnector::new();
        connector.refuse.store(true, Ordering::Relaxed);
        let pool = ConnectionPool::new(connector, Duration::from_secs(60), 4);
        assert!(matches!(
            pool.borrow(&peer()).await,
            Err(MessagingError::ConnectFailed { .. })
        ));
        assert_eq!(pool.established_count(), 0);
    }

    #[tokio::test]
    async fn test_idle_cap() {
        let pool = ConnectionPool::new(MemoryConnector::new(), Duration::from_secs(60), 1);
        let a = pool.borrow(&peer()).await.unwrap().connection;
        let b = pool.borrow(&peer()).await.unwrap().connection;
        let b_liveness = b.liveness().clone();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle_count(&peer()), 1);
        assert!(!b_liveness.is_open());
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let pool = ConnectionPool::new(MemoryConnector::new(), Duration::from_millis(10), 4);
        let conn = pool.borrow(&peer()).await.unwrap().connection;
        let liveness = conn.liveness().clone();
        pool.release(conn);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(pool.idle_count(&peer()), 0);
        assert!(!liveness.is_open());
    }

    #[tokio::test]
    async fn test_close_refuses_returns() {
        let pool = ConnectionPool::new(MemoryConnector::new(), Duration::from_secs(60), 4);
        let a = pool.borrow(&peer()).await.unwrap().connection;
        let b = pool.borrow(&peer()).await.unwrap().connection;
        pool.release(a);
        pool.close();
        assert_eq!(pool.idle_count(&peer()), 0);
        pool.release(b);
        assert_eq!(pool.idle_count(&peer()), 0);
    }

    #[tokio::test]
    async fn test_write_frame() {
        let pool = ConnectionPool::new(MemoryConnector::new(), Duration::from_secs(60), 4);
        let mut conn = pool.borrow(&peer()).await.unwrap().connection;
        conn.write_frame(b"frame").await.unwrap();
        assert!(conn.is_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_borrowers_never_share() {
        let pool = Arc::new(ConnectionPool::new(
            MemoryConnector::new(),
            Duration::from_secs(60),
            4,
        ));
        let in_use = Arc::new(Mutex::new(HashSet::new()));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            tasks.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let mut conn = pool.borrow(&peer()).await.unwrap().connection;
                    assert!(
                        in_use.lock().unwrap().insert(conn.id()),
                        "connection {} borrowed twice",
                        conn.id()
                    );
                    conn.write_frame(b"x").await.unwrap();
                    tokio::task::yield_now().await;
                    in_use.lock().unwrap().remove(&conn.id());
                    pool.release(conn);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(pool.idle_count(&peer()) <= 4);
    }
}
