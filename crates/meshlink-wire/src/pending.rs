//! Pending-request table.
//!
//! Correlates outbound request ids with the callers waiting for their reply.
//! Entries live in a concurrent map; their deadlines live in a min-heap that
//! [`PendingRequests::sweep_expired`] drains on a fixed interval. Whoever
//! removes an entry from the map resolves it, so each entry is resolved
//! exactly once: by a reply, by an explicit failure, or by expiry.
//!
//! Deadlines of answered requests stay in the heap until they come due.
//! Once the heap holds more than twice `capacity` deadlines it is compacted,
//! so its size stays bounded by the table capacity.

use bytes::Bytes;
use dashmap::DashMap;
use meshlink_types::{MessagingError, MessagingResult};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

struct PendingEntry {
    reply: oneshot::Sender<MessagingResult<Bytes>>,
    created_at: Instant,
}

/// Caller side of a pending request; resolves to the reply payload or an error.
#[derive(Debug)]
pub struct ReplyHandle {
    id: u64,
    rx: oneshot::Receiver<MessagingResult<Bytes>>,
}

impl ReplyHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for ReplyHandle {
    type Output = MessagingResult<Bytes>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(MessagingError::NotRunning)))
    }
}

/// Bounded table of outstanding requests.
pub struct PendingRequests {
    entries: DashMap<u64, PendingEntry>,
    deadlines: Mutex<BinaryHeap<Reverse<(Instant, u64)>>>,
    capacity: usize,
    closed: AtomicBool,
}

impl PendingRequests {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            deadlines: Mutex::new(BinaryHeap::new()),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Register request `id`, expiring after `ttl`.
    ///
    /// A `ttl` too large to represent as a deadline never expires; the entry
    /// is then resolved only by a reply or by [`fail_all`](Self::fail_all).
    /// After `fail_all` the table is closed and new entries resolve at once
    /// with [`MessagingError::NotRunning`].
    pub fn register(&self, id: u64, ttl: Duration) -> MessagingResult<ReplyHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::NotRunning);
        }
        if self.entries.len() >= self.capacity {
            return Err(MessagingError::TooManyPending {
                capacity: self.capacity,
            });
        }
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        self.entries.insert(
            id,
            PendingEntry {
                reply: tx,
                created_at: now,
            },
        );
        // Pairs with the store in `fail_all`: either its scan sees this entry
        // or this load sees the flag.
        if self.closed.load(Ordering::SeqCst) {
            self.fail(id, MessagingError::NotRunning);
            return Ok(ReplyHandle { id, rx });
        }

        if let Some(deadline) = now.checked_add(ttl) {
            let mut deadlines = self.deadlines.lock().unwrap_or_else(|e| e.into_inner());
            deadlines.push(Reverse((deadline, id)));
            if deadlines.len() > self.capacity.saturating_mul(2) {
                deadlines.retain(|Reverse((_, id))| self.entries.contains_key(id));
            }
        }
        Ok(ReplyHandle { id, rx })
    }

    /// Resolve `id` with a reply payload. Returns `false` if the id is not
    /// pending (already answered, failed or expired).
    pub fn complete(&self, id: u64, payload: Bytes) -> bool {
        self.resolve(id, Ok(payload))
    }

    /// Resolve `id` with an error. Same no-op semantics as [`complete`](Self::complete).
    pub fn fail(&self, id: u64, error: MessagingError) -> bool {
        self.resolve(id, Err(error))
    }

    /// Expire every entry whose deadline is at or before `now`.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let mut expired = 0;
        let mut deadlines = self.deadlines.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(Reverse((deadline, id))) = deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            deadlines.pop();
            if let Some((_, entry)) = self.entries.remove(&id) {
                debug!(
                    id,
                    waited_ms = entry.created_at.elapsed().as_millis() as u64,
                    "Request timed out"
                );
                let _ = entry.reply.send(Err(MessagingError::Timeout { id }));
                expired += 1;
            }
        }
        expired
    }

    /// Fail every outstanding request and close the table (service shutdown).
    pub fn fail_all(&self, error: MessagingError) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        let failed = ids
            .into_iter()
            .filter(|id| self.fail(*id, error.clone()))
            .count();
        self.deadlines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        failed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn deadline_count(&self) -> usize {
        self.deadlines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn resolve(&self, id: u64, result: MessagingResult<Bytes>) -> bool {
        match self.entries.remove(&id) {
            Some((_, entry)) => {
                // The caller may have stopped waiting; that is not an error here.
                let _ = entry.reply.send(result);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_complete_resolves_handle() {
        let table = PendingRequests::new(16);
        let handle = table.register(1, Duration::from_secs(10)).unwrap();
        assert!(table.complete(1, Bytes::from_static(b"pong")));
        assert_eq!(handle.await.unwrap(), Bytes::from_static(b"pong"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_handle_pending_until_resolved() {
        let table = PendingRequests::new(16);
        let mut handle =
            tokio_test::task::spawn(table.register(2, Duration::from_secs(10)).unwrap());
        tokio_test::assert_pending!(handle.poll());

        table.complete(2, Bytes::from_static(b"done"));
        assert!(handle.is_woken());
        tokio_test::assert_ready_eq!(handle.poll(), Ok(Bytes::from_static(b"done")));
    }

    #[tokio::test]
    async fn test_duplicate_reply_is_noop() {
        let table = PendingRequests::new(16);
        let handle = table.register(5, Duration::from_secs(10)).unwrap();
        assert!(table.complete(5, Bytes::from_static(b"first")));
        assert!(!table.complete(5, Bytes::from_static(b"second")));
        assert_eq!(handle.await.unwrap(), Bytes::from_static(b"first"));
    }

    #[tokio::test]
    async fn test_unknown_id_is_noop() {
        let table = PendingRequests::new(16);
        assert!(!table.complete(77, Bytes::new()));
        assert!(!table.fail(77, MessagingError::NotRunning));
    }

    #[tokio::test]
    async fn test_expiry_resolves_with_timeout() {
        let table = PendingRequests::new(16);
        let handle = table.register(9, Duration::from_millis(5)).unwrap();
        assert_eq!(table.sweep_expired(Instant::now()), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(table.sweep_expired(Instant::now()), 1);
        assert_eq!(handle.await, Err(MessagingError::Timeout { id: 9 }));
    }

    #[tokio::test]
    async fn test_late_reply_after_timeout() {
        let table = PendingRequests::new(16);
        let handle = table.register(3, Duration::ZERO).unwrap();
        assert_eq!(table.sweep_expired(Instant::now()), 1);
        assert!(!table.complete(3, Bytes::from_static(b"late")));
        assert_eq!(handle.await, Err(MessagingError::Timeout { id: 3 }));
    }

    #[tokio::test]
    async fn test_completed_entries_skipped_by_sweep() {
        let table = PendingRequests::new(16);
        let _a = table.register(1, Duration::ZERO).unwrap();
        let b = table.register(2, Duration::ZERO).unwrap();
        table.complete(1, Bytes::new());
        assert_eq!(table.sweep_expired(Instant::now()), 1);
        assert_eq!(b.await, Err(MessagingError::Timeout { id: 2 }));
    }

    #[test]
    fn test_capacity_bound() {
        let table = PendingRequests::new(2);
        let _a = table.register(1, Duration::from_secs(1)).unwrap();
        let _b = table.register(2, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            table.register(3, Duration::from_secs(1)),
            Err(MessagingError::TooManyPending { capacity: 2 })
        ));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let table = PendingRequests::new(16);
        let a = table.register(1, Duration::from_secs(10)).unwrap();
        let b = table.register(2, Duration::from_secs(10)).unwrap();
        assert_eq!(table.fail_all(MessagingError::NotRunning), 2);
        assert_eq!(a.await, Err(MessagingError::NotRunning));
        assert_eq!(b.await, Err(MessagingError::NotRunning));
    }

    #[tokio::test]
    async fn test_unrepresentable_ttl_never_expires() {
        let table = PendingRequests::new(16);
        let handle = table.register(4, Duration::MAX).unwrap();
        assert_eq!(table.sweep_expired(Instant::now()), 0);
        assert_eq!(table.len(), 1);
        assert!(table.complete(4, Bytes::from_static(b"eventually")));
        assert_eq!(handle.await.unwrap(), Bytes::from_static(b"eventually"));
    }

    #[tokio::test]
    async fn test_register_after_fail_all() {
        let table = PendingRequests::new(16);
        table.fail_all(MessagingError::NotRunning);
        assert!(matches!(
            table.register(8, Duration::from_secs(10)),
            Err(MessagingError::NotRunning)
        ));
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_register_racing_fail_all_never_hangs() {
        let table = Arc::new(PendingRequests::new(4096));
        let registrar = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                (0..2000u64)
                    .filter_map(|id| table.register(id, Duration::from_secs(60)).ok())
                    .collect::<Vec<_>>()
            })
        };
        let closer = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.fail_all(MessagingError::NotRunning) })
        };
        let handles = registrar.await.unwrap();
        closer.await.unwrap();

        for handle in handles {
            let outcome = tokio::time::timeout(Duration::from_secs(5), handle).await;
            assert_eq!(outcome.unwrap(), Err(MessagingError::NotRunning));
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_deadline_heap_stays_bounded() {
        let table = PendingRequests::new(4);
        for id in 0..100 {
            let _handle = table.register(id, Duration::from_secs(60)).unwrap();
            table.complete(id, Bytes::new());
        }
        assert!(table.deadline_count() <= 8);
        assert!(table.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_race_reply_against_expiry() {
        let table = Arc::new(PendingRequests::new(4096));
        let mut handles = Vec::new();
        for id in 0..1000 {
            handles.push(table.register(id, Duration::ZERO).unwrap());
        }

        let replier = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                (0..1000u64)
                    .filter(|id| table.complete(*id, Bytes::new()))
                    .count()
            })
        };
        let sweeper = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.sweep_expired(Instant::now()) })
        };
        let completed = replier.await.unwrap();
        let expired = sweeper.await.unwrap();
        let expired = expired + table.sweep_expired(Instant::now());

        assert_eq!(completed + expired, 1000);
        for handle in handles {
            handle.await.ok();
        }
        assert!(table.is_empty());
    }
}
