//! Pending-requests table.
//!
//! Correlation id → waiter. Sharded so concurrent requests on one connection
//! do not contend on a single lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::protocol::Response;
use crate::types::{CorrelationId, Error, Result};

const SHARD_COUNT: usize = 8;

pub(crate) type Waiter = oneshot::Sender<Result<Response>>;

#[derive(Debug)]
enum Entry {
    Waiting(Waiter),
    /// Deadline expired at the given instant; a late response is discarded.
    Abandoned(Instant),
}

/// What happened to an incoming response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Delivered,
    /// The waiter gave up (deadline) or was dropped (caller cancelled).
    Discarded,
    Unknown,
}

#[derive(Debug)]
pub struct PendingRequests {
    shards: Vec<Mutex<HashMap<CorrelationId, Entry>>>,
    next: AtomicU64,
    closed: AtomicBool,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            next: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn shard(&self, id: CorrelationId) -> MutexGuard<'_, HashMap<CorrelationId, Entry>> {
        self.shards[(id.0 as usize) % self.shards.len()]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a correlation id and register its waiter.
    pub fn register(&self) -> Result<(CorrelationId, oneshot::Receiver<Result<Response>>)> {
        let id = CorrelationId(self.next.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let mut shard = self.shard(id);
        // Checked under the shard lock: fail_all sets the flag before draining.
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::connection_lost("connection closed"));
        }
        shard.insert(id, Entry::Waiting(tx));
        Ok((id, rx))
    }

    /// Route a response to its waiter.
    pub fn complete(&self, id: CorrelationId, response: Response) -> Completion {
        match self.shard(id).remove(&id) {
            Some(Entry::Waiting(tx)) => {
                if tx.send(Ok(response)).is_ok() {
                    Completion::Delivered
                } else {
                    Completion::Discarded
                }
            }
            Some(Entry::Abandoned(_)) => Completion::Discarded,
            None => Completion::Unknown,
        }
    }

    /// Mark an entry abandoned after its deadline expired.
    ///
    /// Entries abandoned more than `retain` ago are dropped on the way; a
    /// response arriving after that is reported as `Unknown`.
    pub fn abandon(&self, id: CorrelationId, retain: Duration) {
        let now = Instant::now();
        if let Some(entry) = self.shard(id).get_mut(&id) {
            *entry = Entry::Abandoned(now);
        }
        let mut swept = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|e| e.into_inner());
            let before = shard.len();
            shard.retain(|_, entry| match entry {
                Entry::Abandoned(at) => now.duration_since(*at) <= retain,
                Entry::Waiting(_) => true,
            });
            swept += before - shard.len();
        }
        if swept > 0 {
            tracing::debug!(swept, "abandoned requests dropped");
        }
    }

    /// Drop an entry whose request never reached the wire.
    pub fn forget(&self, id: CorrelationId) {
        self.shard(id).remove(&id);
    }

    /// Fail every waiter and refuse new registrations.
    pub fn fail_all(&self, reason: &str) -> usize {
        self.closed.store(true, Ordering::Release);
        let mut failed = 0;
        for shard in &self.shards {
            let drained: Vec<_> = shard
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain()
                .collect();
            for (_, entry) in drained {
                if let Entry::Waiting(tx) = entry {
                    let _ = tx.send(Err(Error::connection_lost(reason.to_string())));
                    failed += 1;
                }
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_complete_delivers_to_waiter() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register().unwrap();
        assert_eq!(pending.complete(id, Response::Ok), Completion::Delivered);
        assert_eq!(rx.await.unwrap().unwrap(), Response::Ok);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_outstanding_ids_are_distinct() {
        let pending = PendingRequests::new();
        let mut seen = HashSet::new();
        let mut receivers = Vec::new();
        for _ in 0..100 {
            let (id, rx) = pending.register().unwrap();
            assert!(seen.insert(id));
            receivers.push(rx);
        }
        assert_eq!(pending.len(), 100);
    }

    #[test]
    fn test_unknown_and_abandoned() {
        let pending = PendingRequests::new();
        assert_eq!(pending.complete(CorrelationId(42), Response::Ok), Completion::Unknown);

        let (id, _rx) = pending.register().unwrap();
        pending.abandon(id, Duration::from_secs(30));
        assert_eq!(pending.complete(id, Response::Ok), Completion::Discarded);
        assert_eq!(pending.complete(id, Response::Ok), Completion::Unknown);
    }

    #[tokio::test]
    async fn test_stale_abandoned_entries_are_swept() {
        let pending = PendingRequests::new();
        let retain = Duration::from_millis(20);
        let (stale, _rx1) = pending.register().unwrap();
        let (waiting, _rx2) = pending.register().unwrap();
        pending.abandon(stale, retain);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (recent, _rx3) = pending.register().unwrap();
        pending.abandon(recent, retain);

        assert_eq!(pending.len(), 2);
        assert_eq!(pending.complete(stale, Response::Ok), Completion::Unknown);
        assert_eq!(pending.complete(recent, Response::Ok), Completion::Discarded);
        assert_eq!(pending.complete(waiting, Response::Ok), Completion::Delivered);
    }

    #[test]
    fn test_dropped_waiter_is_discarded() {
        let pending = PendingRequests::new();
        let (id, rx) = pending.register().unwrap();
        drop(rx);
        assert_eq!(pending.complete(id, Response::Ok), Completion::Discarded);
    }

    #[tokio::test]
    async fn test_fail_all_reports_connection_lost() {
        let pending = PendingRequests::new();
        let (_, rx1) = pending.register().unwrap();
        let (_, rx2) = pending.register().unwrap();

        assert_eq!(pending.fail_all("peer hung up"), 2);
        assert!(rx1.await.unwrap().unwrap_err().is_connection_lost());
        assert!(rx2.await.unwrap().unwrap_err().is_connection_lost());
        assert!(pending.register().is_err());
    }
}
