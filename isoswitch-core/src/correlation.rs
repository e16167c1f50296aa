//! Correlation store: pending requests awaiting their reply.
//!
//! Maps a correlation key to the connection that originated the request.
//! Entries expire after a fixed TTL, lazily on lookup and periodically via a
//! background sweeper. Every insertion is stamped with a store-wide sequence
//! number, and expiry only removes the exact insertion it observed: a fresh
//! `put` for the same key survives a concurrent sweep.
//!
//! Each entry also carries the destination slot for the forwarded request.
//! Settling the entry releases the destination's in-flight counter exactly
//! once, whether the entry is answered, fails, or expires.

use dashmap::DashMap;
use flume::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::Result;

/// Minimum sweep period, so a tiny TTL cannot spin the sweeper.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
enum DestinationSlot {
    Pending,
    Bound(Arc<Connection>),
    Settled,
}

/// One pending request.
#[derive(Debug)]
pub struct CorrelationEntry {
    origin: Arc<Connection>,
    created: Instant,
    seq: u64,
    destination: Mutex<DestinationSlot>,
}

impl CorrelationEntry {
    /// Connection the request arrived on; the reply goes back here.
    #[inline]
    pub fn origin(&self) -> &Arc<Connection> {
        &self.origin
    }

    #[inline]
    pub const fn created(&self) -> Instant {
        self.created
    }

    /// Insertion stamp, unique per store.
    #[inline]
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    /// Connection the request was forwarded through, if bound and unsettled.
    pub fn destination(&self) -> Option<Arc<Connection>> {
        match &*self.destination.lock() {
            DestinationSlot::Bound(conn) => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    #[inline]
    pub fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.created) >= ttl
    }

    /// Record the connection the request was forwarded through.
    ///
    /// The caller has already acquired one in-flight slot on `conn`. If the
    /// entry was settled in the meantime the slot is released immediately.
    pub fn bind_destination(&self, conn: Arc<Connection>) {
        let mut slot = self.destination.lock();
        match std::mem::replace(&mut *slot, DestinationSlot::Settled) {
            DestinationSlot::Settled => conn.release(),
            DestinationSlot::Bound(previous) => {
                previous.release();
                *slot = DestinationSlot::Bound(conn);
            }
            DestinationSlot::Pending => *slot = DestinationSlot::Bound(conn),
        }
    }

    /// Complete the entry. Returns `true` if this call released a destination.
    pub fn settle(&self) -> bool {
        let previous = std::mem::replace(&mut *self.destination.lock(), DestinationSlot::Settled);
        match previous {
            DestinationSlot::Bound(conn) => {
                conn.release();
                true
            }
            _ => false,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.destination.lock(), DestinationSlot::Settled)
    }
}

/// Concurrent key → pending request map with TTL expiry.
#[derive(Debug)]
pub struct CorrelationStore {
    entries: DashMap<String, Arc<CorrelationEntry>>,
    ttl: Duration,
    next_seq: AtomicU64,
}

impl CorrelationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            next_seq: AtomicU64::new(1),
        }
    }

    #[inline]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Remember the origin of a request.
    ///
    /// On a key collision the newer request wins; the displaced entry is
    /// settled.
    pub fn put(&self, key: impl Into<String>, origin: Arc<Connection>) -> Arc<CorrelationEntry> {
        let key = key.into();
        let entry = Arc::new(CorrelationEntry {
            origin,
            created: Instant::now(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            destination: Mutex::new(DestinationSlot::Pending),
        });

        if let Some(displaced) = self.entries.insert(key.clone(), Arc::clone(&entry)) {
            debug!(
                key = %key,
                origin = %displaced.origin.id(),
                "[Correlation] Pending entry overwritten"
            );
            displaced.settle();
        }
        entry
    }

    /// Look up a pending request. Expired entries are removed and not returned.
    pub fn get(&self, key: &str) -> Option<Arc<CorrelationEntry>> {
        let entry = self.entries.get(key).map(|e| Arc::clone(e.value()))?;
        if entry.is_expired(self.ttl, Instant::now()) {
            self.expire(key, &entry);
            return None;
        }
        Some(entry)
    }

    /// Remove whatever entry is stored under `key`.
    pub fn remove(&self, key: &str) -> Option<Arc<CorrelationEntry>> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    /// Remove `key` only if it still holds `entry`.
    pub fn remove_entry(&self, key: &str, entry: &CorrelationEntry) -> bool {
        self.entries
            .remove_if(key, |_, current| current.seq == entry.seq)
            .is_some()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        // Collect first: no shard guard may be held across remove_if.
        let expired: Vec<(String, Arc<CorrelationEntry>)> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(self.ttl, now))
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        expired
            .into_iter()
            .filter(|(key, entry)| self.expire(key, entry))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run [`sweep`](Self::sweep) every TTL on a background thread.
    ///
    /// The thread exits when the handle is stopped or dropped, or when the
    /// store itself is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Result<SweeperHandle> {
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let store: Weak<Self> = Arc::downgrade(self);
        let interval = self.ttl.max(MIN_SWEEP_INTERVAL);

        let thread = std::thread::Builder::new()
            .name("isoswitch-sweeper".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(store) = store.upgrade() else { break };
                        let removed = store.sweep();
                        if removed > 0 {
                            trace!(removed, remaining = store.len(), "[Correlation] Swept expired entries");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(SweeperHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn expire(&self, key: &str, entry: &CorrelationEntry) -> bool {
        if self.remove_entry(key, entry) {
            entry.settle();
            trace!(key, age_ms = entry.created.elapsed().as_millis() as u64, "[Correlation] Entry expired");
            true
        } else {
            false
        }
    }
}

/// Owns the sweeper thread.
#[derive(Debug)]
pub struct SweeperHandle {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for its thread.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_connection;
    use std::thread;

    #[test]
    fn test_put_get_remove() {
        let store = CorrelationStore::new(Duration::from_secs(30));
        let (a, _rx) = test_connection("10.0.0.1:4000");

        store.put("pay|123456|ABCDEF", Arc::clone(&a));
        let found = store.get("pay|123456|ABCDEF").unwrap();
        assert_eq!(found.origin().id(), a.id());

        assert!(store.remove("pay|123456|ABCDEF").is_some());
        assert!(store.get("pay|123456|ABCDEF").is_none());
    }

    #[test]
    fn test_get_after_ttl() {
        let store = CorrelationStore::new(Duration::from_millis(40));
        let (a, _rx) = test_connection("10.0.0.1:4000");
        store.put("k", a);

        thread::sleep(Duration::from_millis(80));
        assert!(store.get("k").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_fresh_put_survives_stale_expiry() {
        let store = CorrelationStore::new(Duration::from_millis(40));
        let (a, _ra) = test_connection("10.0.0.1:4000");
        let (b, _rb) = test_connection("10.0.0.2:4000");

        let stale = store.put("k", a);
        thread::sleep(Duration::from_millis(80));
        store.put("k", Arc::clone(&b));

        // An expiry that observed the old entry must not remove the new one.
        assert!(!store.remove_entry("k", &stale));
        assert_eq!(store.sweep(), 0);
        assert_eq!(store.get("k").unwrap().origin().id(), b.id());
    }

    #[test]
    fn test_fresh_put_with_concurrent_sweeper() {
        let store = Arc::new(CorrelationStore::new(Duration::from_millis(20)));
        let mut sweeper = store.spawn_sweeper().unwrap();
        let (a, _ra) = test_connection("10.0.0.1:4000");
        let (b, _rb) = test_connection("10.0.0.2:4000");

        store.put("k", a);
        thread::sleep(Duration::from_millis(30));
        store.put("k", Arc::clone(&b));
        assert_eq!(store.get("k").unwrap().origin().id(), b.id());

        thread::sleep(Duration::from_millis(60));
        assert!(store.get("k").is_none());
        sweeper.stop();
    }

    #[test]
    fn test_sweep_counts_expired() {
        let store = CorrelationStore::new(Duration::from_millis(20));
        let (a, _rx) = test_connection("10.0.0.1:4000");
        store.put("a", Arc::clone(&a));
        store.put("b", Arc::clone(&a));
        thread::sleep(Duration::from_millis(40));
        store.put("c", a);

        assert_eq!(store.sweep(), 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_settle_releases_once() {
        let store = CorrelationStore::new(Duration::from_secs(30));
        let (origin, _ro) = test_connection("10.0.0.1:4000");
        let (dest, _rd) = test_connection("10.0.0.2:4000");

        let entry = store.put("k", origin);
        dest.acquire();
        entry.bind_destination(Arc::clone(&dest));
        assert_eq!(dest.in_flight(), 1);

        assert!(entry.settle());
        assert!(!entry.settle());
        assert_eq!(dest.in_flight(), 0);
    }

    #[test]
    fn test_bind_after_settle_releases() {
        let store = CorrelationStore::new(Duration::from_secs(30));
        let (origin, _ro) = test_connection("10.0.0.1:4000");
        let (dest, _rd) = test_connection("10.0.0.2:4000");

        let entry = store.put("k", origin);
        entry.settle();
        dest.acquire();
        entry.bind_destination(Arc::clone(&dest));
        assert_eq!(dest.in_flight(), 0);
        assert!(entry.destination().is_none());
    }

    #[test]
    fn test_expiry_releases_destination() {
        let store = CorrelationStore::new(Duration::from_millis(20));
        let (origin, _ro) = test_connection("10.0.0.1:4000");
        let (dest, _rd) = test_connection("10.0.0.2:4000");

        let entry = store.put("k", origin);
        dest.acquire();
        entry.bind_destination(Arc::clone(&dest));

        thread::sleep(Duration::from_millis(40));
        assert_eq!(store.sweep(), 1);
        assert_eq!(dest.in_flight(), 0);
    }

    #[test]
    fn test_overwrite_settles_displaced() {
        let store = CorrelationStore::new(Duration::from_secs(30));
        let (origin, _ro) = test_connection("10.0.0.1:4000");
        let (dest, _rd) = test_connection("10.0.0.2:4000");

        let first = store.put("k", Arc::clone(&origin));
        dest.acquire();
        first.bind_destination(Arc::clone(&dest));

        store.put("k", origin);
        assert!(first.is_settled());
        assert_eq!(dest.in_flight(), 0);
    }
}
