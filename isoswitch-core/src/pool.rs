//! Per-socket connection pool.
//!
//! A pool tracks the live connections of one logical socket (a listener, or
//! one client target). Connections are admitted through the socket's
//! [`AccessList`], indexed by id and by endpoint key, and exposed to the
//! selection strategies as an immutable [`VersionedCandidates`] snapshot.
//!
//! The snapshot is regenerated wholesale under a membership mutex on every
//! add or remove. Readers (the send path) only load the current `Arc`.

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::candidates::VersionedCandidates;
use crate::connection::{Connection, ConnectionId, SocketKey};
use crate::endpoint::{AccessList, SocketEndpoint};
use crate::error::GatewayError;

/// Candidate snapshot type published by a pool.
pub type PoolSnapshot = VersionedCandidates<Arc<Connection>>;

type EndpointIds = SmallVec<[ConnectionId; 4]>;

/// Live connections of one logical socket.
pub struct ConnectionPool {
    socket: SocketKey,
    access: ArcSwap<AccessList>,
    by_id: DashMap<ConnectionId, Arc<Connection>>,
    by_endpoint: DashMap<String, EndpointIds>,
    snapshot: ArcSwap<PoolSnapshot>,
    version: AtomicU64,
    membership: Mutex<()>,
}

impl ConnectionPool {
    pub fn new(socket: SocketKey, access: AccessList) -> Self {
        Self {
            socket,
            access: ArcSwap::from_pointee(access),
            by_id: DashMap::new(),
            by_endpoint: DashMap::new(),
            snapshot: ArcSwap::from_pointee(VersionedCandidates::empty()),
            version: AtomicU64::new(0),
            membership: Mutex::new(()),
        }
    }

    #[inline]
    pub const fn socket(&self) -> &SocketKey {
        &self.socket
    }

    /// Current allow-list.
    pub fn access_list(&self) -> Arc<AccessList> {
        self.access.load_full()
    }

    /// Endpoint a remote would be admitted as, or `None` if it is not allowed.
    ///
    /// Listeners call this before building the connection handle so the
    /// handle carries the weight and priority of the matching entry.
    pub fn resolve_endpoint(&self, remote: SocketAddr) -> Option<SocketEndpoint> {
        self.access.load().resolve(remote)
    }

    /// Register a connection.
    ///
    /// Returns `false` and closes the connection when its remote address is
    /// not admitted by the allow-list; the pool is left unchanged.
    pub fn add_connection(&self, conn: Arc<Connection>) -> bool {
        if self.resolve_endpoint(conn.remote_addr()).is_none() {
            let err = GatewayError::PoolRejected(conn.remote_addr().to_string());
            warn!(socket = %self.socket, connection = %conn.id(), "[Pool] {}", err);
            conn.close();
            return false;
        }

        let id = conn.id();
        let key = conn.endpoint().key();
        {
            let _membership = self.membership.lock();
            self.by_endpoint.entry(key.clone()).or_default().push(id);
            self.by_id.insert(id, conn);
            self.regenerate();
        }

        debug!(socket = %self.socket, connection = %id, endpoint = %key, "[Pool] Connection added");
        true
    }

    /// Unregister a connection. Returns `true` if it was present.
    pub fn remove_connection(&self, conn: &Connection) -> bool {
        let _membership = self.membership.lock();
        let Some((id, removed)) = self.by_id.remove(&conn.id()) else {
            return false;
        };
        self.unindex(&removed.endpoint().key(), id);
        self.regenerate();
        trace!(socket = %self.socket, connection = %id, "[Pool] Connection removed");
        true
    }

    /// Force-close and remove every connection admitted under an endpoint key.
    ///
    /// Returns the number of connections closed.
    pub fn remove_by_endpoint(&self, key: &str) -> usize {
        let _membership = self.membership.lock();
        let Some((_, ids)) = self.by_endpoint.remove(key) else {
            return 0;
        };

        let mut closed = 0;
        for id in ids {
            if let Some((_, conn)) = self.by_id.remove(&id) {
                conn.close();
                closed += 1;
            }
        }
        if closed > 0 {
            self.regenerate();
        }
        debug!(socket = %self.socket, endpoint = key, closed, "[Pool] Endpoint removed");
        closed
    }

    /// Swap the allow-list.
    ///
    /// Returns the endpoint keys of live connections the new list no longer
    /// admits. Callers tear those down with [`remove_by_endpoint`].
    ///
    /// [`remove_by_endpoint`]: Self::remove_by_endpoint
    pub fn replace_access_list(&self, access: AccessList) -> Vec<String> {
        let mut revoked: Vec<String> = self
            .by_id
            .iter()
            .filter(|entry| access.resolve(entry.value().remote_addr()).is_none())
            .map(|entry| entry.value().endpoint().key())
            .collect();
        revoked.sort_unstable();
        revoked.dedup();

        self.access.store(Arc::new(access));
        debug!(socket = %self.socket, revoked = revoked.len(), "[Pool] Allow-list replaced");
        revoked
    }

    /// Remove registered connections that are no longer active.
    ///
    /// Pumps unregister their connection once the stream is torn down; this
    /// drops closed connections from the snapshot before that happens.
    /// Returns the number removed.
    pub fn evict_inactive(&self) -> usize {
        let _membership = self.membership.lock();
        let stale: Vec<(ConnectionId, String)> = self
            .by_id
            .iter()
            .filter(|entry| !entry.value().is_active())
            .map(|entry| (*entry.key(), entry.value().endpoint().key()))
            .collect();
        let mut evicted = 0;
        for (id, key) in stale {
            if self.by_id.remove(&id).is_some() {
                self.unindex(&key, id);
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.regenerate();
            debug!(socket = %self.socket, evicted, "[Pool] Inactive connections evicted");
        }
        evicted
    }

    /// Close and remove every connection. Returns the number closed.
    pub fn close_all(&self) -> usize {
        let _membership = self.membership.lock();
        let ids: Vec<ConnectionId> = self.by_id.iter().map(|entry| *entry.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, conn)) = self.by_id.remove(&id) {
                conn.close();
                closed += 1;
            }
        }
        self.by_endpoint.clear();
        self.regenerate();
        closed
    }

    /// Look up a connection by id.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.by_id.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Active connections, ordered by id.
    pub fn active_connections(&self) -> Vec<Arc<Connection>> {
        self.snapshot
            .load()
            .items()
            .iter()
            .filter(|c| c.is_active())
            .cloned()
            .collect()
    }

    /// Current candidate snapshot.
    #[inline]
    pub fn candidates(&self) -> Arc<PoolSnapshot> {
        self.snapshot.load_full()
    }

    /// Number of registered connections that are still active.
    pub fn active_count(&self) -> usize {
        self.by_id.iter().filter(|entry| entry.value().is_active()).count()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn unindex(&self, key: &str, id: ConnectionId) {
        if let Some(mut ids) = self.by_endpoint.get_mut(key) {
            ids.retain(|other| *other != id);
        }
        self.by_endpoint.remove_if(key, |_, ids| ids.is_empty());
    }

    // Caller holds the membership lock.
    fn regenerate(&self) {
        let mut items: Vec<Arc<Connection>> = self
            .by_id
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        items.sort_unstable_by_key(|c| c.id());

        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        trace!(socket = %self.socket, version, size = items.len(), "[Pool] Snapshot regenerated");
        self.snapshot
            .store(Arc::new(VersionedCandidates::new(version, items)));
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("socket", &self.socket)
            .field("connections", &self.by_id.len())
            .field("version", &self.version.load(Ordering::Relaxed))
            .finish()
    }
}
