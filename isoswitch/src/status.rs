//! Read-only status snapshots for administration.

use isoswitch_core::connection::{Connection, ConnectionId, SocketKey};
use isoswitch_core::endpoint::SocketEndpoint;
use isoswitch_core::reconnect::LinkState;
use std::net::SocketAddr;
use std::time::Duration;

/// One live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub endpoint: SocketEndpoint,
    pub in_flight: usize,
    pub age: Duration,
}

impl From<&Connection> for ConnectionInfo {
    fn from(conn: &Connection) -> Self {
        Self {
            id: conn.id(),
            remote: conn.remote_addr(),
            local: conn.local_addr(),
            endpoint: conn.endpoint().clone(),
            in_flight: conn.in_flight(),
            age: conn.opened_at().elapsed(),
        }
    }
}

/// Link state of one client target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub target: SocketEndpoint,
    pub state: LinkState,
    pub retry_count: u32,
}

/// Snapshot of one logical socket.
#[derive(Debug, Clone)]
pub struct SocketStatus {
    pub key: SocketKey,
    /// At least one connection is active
    pub up: bool,
    /// Bound address of a running listener
    pub listening: Option<SocketAddr>,
    pub connections: Vec<ConnectionInfo>,
    /// Per-target links (client sockets only)
    pub links: Vec<LinkStatus>,
}

impl SocketStatus {
    /// Sum of in-flight counters over all connections.
    pub fn in_flight(&self) -> usize {
        self.connections.iter().map(|c| c.in_flight).sum()
    }
}
