//! Live connection handle (protocol-agnostic core).
//!
//! One [`Connection`] == one TCP connection.
//!
//! The handle is shared (`Arc`) between the I/O loop that owns the stream, the
//! connection pool, the selection strategies and the routing pipeline. It
//! never owns the socket itself: writes are queued on a flume channel and
//! drained by the single writer task of the connection, which gives
//! per-connection write ordering without locks.
//!
//! A handle is created on connect and dropped on disconnect. It is never
//! reused across reconnects.

use bytes::Bytes;
use flume::{Receiver, Sender};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::endpoint::SocketEndpoint;
use crate::error::{GatewayError, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Role of a logical socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SocketRole {
    /// Listener: accepts inbound TCP connections
    Server,
    /// Outbound client connections
    Client,
}

impl SocketRole {
    /// The role that carries traffic in the other direction.
    #[inline]
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Server => Self::Client,
            Self::Client => Self::Server,
        }
    }
}

impl fmt::Display for SocketRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// Identity of a logical socket: role + channel name.
///
/// Keys the transport registry and tags every connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketKey {
    pub role: SocketRole,
    pub channel: String,
}

impl SocketKey {
    pub fn new(role: SocketRole, channel: impl Into<String>) -> Self {
        Self {
            role,
            channel: channel.into(),
        }
    }

    pub fn server(channel: impl Into<String>) -> Self {
        Self::new(SocketRole::Server, channel)
    }

    pub fn client(channel: impl Into<String>) -> Self {
        Self::new(SocketRole::Client, channel)
    }
}

impl fmt::Display for SocketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.role, self.channel)
    }
}

/// Commands from the gateway to a connection's writer task
#[derive(Debug)]
pub enum ConnCommand {
    /// Write one frame payload (framing is applied by the writer)
    Write(Bytes),
    /// Close the connection
    Close,
}

/// Shared handle to one live TCP connection.
pub struct Connection {
    id: ConnectionId,
    socket: SocketKey,
    endpoint: SocketEndpoint,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    in_flight: AtomicUsize,
    active: AtomicBool,
    opened_at: Instant,
    cmd_tx: Sender<ConnCommand>,
}

impl Connection {
    /// Create a handle and the command receiver its writer task drains.
    pub fn new(
        socket: SocketKey,
        endpoint: SocketEndpoint,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> (Arc<Self>, Receiver<ConnCommand>) {
        let (cmd_tx, cmd_rx) = flume::unbounded();
        let conn = Arc::new(Self {
            id: ConnectionId::next(),
            socket,
            endpoint,
            local_addr,
            remote_addr,
            in_flight: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            opened_at: Instant::now(),
            cmd_tx,
        });
        (conn, cmd_rx)
    }

    #[inline]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub const fn socket(&self) -> &SocketKey {
        &self.socket
    }

    #[inline]
    pub const fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }

    #[inline]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[inline]
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Whether the connection is open.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Messages sent through this connection and not yet completed.
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Count one more in-flight message.
    #[inline]
    pub fn acquire(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Complete one in-flight message. Never goes below zero.
    #[inline]
    pub fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Queue a frame payload for writing.
    ///
    /// Fails with `ConnectionClosed` if the connection is no longer active or
    /// its writer task has exited.
    pub fn write(&self, payload: Bytes) -> Result<()> {
        if !self.is_active() {
            return Err(GatewayError::ConnectionClosed(self.id.as_u64()));
        }
        self.cmd_tx
            .send(ConnCommand::Write(payload))
            .map_err(|_| GatewayError::ConnectionClosed(self.id.as_u64()))
    }

    /// Close the connection. Returns `true` for the call that deactivated it.
    pub fn close(&self) -> bool {
        if self.active.swap(false, Ordering::AcqRel) {
            // Writer may already be gone; nothing left to tell it then.
            let _ = self.cmd_tx.send(ConnCommand::Close);
            true
        } else {
            false
        }
    }

    /// Mark the connection closed without notifying the writer.
    ///
    /// Used by the I/O loop once the stream itself has failed.
    pub fn mark_closed(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("socket", &self.socket)
            .field("remote", &self.remote_addr)
            .field("local", &self.local_addr)
            .field("in_flight", &self.in_flight())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_connection(remote: &str) -> (Arc<Connection>, Receiver<ConnCommand>) {
    let remote: SocketAddr = remote.parse().unwrap();
    Connection::new(
        SocketKey::server("test"),
        SocketEndpoint::from_addr(remote),
        "127.0.0.1:7000".parse().unwrap(),
        remote,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let (a, _) = test_connection("10.0.0.1:1000");
        let (b, _) = test_connection("10.0.0.1:1000");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_in_flight_never_negative() {
        let (conn, _) = test_connection("10.0.0.1:1000");
        conn.release();
        assert_eq!(conn.in_flight(), 0);
        conn.acquire();
        conn.acquire();
        conn.release();
        assert_eq!(conn.in_flight(), 1);
    }

    #[test]
    fn test_write_then_close() {
        let (conn, rx) = test_connection("10.0.0.1:1000");
        conn.write(Bytes::from_static(b"0800")).unwrap();
        assert!(conn.close());
        assert!(!conn.close());

        assert!(matches!(rx.recv().unwrap(), ConnCommand::Write(b) if b == "0800"));
        assert!(matches!(rx.recv().unwrap(), ConnCommand::Close));
        assert!(matches!(
            conn.write(Bytes::from_static(b"0800")),
            Err(GatewayError::ConnectionClosed(_))
        ));
    }

    #[test]
    fn test_role_opposite() {
        assert_eq!(SocketRole::Server.opposite(), SocketRole::Client);
        assert_eq!(SocketKey::client("pay").to_string(), "client/pay");
    }
}
