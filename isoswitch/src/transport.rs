//! Transports: the send side of a logical socket.
//!
//! A [`Transport`] wraps either a listener (server role) or a set of client
//! links (client role) together with the selection strategy configured for
//! that socket. The pipeline only ever calls [`Transport::send`] and
//! [`Transport::is_up`]; the gateway drives the lifecycle.

use arc_swap::ArcSwap;
use isoswitch_core::candidates::VersionedCandidates;
use isoswitch_core::connection::{Connection, ConnectionId, SocketKey};
use isoswitch_core::endpoint::AccessList;
use isoswitch_core::error::{GatewayError, Result};
use isoswitch_core::message::Message;
use isoswitch_core::metadata::{ClientConfig, ServerConfig};
use isoswitch_core::monitor::SocketEvent;
use isoswitch_core::options::GatewayOptions;
use isoswitch_core::pool::{ConnectionPool, PoolSnapshot};
use isoswitch_core::reconnect::ReconnectController;
use isoswitch_core::strategy::Strategy;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::socket::{ClientSocket, ListenerSocket, SocketContext};
use crate::status::{ConnectionInfo, LinkStatus, SocketStatus};

/// Send side of one logical socket.
pub enum Transport {
    Server(ServerTransport),
    Client(ClientTransport),
}

impl Transport {
    pub fn server(key: SocketKey, config: &ServerConfig) -> Self {
        Self::Server(ServerTransport::new(key, config))
    }

    pub fn client(key: SocketKey, config: &ClientConfig, options: &GatewayOptions) -> Self {
        Self::Client(ClientTransport::new(key, config, options))
    }

    pub fn key(&self) -> &SocketKey {
        match self {
            Self::Server(t) => &t.key,
            Self::Client(t) => &t.key,
        }
    }

    fn strategy(&self) -> &Strategy {
        match self {
            Self::Server(t) => &t.strategy,
            Self::Client(t) => &t.strategy,
        }
    }

    /// Current candidate connections.
    pub fn candidates(&self) -> Arc<PoolSnapshot> {
        match self {
            Self::Server(t) => t.listener.pool().candidates(),
            Self::Client(t) => t.candidates(),
        }
    }

    /// Pick a connection and queue the message's raw bytes on it.
    ///
    /// On success the chosen connection holds one more in-flight unit and is
    /// recorded in `msg.properties.destination`; the caller owns releasing it.
    ///
    /// A pick that turns out to be closed is evicted from its pool and the
    /// selection is retried against the refreshed snapshot.
    pub fn send(&self, msg: &mut Message) -> Result<()> {
        let mut retries = self.candidates().len();
        loop {
            let candidates = self.candidates();
            if candidates.is_empty() {
                return Err(GatewayError::transport_down(format!("{}: no connections", self.key())));
            }

            let conn = match self.strategy().select(&candidates, &msg.fields) {
                Ok(conn) => conn,
                Err(GatewayError::NoCandidates) => {
                    return Err(GatewayError::transport_down(format!("{}: no connections", self.key())));
                }
                Err(e) => return Err(e),
            };

            let outcome = if conn.is_active() {
                conn.acquire();
                msg.properties.destination = Some(Arc::clone(&conn));
                match conn.write(msg.raw.clone()) {
                    Ok(()) => {
                        trace!(socket = %self.key(), connection = %conn.id(), "[Transport] Sent");
                        return Ok(());
                    }
                    Err(e) => {
                        conn.release();
                        msg.properties.destination = None;
                        conn.mark_closed();
                        e
                    }
                }
            } else {
                GatewayError::ConnectionClosed(conn.id().as_u64())
            };

            let evicted: usize = self.pools().iter().map(|pool| pool.evict_inactive()).sum();
            debug!(socket = %self.key(), connection = %conn.id(), evicted, "[Transport] Skipped closed connection");
            let refreshed = self.candidates().version() != candidates.version();
            if retries == 0 || !refreshed {
                return Err(GatewayError::transport_down(format!("{}: {}", self.key(), outcome)));
            }
            retries -= 1;
        }
    }

    /// Whether at least one connection is active.
    pub fn is_up(&self) -> bool {
        self.pools().iter().any(|pool| pool.active_count() > 0)
    }

    /// Start listening or connecting.
    pub fn start(&self, ctx: &SocketContext) -> Result<()> {
        match self {
            Self::Server(t) => t.listener.start(ctx).map(|_| ()),
            Self::Client(t) => {
                for socket in &t.sockets {
                    socket.start(ctx)?;
                }
                Ok(())
            }
        }
    }

    /// Stop accepting or reconnecting and close every connection.
    ///
    /// Returns the number of connections closed.
    pub fn stop(&self, ctx: &SocketContext) -> usize {
        let closed = match self {
            Self::Server(t) => t.listener.stop(),
            Self::Client(t) => t.sockets.iter().map(ClientSocket::stop).sum(),
        };
        debug!(socket = %self.key(), closed, "[Transport] Stopped");
        ctx.events.emit(SocketEvent::Stopped {
            socket: self.key().clone(),
        });
        closed
    }

    pub fn restart(&self, ctx: &SocketContext) -> Result<()> {
        self.stop(ctx);
        self.start(ctx)
    }

    /// Whether the listener is bound or any client driver runs.
    pub fn is_running(&self) -> bool {
        match self {
            Self::Server(t) => t.listener.is_running(),
            Self::Client(t) => t.sockets.iter().any(ClientSocket::is_running),
        }
    }

    /// Pools backing this transport.
    pub fn pools(&self) -> Vec<&Arc<ConnectionPool>> {
        match self {
            Self::Server(t) => vec![t.listener.pool()],
            Self::Client(t) => t.sockets.iter().map(ClientSocket::pool).collect(),
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.pools().into_iter().find_map(|pool| pool.get(id))
    }

    /// Close one connection. Client links reconnect afterwards.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        match self.connection(id) {
            Some(conn) => conn.close(),
            None => false,
        }
    }

    /// Swap the allow-list of a server transport and drop revoked endpoints.
    ///
    /// Returns the number of connections closed. No-op for clients.
    pub fn replace_access_list(&self, access: AccessList) -> usize {
        match self {
            Self::Server(t) => {
                let pool = t.listener.pool();
                pool.replace_access_list(access)
                    .iter()
                    .map(|key| pool.remove_by_endpoint(key))
                    .sum()
            }
            Self::Client(_) => 0,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Server(t) => t.listener.local_addr(),
            Self::Client(_) => None,
        }
    }

    pub fn status(&self) -> SocketStatus {
        let connections: Vec<ConnectionInfo> = self
            .pools()
            .iter()
            .flat_map(|pool| pool.active_connections())
            .map(|conn| ConnectionInfo::from(&*conn))
            .collect();
        let links = match self {
            Self::Server(_) => Vec::new(),
            Self::Client(t) => t
                .sockets
                .iter()
                .map(|s| LinkStatus {
                    target: s.target().clone(),
                    state: s.link_state(),
                    retry_count: s.retry_count(),
                })
                .collect(),
        };
        SocketStatus {
            key: self.key().clone(),
            up: !connections.is_empty(),
            listening: self.local_addr(),
            connections,
            links,
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("key", self.key())
            .field("strategy", &self.strategy().kind())
            .field("up", &self.is_up())
            .finish()
    }
}

/// Listener-backed transport.
pub struct ServerTransport {
    key: SocketKey,
    strategy: Strategy,
    listener: ListenerSocket,
}

impl ServerTransport {
    pub fn new(key: SocketKey, config: &ServerConfig) -> Self {
        Self {
            listener: ListenerSocket::new(key.clone(), config),
            strategy: Strategy::new(config.strategy),
            key,
        }
    }

    pub fn listener(&self) -> &ListenerSocket {
        &self.listener
    }
}

/// Transport over one client link per configured target.
pub struct ClientTransport {
    key: SocketKey,
    strategy: Strategy,
    sockets: Vec<ClientSocket>,
    merged: ArcSwap<PoolSnapshot>,
}

impl ClientTransport {
    pub fn new(key: SocketKey, config: &ClientConfig, options: &GatewayOptions) -> Self {
        let sockets = config
            .targets
            .iter()
            .map(|target| {
                ClientSocket::new(
                    key.clone(),
                    target.clone(),
                    ReconnectController::from_options(options),
                )
            })
            .collect();
        Self {
            key,
            strategy: Strategy::new(config.strategy),
            sockets,
            merged: ArcSwap::from_pointee(VersionedCandidates::empty()),
        }
    }

    pub fn sockets(&self) -> &[ClientSocket] {
        &self.sockets
    }

    /// Union of all target pools, rebuilt only when a pool changed.
    fn candidates(&self) -> Arc<PoolSnapshot> {
        let parts: Vec<Arc<PoolSnapshot>> = self.sockets.iter().map(|s| s.pool().candidates()).collect();
        let version = parts
            .iter()
            .fold(0u64, |acc, part| acc.wrapping_add(part.version()));

        let cached = self.merged.load_full();
        if cached.version() == version {
            return cached;
        }
        let merged = Arc::new(VersionedCandidates::merge(parts.iter().map(|p| &**p)));
        self.merged.store(Arc::clone(&merged));
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use flume::Receiver;
    use isoswitch_core::connection::ConnCommand;
    use isoswitch_core::endpoint::SocketEndpoint;
    use isoswitch_core::message::FieldMap;
    use isoswitch_core::options::OverflowPolicy;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn server() -> Transport {
        Transport::server(SocketKey::server("pay"), &ServerConfig::new("0.0.0.0", 9100))
    }

    fn client(targets: &[&str]) -> Transport {
        let config = ClientConfig::new(targets.iter().map(|t| t.parse().unwrap()).collect());
        let options = GatewayOptions::new(OverflowPolicy::Reject);
        Transport::client(SocketKey::client("pay"), &config, &options)
    }

    fn terminal(remote: &str) -> (Arc<Connection>, Receiver<ConnCommand>) {
        let remote = addr(remote);
        Connection::new(
            SocketKey::server("pay"),
            SocketEndpoint::from_addr(remote),
            addr("10.0.0.1:9100"),
            remote,
        )
    }

    fn upstream(target: &str) -> (Arc<Connection>, Receiver<ConnCommand>) {
        Connection::new(
            SocketKey::client("pay"),
            target.parse().unwrap(),
            addr("10.0.0.1:53000"),
            addr(target),
        )
    }

    fn message() -> Message {
        let (origin, _rx) = upstream("10.1.1.9:7000");
        Message::new(Bytes::from_static(b"0210-raw"), FieldMap::new().with(0, "0210"), origin)
    }

    fn writes(rx: &Receiver<ConnCommand>) -> usize {
        rx.try_iter()
            .filter(|cmd| matches!(cmd, ConnCommand::Write(_)))
            .count()
    }

    #[test]
    fn test_send_records_destination() {
        let transport = server();
        let (conn, rx) = terminal("10.0.0.9:4000");
        assert!(transport.pools()[0].add_connection(Arc::clone(&conn)));

        let mut msg = message();
        transport.send(&mut msg).unwrap();

        let dest = msg.properties.destination.as_ref().unwrap();
        assert_eq!(dest.id(), conn.id());
        assert_eq!(conn.in_flight(), 1);
        match rx.try_recv().unwrap() {
            ConnCommand::Write(bytes) => assert_eq!(bytes, "0210-raw"),
            ConnCommand::Close => panic!("expected a write"),
        }
    }

    #[test]
    fn test_send_with_no_connections() {
        let transport = server();
        let mut msg = message();
        assert!(matches!(
            transport.send(&mut msg),
            Err(GatewayError::TransportDown(_))
        ));
        assert!(msg.properties.destination.is_none());
    }

    #[test]
    fn test_send_skips_closed_connection() {
        let transport = server();
        let (closed, _closed_rx) = terminal("10.0.0.9:4000");
        let (live, live_rx) = terminal("10.0.0.9:4001");
        let pool = transport.pools()[0];
        assert!(pool.add_connection(Arc::clone(&closed)));
        assert!(pool.add_connection(Arc::clone(&live)));

        // Closed but not yet unregistered by its pump.
        closed.close();
        assert_eq!(pool.len(), 2);

        for _ in 0..4 {
            let mut msg = message();
            transport.send(&mut msg).unwrap();
            assert_eq!(msg.properties.destination.as_ref().unwrap().id(), live.id());
        }
        assert_eq!(writes(&live_rx), 4);
        assert_eq!(live.in_flight(), 4);
        assert_eq!(closed.in_flight(), 0);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_write_failure_releases() {
        let transport = server();
        // Writer task gone: the command channel is disconnected.
        let (conn, rx) = terminal("10.0.0.9:4000");
        drop(rx);
        assert!(transport.pools()[0].add_connection(Arc::clone(&conn)));

        let mut msg = message();
        assert!(matches!(
            transport.send(&mut msg),
            Err(GatewayError::TransportDown(_))
        ));
        assert_eq!(conn.in_flight(), 0);
        assert!(msg.properties.destination.is_none());
        assert!(!conn.is_active());
        assert!(transport.candidates().is_empty());
    }

    #[test]
    fn test_client_merges_target_pools() {
        let transport = client(&["10.1.1.1:7000", "10.1.1.2:7000"]);
        let pools = transport.pools();
        let (a, a_rx) = upstream("10.1.1.1:7000");
        let (b, b_rx) = upstream("10.1.1.2:7000");
        assert!(pools[0].add_connection(Arc::clone(&a)));
        assert!(pools[1].add_connection(Arc::clone(&b)));

        let first = transport.candidates();
        assert_eq!(first.len(), 2);
        assert!(Arc::ptr_eq(&first, &transport.candidates()));

        for _ in 0..4 {
            transport.send(&mut message()).unwrap();
        }
        assert_eq!(writes(&a_rx), 2);
        assert_eq!(writes(&b_rx), 2);

        assert!(pools[1].remove_connection(&b));
        let rebuilt = transport.candidates();
        assert_ne!(rebuilt.version(), first.version());
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt.items()[0].id(), a.id());
    }

    #[test]
    fn test_is_up_tracks_active_connections() {
        let transport = client(&["10.1.1.1:7000", "10.1.1.2:7000"]);
        assert!(!transport.is_up());

        let pools = transport.pools();
        let (a, _a_rx) = upstream("10.1.1.1:7000");
        let (b, _b_rx) = upstream("10.1.1.2:7000");
        pools[0].add_connection(Arc::clone(&a));
        pools[1].add_connection(Arc::clone(&b));
        assert!(transport.is_up());

        a.mark_closed();
        assert!(transport.is_up());
        b.mark_closed();
        assert!(!transport.is_up());

        let status = transport.status();
        assert!(!status.up);
        assert!(status.connections.is_empty());
        assert_eq!(status.links.len(), 2);
    }

    #[test]
    fn test_close_connection_by_id() {
        let transport = server();
        let (conn, rx) = terminal("10.0.0.9:4000");
        transport.pools()[0].add_connection(Arc::clone(&conn));

        assert!(transport.close_connection(conn.id()));
        assert!(!transport.close_connection(conn.id()));
        assert!(matches!(rx.try_recv(), Ok(ConnCommand::Close)));
        assert!(!transport.is_up());
    }
}
