//! Socket event monitoring.
//!
//! Gateway sockets report lifecycle events (listening, accepted, rejected,
//! connected, disconnected) on a flume channel. Events are best effort: a
//! dropped monitor receiver never affects traffic.

use std::fmt;
use std::net::SocketAddr;

use crate::connection::{ConnectionId, SocketKey};
use crate::endpoint::SocketEndpoint;

/// Socket lifecycle events.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Listener bound and accepting.
    Listening { socket: SocketKey, addr: SocketAddr },

    /// Listener failed to bind.
    BindFailed { socket: SocketKey, reason: String },

    /// Listener accepted a connection that passed the allow-list.
    Accepted {
        socket: SocketKey,
        connection: ConnectionId,
        remote: SocketAddr,
    },

    /// Listener refused a connection not on the allow-list.
    Rejected { socket: SocketKey, remote: SocketAddr },

    /// Client connected to a target.
    Connected {
        socket: SocketKey,
        connection: ConnectionId,
        target: SocketEndpoint,
    },

    /// Client connection attempt failed.
    ConnectFailed {
        socket: SocketKey,
        target: SocketEndpoint,
        reason: String,
    },

    /// A connection closed.
    Disconnected {
        socket: SocketKey,
        connection: ConnectionId,
        remote: SocketAddr,
    },

    /// Socket stopped; its connections are closed.
    Stopped { socket: SocketKey },
}

impl SocketEvent {
    /// Socket the event belongs to.
    pub fn socket(&self) -> &SocketKey {
        match self {
            Self::Listening { socket, .. }
            | Self::BindFailed { socket, .. }
            | Self::Accepted { socket, .. }
            | Self::Rejected { socket, .. }
            | Self::Connected { socket, .. }
            | Self::ConnectFailed { socket, .. }
            | Self::Disconnected { socket, .. }
            | Self::Stopped { socket } => socket,
        }
    }
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Listening { socket, addr } => write!(f, "{socket}: listening on {addr}"),
            Self::BindFailed { socket, reason } => write!(f, "{socket}: bind failed: {reason}"),
            Self::Accepted {
                socket,
                connection,
                remote,
            } => write!(f, "{socket}: accepted {connection} from {remote}"),
            Self::Rejected { socket, remote } => write!(f, "{socket}: rejected {remote}"),
            Self::Connected {
                socket,
                connection,
                target,
            } => write!(f, "{socket}: {connection} connected to {target}"),
            Self::ConnectFailed {
                socket,
                target,
                reason,
            } => write!(f, "{socket}: connect to {target} failed: {reason}"),
            Self::Disconnected {
                socket,
                connection,
                remote,
            } => write!(f, "{socket}: {connection} to {remote} closed"),
            Self::Stopped { socket } => write!(f, "{socket}: stopped"),
        }
    }
}

/// Handle for receiving socket events.
pub type SocketMonitor = flume::Receiver<SocketEvent>;

/// Sender half used by sockets to emit events.
pub type SocketEventSender = flume::Sender<SocketEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (SocketEventSender, SocketMonitor) {
    flume::unbounded()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_event_display() {
        let addr: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let event = SocketEvent::Listening {
            socket: SocketKey::server("pay"),
            addr,
        };
        assert_eq!(event.to_string(), "server/pay: listening on 127.0.0.1:5555");
    }

    #[test]
    fn test_monitor_channel() {
        let (sender, receiver) = create_monitor();
        sender
            .send(SocketEvent::Stopped {
                socket: SocketKey::client("pay"),
            })
            .unwrap();

        let event = receiver.recv().unwrap();
        assert_eq!(event.socket(), &SocketKey::client("pay"));
    }
}
