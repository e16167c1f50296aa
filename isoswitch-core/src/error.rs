/// Isoswitch Error Types
///
/// Error kinds for the routing kernel. Per-message kinds isolate a single
/// pipeline execution; connection kinds close one connection only.

use std::io;
use thiserror::Error;

/// Main error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// No channel configuration matched the message's socket
    #[error("No channel matched: {0}")]
    ConfigMismatch(String),

    /// A field required for classification or correlation is absent
    #[error("Missing field {field} on channel {channel}")]
    MissingField { channel: String, field: u16 },

    /// Type indicator did not match any configured direction
    #[error("Unknown type indicator {value:?} on channel {channel}")]
    UnknownDirection { channel: String, value: String },

    /// No usable destination connection
    #[error("Transport down: {0}")]
    TransportDown(String),

    /// Reply arrived with no pending request to answer
    #[error("No origin for correlation key {0}")]
    CorrelationMiss(String),

    /// Connection refused by the pool allow-list
    #[error("Connection from {0} rejected by allow-list")]
    PoolRejected(String),

    /// Selection strategy was handed an empty candidate set
    #[error("No candidates available")]
    NoCandidates,

    /// Hash strategy could not extract a routing key
    #[error("Missing routing key field {0}")]
    MissingRoutingKey(u16),

    /// Connection is no longer active
    #[error("Connection {0} closed")]
    ConnectionClosed(u64),

    /// Stage queue rejected the message
    #[error("Queue full: {0}")]
    QueueFull(&'static str),

    /// Static configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Wire codec failure
    #[error("Codec error: {0}")]
    Codec(String),

    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Create a channel mismatch error
    pub fn config_mismatch(msg: impl Into<String>) -> Self {
        Self::ConfigMismatch(msg.into())
    }

    /// Create a transport down error
    pub fn transport_down(msg: impl Into<String>) -> Self {
        Self::TransportDown(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a codec error
    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    /// Check if this error only affects the message being routed
    #[must_use]
    pub const fn is_per_message(&self) -> bool {
        matches!(
            self,
            Self::ConfigMismatch(_)
                | Self::MissingField { .. }
                | Self::UnknownDirection { .. }
                | Self::TransportDown(_)
                | Self::CorrelationMiss(_)
                | Self::NoCandidates
                | Self::MissingRoutingKey(_)
                | Self::QueueFull(_)
        )
    }

    /// Check if this is a connection error
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::ConnectionClosed(_) | Self::PoolRejected(_) | Self::Codec(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
