//! Isoswitch Core
//!
//! Runtime-agnostic routing kernel of the gateway:
//! - Connection handles and socket identity (`connection`)
//! - Versioned candidate snapshots (`candidates`)
//! - Selection strategies: round robin, least connections, hash (`strategy`)
//! - Per-socket connection pool with allow-list (`pool`)
//! - Correlation store with TTL expiry (`correlation`)
//! - Reconnect state machine (`reconnect`)
//! - Static routing configuration (`metadata`)
//! - TCP utilities (`tcp`)
//! - Error types (`error`)

// The tcp module needs raw fd/socket access for socket configuration
#![cfg_attr(not(test), deny(unsafe_code))]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
pub mod candidates;
pub mod connection;
pub mod correlation;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod metadata;
pub mod monitor;
pub mod options;
pub mod pool;
pub mod reconnect;
pub mod strategy;
pub mod tcp;

// Small prelude for the gateway crate and tests.
pub mod prelude {
    pub use crate::candidates::{Candidate, VersionedCandidates};
    pub use crate::connection::{ConnCommand, Connection, ConnectionId, SocketKey, SocketRole};
    pub use crate::correlation::{CorrelationEntry, CorrelationStore, SweeperHandle};
    pub use crate::endpoint::{AccessList, SocketEndpoint};
    pub use crate::error::{GatewayError, Result};
    pub use crate::message::{Direction, FieldId, FieldMap, Message, MTI_FIELD};
    pub use crate::metadata::{ChannelConfig, ClientConfig, Metadata, Profile, ServerConfig};
    pub use crate::monitor::{SocketEvent, SocketMonitor};
    pub use crate::options::{GatewayOptions, OverflowPolicy, StageOptions};
    pub use crate::pool::ConnectionPool;
    pub use crate::reconnect::{LinkState, ReconnectController};
    pub use crate::strategy::{Strategy, StrategyKind};
}
