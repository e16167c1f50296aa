//! # Isoswitch
//!
//! Message-switching gateway for ISO-8583-style financial traffic.
//!
//! ## Architecture
//!
//! The gateway is layered the same way from the kernel outwards:
//!
//! - **`isoswitch-core`**: routing kernel (strategies, pools, correlation, reconnect)
//! - **`isoswitch-iso8583`**: sans-IO framing and field codec
//! - **`isoswitch`**: runtime and public API surface (this crate)
//!
//! ```text
//! terminals ──TCP──▶ listener pool ─┐                 ┌─▶ client pool ──TCP──▶ hosts
//!                                   ├─▶ pipeline ─────┤
//! terminals ◀──────── replies ──────┘   (correlation) └── replies ◀──────────── hosts
//! ```
//!
//! Each configured channel owns at most one listener (server role) and one
//! set of outbound links (client role). Requests arriving on one role are
//! forwarded to the opposite role of the same channel; replies are matched
//! back to the connection that sent the request through the correlation
//! store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use isoswitch::prelude::*;
//!
//! # fn main() -> Result<()> {
//! isoswitch::dev_tracing::init_tracing();
//!
//! let metadata = Metadata::new()
//!     .with_profile(
//!         Profile::new("iso")
//!             .direction(Direction::Inbound, ["0100", "0200", "0800"])
//!             .direction(Direction::Outbound, ["0110", "0210", "0810"])
//!             .correlate_on([11, 37]),
//!     )
//!     .with_channel(
//!         ChannelConfig::new("pay", "iso")
//!             .with_server(ServerConfig::new("0.0.0.0", 9100))
//!             .with_client(
//!                 ClientConfig::new(vec![
//!                     SocketEndpoint::new("10.1.1.1", 7000).with_weight(3),
//!                     SocketEndpoint::new("10.1.1.2", 7000),
//!                 ])
//!                 .with_strategy(StrategyKind::RoundRobin),
//!             ),
//!     );
//!
//! let gateway = Gateway::new(GatewayOptions::new(OverflowPolicy::Block), metadata)?;
//! gateway.start()?;
//!
//! for event in gateway.monitor().iter() {
//!     println!("{event}");
//! }
//! # Ok(())
//! # }
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod dev_tracing;
pub mod gateway;
pub mod io_loop;
pub mod pipeline;
pub mod registry;
pub mod socket;
pub mod status;
pub mod transport;
pub mod wire;

pub use gateway::{Gateway, ReloadSummary};
pub use status::{ConnectionInfo, LinkStatus, SocketStatus};
pub use transport::Transport;
pub use wire::Wire;

/// Kernel types, re-exported.
pub use isoswitch_core as core;
/// Wire codecs, re-exported.
pub use isoswitch_iso8583 as iso8583;

pub mod prelude {
    pub use crate::gateway::{Gateway, ReloadSummary};
    pub use crate::status::{ConnectionInfo, LinkStatus, SocketStatus};
    pub use crate::transport::Transport;
    pub use crate::wire::Wire;
    pub use isoswitch_core::prelude::*;
    pub use isoswitch_iso8583::{FieldSpec, Iso8583Codec, LengthHeader, LengthPrefixFramer};
}
