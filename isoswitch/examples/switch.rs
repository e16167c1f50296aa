//! Minimal switch: one listener, N upstream hosts, round robin.
//!
//! ```text
//! RUST_LOG=isoswitch=debug cargo run --example switch -- 9100 10.1.1.1:7000 10.1.1.2:7000
//! ```
//!
//! Prints socket events until interrupted.

use isoswitch::prelude::*;
use std::env;

fn main() -> Result<()> {
    isoswitch::dev_tracing::init_tracing();

    let mut args = env::args().skip(1);
    let port: u16 = args
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9100);
    let targets = args
        .map(|t| t.parse::<SocketEndpoint>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::invalid_config(e.to_string()))?;
    if targets.is_empty() {
        eprintln!("usage: switch <listen-port> <host:port>...");
        return Ok(());
    }

    let metadata = Metadata::new()
        .with_profile(
            Profile::new("iso")
                .direction(Direction::Inbound, ["0100", "0200", "0400", "0800"])
                .direction(Direction::Outbound, ["0110", "0210", "0410", "0810"])
                .correlate_on([11, 37]),
        )
        .with_channel(
            ChannelConfig::new("main", "iso")
                .with_server(ServerConfig::new("0.0.0.0", port))
                .with_client(ClientConfig::new(targets)),
        );

    let gateway = Gateway::new(GatewayOptions::new(OverflowPolicy::Block), metadata)?;
    let monitor = gateway.monitor();
    gateway.start()?;
    println!("switching on port {port}");

    for event in monitor.iter() {
        println!("{event}");
    }
    Ok(())
}
