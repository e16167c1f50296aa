//! Stage handlers: classification, request forwarding, reply delivery.

use arc_swap::ArcSwap;
use isoswitch_core::connection::{SocketKey, SocketRole};
use isoswitch_core::correlation::CorrelationStore;
use isoswitch_core::endpoint::listen_host_matches;
use isoswitch_core::error::{GatewayError, Result};
use isoswitch_core::message::{correlation_key, Direction, Message};
use isoswitch_core::metadata::{ChannelConfig, Metadata};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::stage::StageQueue;
use crate::registry::TransportRegistry;

/// A message the pipeline could not deliver, with the reason.
#[derive(Debug)]
pub struct Unroutable {
    pub message: Message,
    pub error: GatewayError,
}

/// Shared state of the stage handlers.
pub(crate) struct Router {
    pub(crate) metadata: Arc<ArcSwap<Metadata>>,
    pub(crate) registry: Arc<TransportRegistry>,
    pub(crate) correlations: Arc<CorrelationStore>,
    pub(crate) inbound: StageQueue<Message>,
    pub(crate) outbound: StageQueue<Message>,
    pub(crate) unroutable: StageQueue<Unroutable>,
}

impl Router {
    /// Receive stage: resolve channel, profile, direction and key.
    pub(crate) fn receive(&self, mut msg: Message) {
        match self.classify(&mut msg) {
            Ok(Direction::Inbound) => self.forward(&self.inbound, msg),
            Ok(Direction::Outbound) => self.forward(&self.outbound, msg),
            Ok(other) => {
                let error = GatewayError::UnknownDirection {
                    channel: msg.channel.clone(),
                    value: other.to_string(),
                };
                self.reject(msg, error);
            }
            Err(e) => self.reject(msg, e),
        }
    }

    /// Inbound stage: remember the origin, then forward to the opposite role.
    pub(crate) fn route_inbound(&self, mut msg: Message) {
        let Some(key) = msg.correlation_key.clone() else {
            self.reject(msg, GatewayError::config_mismatch("message was never classified"));
            return;
        };

        let entry = self.correlations.put(key.clone(), Arc::clone(&msg.origin));
        let target = SocketKey::new(msg.origin_role().opposite(), msg.channel.clone());
        let sent = match self.registry.get(&target) {
            Some(transport) if transport.is_up() => transport.send(&mut msg),
            Some(_) => Err(GatewayError::transport_down(format!("{target}: no active connection"))),
            None => Err(GatewayError::transport_down(format!("{target}: not configured"))),
        };

        match sent {
            Ok(()) => {
                if let Some(dest) = msg.properties.destination.clone() {
                    trace!(key = %key, connection = %dest.id(), "[Pipeline] Destination bound");
                    entry.bind_destination(dest);
                }
                debug!(
                    channel = %msg.channel,
                    key = %key,
                    from = %msg.origin.id(),
                    "[Pipeline] Request forwarded"
                );
            }
            Err(e) => {
                self.correlations.remove_entry(&key, &entry);
                entry.settle();
                self.reject(msg, e);
            }
        }
    }

    /// Outbound stage: deliver a reply to the connection that sent the request.
    pub(crate) fn route_outbound(&self, msg: Message) {
        let Some(key) = msg.correlation_key.clone() else {
            self.reject(msg, GatewayError::config_mismatch("message was never classified"));
            return;
        };
        let Some(entry) = self.correlations.get(&key) else {
            self.reject(msg, GatewayError::CorrelationMiss(key));
            return;
        };

        let origin = Arc::clone(entry.origin());
        let delivered = if origin.is_active() {
            origin.write(msg.raw.clone())
        } else {
            Err(GatewayError::CorrelationMiss(key.clone()))
        };

        // Only the entry this reply observed; a newer request may reuse the key.
        self.correlations.remove_entry(&key, &entry);
        entry.settle();

        match delivered {
            Ok(()) => debug!(
                channel = %msg.channel,
                key = %key,
                to = %origin.id(),
                "[Pipeline] Reply delivered"
            ),
            Err(e) => self.reject(msg, e),
        }
    }

    fn classify(&self, msg: &mut Message) -> Result<Direction> {
        let metadata = self.metadata.load();
        let channel = resolve_channel(&metadata, msg)?;
        let profile = metadata.profile(&channel.profile).ok_or_else(|| {
            GatewayError::config_mismatch(format!(
                "channel {} uses unknown profile {}",
                channel.name, channel.profile
            ))
        })?;

        let missing = |field| GatewayError::MissingField {
            channel: msg.channel.clone(),
            field,
        };
        if let Some(field) = profile.missing_field(&msg.fields) {
            return Err(missing(field));
        }
        let value = msg
            .fields
            .get(profile.type_field)
            .ok_or_else(|| missing(profile.type_field))?;
        let direction = profile
            .classify(value)
            .ok_or_else(|| GatewayError::UnknownDirection {
                channel: msg.channel.clone(),
                value: value.to_string(),
            })?;
        let key = correlation_key(&msg.channel, &msg.fields, &profile.correlation_fields)
            .map_err(missing)?;

        msg.direction = Some(direction);
        msg.correlation_key = Some(key);
        Ok(direction)
    }

    fn forward(&self, queue: &StageQueue<Message>, msg: Message) {
        if let Err(msg) = queue.submit(msg) {
            self.reject(msg, GatewayError::QueueFull(queue.name()));
        }
    }

    /// Hand a failed message to the unroutable sink.
    pub(crate) fn reject(&self, message: Message, error: GatewayError) {
        if let Err(item) = self.unroutable.submit(Unroutable { message, error }) {
            // Sink is saturated or gone; log inline so nothing vanishes silently
            log_unroutable(&item);
        }
    }
}

/// Channel whose configured socket matches where the message came from.
fn resolve_channel<'a>(metadata: &'a Metadata, msg: &Message) -> Result<&'a ChannelConfig> {
    let mismatch = || {
        GatewayError::config_mismatch(format!(
            "{} (local {}, remote {})",
            msg.origin.socket(),
            msg.local_addr,
            msg.remote_addr
        ))
    };
    let channel = metadata.channel(&msg.channel).ok_or_else(mismatch)?;

    let matched = match msg.origin_role() {
        SocketRole::Server => channel.server.as_ref().is_some_and(|server| {
            (server.port == 0 || server.port == msg.local_addr.port())
                && listen_host_matches(&server.host, msg.local_addr.ip())
        }),
        SocketRole::Client => channel.client.as_ref().is_some_and(|client| {
            let endpoint = msg.origin.endpoint().key();
            client
                .targets
                .iter()
                .any(|target| target.key() == endpoint || target.matches_addr(msg.remote_addr))
        }),
    };

    if matched {
        Ok(channel)
    } else {
        Err(mismatch())
    }
}

/// Unroutable sink handler.
pub(crate) fn log_unroutable(item: &Unroutable) {
    let msg = &item.message;
    warn!(
        channel = %msg.channel,
        key = msg.correlation_key.as_deref().unwrap_or("-"),
        mti = msg.mti().unwrap_or("-"),
        direction = ?msg.direction,
        connection = %msg.origin.id(),
        remote = %msg.remote_addr,
        "[Unroutable] {}", item.error
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;
    use bytes::Bytes;
    use flume::Receiver;
    use isoswitch_core::connection::{ConnCommand, Connection};
    use isoswitch_core::endpoint::SocketEndpoint;
    use isoswitch_core::message::FieldMap;
    use isoswitch_core::metadata::{ClientConfig, Profile, ServerConfig};
    use isoswitch_core::options::{OverflowPolicy, StageOptions};
    use std::net::SocketAddr;
    use std::time::Duration;

    struct Harness {
        router: Router,
        inbound_rx: Receiver<Message>,
        outbound_rx: Receiver<Message>,
        unroutable_rx: Receiver<Unroutable>,
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn metadata() -> Metadata {
        Metadata::new()
            .with_profile(
                Profile::new("iso")
                    .direction(Direction::Inbound, ["0200", "0800"])
                    .direction(Direction::Outbound, ["0210", "0810"])
                    .correlate_on([11, 37]),
            )
            .with_channel(
                ChannelConfig::new("pay", "iso")
                    .with_server(ServerConfig::new("0.0.0.0", 9100))
                    .with_client(ClientConfig::new(vec![SocketEndpoint::new("10.1.1.1", 7000)])),
            )
    }

    fn harness() -> Harness {
        let stage = StageOptions::new(16, 1, OverflowPolicy::Reject);
        let (inbound, inbound_rx) = StageQueue::new("inbound", &stage);
        let (outbound, outbound_rx) = StageQueue::new("outbound", &stage);
        let (unroutable, unroutable_rx) = StageQueue::new("unroutable", &stage);
        Harness {
            router: Router {
                metadata: Arc::new(ArcSwap::from_pointee(metadata())),
                registry: Arc::new(TransportRegistry::new()),
                correlations: Arc::new(CorrelationStore::new(Duration::from_secs(30))),
                inbound,
                outbound,
                unroutable,
            },
            inbound_rx,
            outbound_rx,
            unroutable_rx,
        }
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

    fn upstream() -> (Arc<Connection>, Receiver<ConnCommand>) {
        Connection::new(
            SocketKey::client("pay"),
            SocketEndpoint::new("10.1.1.1", 7000),
            addr("10.0.0.1:53000"),
            addr("10.1.1.1:7000"),
        )
    }

    fn message(mti: &str, conn: &Arc<Connection>) -> Message {
        let fields = FieldMap::new()
            .with(0, mti)
            .with(11, "123456")
            .with(37, "ABCDEF");
        Message::new(Bytes::from(format!("{mti}-raw")), fields, Arc::clone(conn))
    }

    fn register_upstream(h: &Harness) -> (Arc<Connection>, Receiver<ConnCommand>) {
        let config = ClientConfig::new(vec![SocketEndpoint::new("10.1.1.1", 7000)]);
        let options = isoswitch_core::options::GatewayOptions::new(OverflowPolicy::Reject);
        let transport = Transport::client(SocketKey::client("pay"), &config, &options);
        let (conn, rx) = upstream();
        assert!(transport.pools()[0].add_connection(Arc::clone(&conn)));
        h.router.registry.insert(Arc::new(transport));
        (conn, rx)
    }

    fn written(rx: &Receiver<ConnCommand>) -> Bytes {
        match rx.try_recv().unwrap() {
            ConnCommand::Write(bytes) => bytes,
            ConnCommand::Close => panic!("expected a write"),
        }
    }

    #[test]
    fn test_receive_classifies_and_keys() {
        let h = harness();
        let (term, _rx) = terminal("10.0.0.9:4000");
        h.router.receive(message("0200", &term));

        let msg = h.inbound_rx.try_recv().unwrap();
        assert_eq!(msg.direction, Some(Direction::Inbound));
        assert_eq!(msg.correlation_key.as_deref(), Some("pay|123456|ABCDEF"));

        let (up, _rx) = upstream();
        h.router.receive(message("0210", &up));
        let reply = h.outbound_rx.try_recv().unwrap();
        assert_eq!(reply.correlation_key.as_deref(), Some("pay|123456|ABCDEF"));
    }

    #[test]
    fn test_receive_failures_land_in_unroutable() {
        let h = harness();
        let (term, _rx) = terminal("10.0.0.9:4000");

        h.router.receive(message("0400", &term));
        let item = h.unroutable_rx.try_recv().unwrap();
        assert!(matches!(item.error, GatewayError::UnknownDirection { .. }));

        let mut msg = message("0200", &term);
        msg.fields.remove(37);
        h.router.receive(msg);
        let item = h.unroutable_rx.try_recv().unwrap();
        assert!(matches!(item.error, GatewayError::MissingField { field: 37, .. }));

        // Client connection whose endpoint is not a configured target
        let remote = addr("10.9.9.9:7000");
        let (stray, _rx) = Connection::new(
            SocketKey::client("pay"),
            SocketEndpoint::from_addr(remote),
            addr("10.0.0.1:53001"),
            remote,
        );
        h.router.receive(message("0210", &stray));
        let item = h.unroutable_rx.try_recv().unwrap();
        assert!(matches!(item.error, GatewayError::ConfigMismatch(_)));
        assert!(h.inbound_rx.is_empty());
    }

    #[test]
    fn test_listener_port_must_match() {
        let h = harness();
        let remote = addr("10.0.0.9:4000");
        let (term, _rx) = Connection::new(
            SocketKey::server("pay"),
            SocketEndpoint::from_addr(remote),
            addr("10.0.0.1:9999"),
            remote,
        );
        h.router.receive(message("0200", &term));
        let item = h.unroutable_rx.try_recv().unwrap();
        assert!(matches!(item.error, GatewayError::ConfigMismatch(_)));
    }

    #[test]
    fn test_request_reply_round_trip() {
        let h = harness();
        let (up, up_rx) = register_upstream(&h);
        let (term, term_rx) = terminal("10.0.0.9:4000");

        let mut request = message("0200", &term);
        request.correlation_key = Some("pay|123456|ABCDEF".into());
        h.router.route_inbound(request);
        assert_eq!(written(&up_rx), "0200-raw");
        assert_eq!(up.in_flight(), 1);
        assert_eq!(h.router.correlations.len(), 1);

        let mut reply = message("0210", &up);
        reply.correlation_key = Some("pay|123456|ABCDEF".into());
        h.router.route_outbound(reply);
        assert_eq!(written(&term_rx), "0210-raw");
        assert_eq!(up.in_flight(), 0);
        assert!(h.router.correlations.is_empty());
    }

    #[test]
    fn test_inbound_without_transport_is_unroutable() {
        let h = harness();
        let (term, _rx) = terminal("10.0.0.9:4000");
        let mut request = message("0200", &term);
        request.correlation_key = Some("pay|1|2".into());
        h.router.route_inbound(request);

        let item = h.unroutable_rx.try_recv().unwrap();
        assert!(matches!(item.error, GatewayError::TransportDown(_)));
        assert!(h.router.correlations.is_empty());
    }

    #[test]
    fn test_reply_to_closed_origin_is_dropped() {
        let h = harness();
        let (up, _up_rx) = register_upstream(&h);
        let (term, term_rx) = terminal("10.0.0.9:4000");

        let mut request = message("0200", &term);
        request.correlation_key = Some("pay|1|2".into());
        h.router.route_inbound(request);
        term.close();
        let _ = term_rx.try_recv();

        let mut reply = message("0210", &up);
        reply.correlation_key = Some("pay|1|2".into());
        h.router.route_outbound(reply);

        let item = h.unroutable_rx.try_recv().unwrap();
        assert!(matches!(item.error, GatewayError::CorrelationMiss(_)));
        assert!(term_rx.try_recv().is_err());
        assert_eq!(up.in_flight(), 0);
        assert!(h.router.correlations.is_empty());
    }

    #[test]
    fn test_unmatched_reply_is_correlation_miss() {
        let h = harness();
        let (up, _rx) = upstream();
        let mut reply = message("0210", &up);
        reply.correlation_key = Some("pay|9|9".into());
        h.router.route_outbound(reply);
        let item = h.unroutable_rx.try_recv().unwrap();
        assert!(matches!(item.error, GatewayError::CorrelationMiss(ref k) if k == "pay|9|9"));
    }
}
