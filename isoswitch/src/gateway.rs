//! Gateway facade: lifecycle, hot reload, administration and status.

use arc_swap::ArcSwap;
use isoswitch_core::connection::{ConnectionId, SocketKey};
use isoswitch_core::correlation::{CorrelationStore, SweeperHandle};
use isoswitch_core::error::{GatewayError, Result};
use isoswitch_core::metadata::{ChannelConfig, Metadata};
use isoswitch_core::monitor::SocketMonitor;
use isoswitch_core::options::GatewayOptions;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::io_loop::IoLoops;
use crate::pipeline::Pipeline;
use crate::registry::TransportRegistry;
use crate::socket::{EventHub, SocketContext};
use crate::status::SocketStatus;
use crate::transport::Transport;
use crate::wire::Wire;

/// Outcome of a [`Gateway::reload`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Channels whose transports were created
    pub added: Vec<String>,
    /// Channels whose transports were stopped and dropped
    pub removed: Vec<String>,
    /// Channels whose transports were replaced
    pub rebuilt: Vec<String>,
    /// Channels whose listener allow-list was swapped in place
    pub allow_list_updated: Vec<String>,
    /// Connections closed because their endpoint is no longer allowed
    pub connections_closed: usize,
    /// Channels whose new transports failed to start, with the reason
    pub failed: Vec<(String, String)>,
}

impl ReloadSummary {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.rebuilt.is_empty()
            && self.allow_list_updated.is_empty()
    }
}

struct Running {
    ctx: SocketContext,
    pipeline: Pipeline,
    _sweeper: SweeperHandle,
}

/// Message-switching gateway.
///
/// ```rust,no_run
/// use isoswitch::prelude::*;
///
/// # fn main() -> Result<()> {
/// let metadata = Metadata::new()
///     .with_profile(
///         Profile::new("iso")
///             .direction(Direction::Inbound, ["0200"])
///             .direction(Direction::Outbound, ["0210"])
///             .correlate_on([11, 37]),
///     )
///     .with_channel(
///         ChannelConfig::new("pay", "iso")
///             .with_server(ServerConfig::new("0.0.0.0", 9100))
///             .with_client(ClientConfig::new(vec!["10.1.1.1:7000".parse().unwrap()])),
///     );
///
/// let gateway = Gateway::new(GatewayOptions::new(OverflowPolicy::Block), metadata)?;
/// gateway.start()?;
/// # Ok(())
/// # }
/// ```
pub struct Gateway {
    options: Arc<GatewayOptions>,
    metadata: Arc<ArcSwap<Metadata>>,
    registry: Arc<TransportRegistry>,
    correlations: Arc<CorrelationStore>,
    events: Arc<EventHub>,
    wire: Wire,
    running: Mutex<Option<Running>>,
    // Serializes start, stop, reload and socket administration.
    admin: Mutex<()>,
}

impl Gateway {
    /// Gateway with the standard wire format (2-byte length, reference field codec).
    pub fn new(options: GatewayOptions, metadata: Metadata) -> Result<Self> {
        let wire = Wire::standard(&options);
        Self::with_wire(options, metadata, wire)
    }

    pub fn with_wire(options: GatewayOptions, metadata: Metadata, wire: Wire) -> Result<Self> {
        metadata.validate()?;
        Ok(Self {
            correlations: Arc::new(CorrelationStore::new(options.correlation_ttl)),
            options: Arc::new(options),
            metadata: Arc::new(ArcSwap::from_pointee(metadata)),
            registry: Arc::new(TransportRegistry::new()),
            events: Arc::new(EventHub::new()),
            wire,
            running: Mutex::new(None),
            admin: Mutex::new(()),
        })
    }

    /// Start I/O loops, pipeline workers, the correlation sweeper and every
    /// configured transport.
    ///
    /// Fails, leaving the gateway stopped, if any transport cannot start.
    pub fn start(&self) -> Result<()> {
        let _admin = self.admin.lock();
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let loops = Arc::new(IoLoops::new(self.options.io_threads)?);
        let pipeline = Pipeline::start(
            &self.options,
            Arc::clone(&self.metadata),
            Arc::clone(&self.registry),
            Arc::clone(&self.correlations),
        )?;
        let sweeper = self.correlations.spawn_sweeper()?;
        let ctx = SocketContext {
            loops,
            ingress: pipeline.ingress(),
            wire: self.wire.clone(),
            events: Arc::clone(&self.events),
            options: Arc::clone(&self.options),
        };

        let metadata = self.metadata.load_full();
        for channel in &metadata.channels {
            if let Err(e) = self.start_channel(&ctx, channel) {
                error!(channel = %channel.name, "[Gateway] Startup failed: {}", e);
                self.stop_all(&ctx);
                pipeline.shutdown();
                ctx.loops.shutdown();
                return Err(e);
            }
        }

        info!(
            channels = metadata.channels.len(),
            transports = self.registry.len(),
            "[Gateway] Started"
        );
        *running = Some(Running {
            ctx,
            pipeline,
            _sweeper: sweeper,
        });
        Ok(())
    }

    /// Stop every transport and background thread. Pending correlations are
    /// kept until they expire or the gateway is dropped.
    pub fn shutdown(&self) {
        let _admin = self.admin.lock();
        let Some(running) = self.running.lock().take() else {
            return;
        };
        self.stop_all(&running.ctx);
        running.pipeline.shutdown();
        running.ctx.loops.shutdown();
        info!("[Gateway] Stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Apply a new configuration snapshot to the running gateway.
    ///
    /// Channels are compared by name. Removed channels are stopped; added
    /// ones are started. A modified channel whose only change is its server
    /// allow-list keeps its transports and has the list swapped in place,
    /// closing connections that are no longer admitted. Any other change
    /// rebuilds the channel's transports.
    pub fn reload(&self, metadata: Metadata) -> Result<ReloadSummary> {
        metadata.validate()?;
        let _admin = self.admin.lock();
        let ctx = self.running.lock().as_ref().map(|r| r.ctx.clone());

        let current = self.metadata.load_full();
        let diff = current.diff(&metadata);
        let mut summary = ReloadSummary::default();
        let mut to_start: Vec<ChannelConfig> = Vec::new();

        for channel in &diff.removed {
            if let Some(ctx) = &ctx {
                self.stop_channel(ctx, &channel.name);
            }
            summary.removed.push(channel.name.clone());
        }

        for (old, new) in &diff.modified {
            if old.only_allow_list_changed(new) {
                let key = SocketKey::server(new.name.clone());
                if let (Some(server), Some(transport)) = (&new.server, self.registry.get(&key)) {
                    summary.connections_closed += transport.replace_access_list(server.access_list());
                }
                summary.allow_list_updated.push(new.name.clone());
            } else {
                if let Some(ctx) = &ctx {
                    self.stop_channel(ctx, &old.name);
                }
                summary.rebuilt.push(new.name.clone());
                to_start.push(new.clone());
            }
        }

        for channel in &diff.added {
            summary.added.push(channel.name.clone());
            to_start.push(channel.clone());
        }

        // New transports must classify against the new snapshot.
        self.metadata.store(Arc::new(metadata));

        if let Some(ctx) = &ctx {
            for channel in &to_start {
                if let Err(e) = self.start_channel(ctx, channel) {
                    warn!(channel = %channel.name, "[Gateway] Reloaded channel failed to start: {}", e);
                    summary.failed.push((channel.name.clone(), e.to_string()));
                }
            }
        }

        info!(
            added = summary.added.len(),
            removed = summary.removed.len(),
            rebuilt = summary.rebuilt.len(),
            allow_lists = summary.allow_list_updated.len(),
            closed = summary.connections_closed,
            "[Gateway] Reloaded"
        );
        Ok(summary)
    }

    /// Start (or re-start) one logical socket from the current configuration.
    pub fn start_socket(&self, key: &SocketKey) -> Result<()> {
        let _admin = self.admin.lock();
        let ctx = self.context()?;
        if let Some(transport) = self.registry.get(key) {
            return transport.start(&ctx);
        }
        let transport = self.build_transport(key)?;
        self.registry.insert(Arc::clone(&transport));
        transport.start(&ctx)
    }

    /// Stop one logical socket. It stays registered and can be started again.
    pub fn stop_socket(&self, key: &SocketKey) -> Result<usize> {
        let _admin = self.admin.lock();
        let ctx = self.context()?;
        let transport = self.transport(key)?;
        Ok(transport.stop(&ctx))
    }

    pub fn restart_socket(&self, key: &SocketKey) -> Result<()> {
        let _admin = self.admin.lock();
        let ctx = self.context()?;
        self.transport(key)?.restart(&ctx)
    }

    /// Close one connection wherever it lives. Client links reconnect.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        let closed = self
            .registry
            .snapshot()
            .iter()
            .any(|transport| transport.close_connection(id));
        if closed {
            debug!(connection = %id, "[Gateway] Connection closed by request");
        }
        closed
    }

    /// Status of every registered socket, ordered by key.
    pub fn status(&self) -> Vec<SocketStatus> {
        self.registry.snapshot().iter().map(|t| t.status()).collect()
    }

    pub fn socket_status(&self, key: &SocketKey) -> Option<SocketStatus> {
        self.registry.get(key).map(|t| t.status())
    }

    /// Requests still waiting for a reply.
    pub fn pending_correlations(&self) -> usize {
        self.correlations.len()
    }

    /// Subscribe to socket lifecycle events.
    pub fn monitor(&self) -> SocketMonitor {
        self.events.subscribe()
    }

    /// Current configuration snapshot.
    pub fn metadata(&self) -> Arc<Metadata> {
        self.metadata.load_full()
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    /// Bound address of a running listener.
    pub fn local_addr(&self, key: &SocketKey) -> Option<SocketAddr> {
        self.registry.get(key).and_then(|t| t.local_addr())
    }

    pub fn transport(&self, key: &SocketKey) -> Result<Arc<Transport>> {
        self.registry
            .get(key)
            .ok_or_else(|| GatewayError::config_mismatch(format!("no socket {key}")))
    }

    fn context(&self) -> Result<SocketContext> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.ctx.clone())
            .ok_or_else(|| GatewayError::transport_down("gateway is not running"))
    }

    fn build_transport(&self, key: &SocketKey) -> Result<Arc<Transport>> {
        let metadata = self.metadata.load();
        let channel = metadata
            .channel(&key.channel)
            .ok_or_else(|| GatewayError::config_mismatch(format!("no channel {}", key.channel)))?;
        channel_transports(channel, &self.options)
            .into_iter()
            .find(|t| t.key() == key)
            .ok_or_else(|| GatewayError::config_mismatch(format!("no socket {key}")))
    }

    fn start_channel(&self, ctx: &SocketContext, channel: &ChannelConfig) -> Result<()> {
        for transport in channel_transports(channel, &self.options) {
            if let Some(previous) = self.registry.insert(Arc::clone(&transport)) {
                previous.stop(ctx);
            }
            transport.start(ctx)?;
        }
        debug!(channel = %channel.name, "[Gateway] Channel started");
        Ok(())
    }

    fn stop_channel(&self, ctx: &SocketContext, name: &str) {
        for key in [SocketKey::server(name), SocketKey::client(name)] {
            if let Some(transport) = self.registry.remove(&key) {
                transport.stop(ctx);
            }
        }
        debug!(channel = name, "[Gateway] Channel stopped");
    }

    fn stop_all(&self, ctx: &SocketContext) {
        for transport in self.registry.snapshot() {
            self.registry.remove(transport.key());
            transport.stop(ctx);
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("running", &self.is_running())
            .field("transports", &self.registry.len())
            .field("pending", &self.correlations.len())
            .finish_non_exhaustive()
    }
}

fn channel_transports(channel: &ChannelConfig, options: &GatewayOptions) -> Vec<Arc<Transport>> {
    let mut transports = Vec::with_capacity(2);
    if let Some(server) = &channel.server {
        transports.push(Arc::new(Transport::server(
            SocketKey::server(channel.name.clone()),
            server,
        )));
    }
    if let Some(client) = &channel.client {
        transports.push(Arc::new(Transport::client(
            SocketKey::client(channel.name.clone()),
            client,
            options,
        )));
    }
    transports
}
