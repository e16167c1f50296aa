//! Gateway configuration options
//!
//! Runtime knobs for the routing engine: I/O loop sizing, correlation TTL,
//! reconnect backoff and the per-stage queue/worker configuration.
//!
//! Queue-full behaviour is never defaulted. Callers pick an
//! [`OverflowPolicy`] when constructing [`GatewayOptions`], and may override it
//! per stage afterwards.

use std::time::Duration;

/// Default read buffer size (8KB)
pub const DEFAULT_READ_BUF_SIZE: usize = 8192;

/// Default maximum frame payload (64KB)
///
/// ISO-8583 messages rarely exceed a few KB; anything larger is treated as a
/// framing error and closes the connection.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default per-stage queue capacity
pub const DEFAULT_STAGE_CAPACITY: usize = 4096;

/// What a stage queue does when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Producer waits for room (backpressure)
    Block,
    /// Producer fails immediately and the message is dropped
    Reject,
}

/// Queue and worker configuration for one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOptions {
    /// Bounded queue capacity (messages)
    pub capacity: usize,
    /// Number of worker threads draining the queue
    pub workers: usize,
    /// Queue-full behaviour
    pub overflow: OverflowPolicy,
}

impl StageOptions {
    /// Create stage options. Capacity and workers are clamped to at least 1.
    #[must_use]
    pub fn new(capacity: usize, workers: usize, overflow: OverflowPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            workers: workers.max(1),
            overflow,
        }
    }
}

/// Gateway configuration options.
///
/// # Examples
///
/// ```
/// use isoswitch_core::options::{GatewayOptions, OverflowPolicy, StageOptions};
/// use std::time::Duration;
///
/// let opts = GatewayOptions::new(OverflowPolicy::Block)
///     .with_correlation_ttl(Duration::from_secs(45))
///     .with_outbound_stage(StageOptions::new(1024, 8, OverflowPolicy::Reject));
/// assert_eq!(opts.outbound.overflow, OverflowPolicy::Reject);
/// ```
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Number of I/O loop threads (each runs its own compio runtime)
    ///
    /// - Default: number of CPUs, at least 2
    pub io_threads: usize,

    /// Correlation entry time-to-live
    ///
    /// Pending requests older than this are dropped; the background sweep
    /// runs at the same interval.
    /// - Default: 30 seconds
    pub correlation_ttl: Duration,

    /// Initial reconnect delay for outbound connections
    ///
    /// - Default: 1 second
    pub reconnect_ivl: Duration,

    /// Reconnect delay ceiling
    ///
    /// - Default: 30 seconds
    pub reconnect_ivl_max: Duration,

    /// Maximum time to wait for an outbound TCP connect
    ///
    /// - Default: 5 seconds
    pub connect_timeout: Duration,

    /// Read buffer size (bytes) per read call
    pub read_buffer_size: usize,

    /// Largest accepted frame payload (bytes)
    pub max_frame_size: usize,

    /// Decoded messages awaiting channel/direction resolution
    pub receive: StageOptions,

    /// Requests awaiting forwarding
    pub inbound: StageOptions,

    /// Replies awaiting delivery to their origin
    pub outbound: StageOptions,

    /// Failed or unclassifiable messages awaiting logging
    pub unroutable: StageOptions,
}

impl GatewayOptions {
    /// Create options with defaults and the given queue-full policy for every stage.
    pub fn new(overflow: OverflowPolicy) -> Self {
        let workers = num_workers();
        Self {
            io_threads: workers.max(2),
            correlation_ttl: Duration::from_secs(30),
            reconnect_ivl: Duration::from_secs(1),
            reconnect_ivl_max: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            read_buffer_size: DEFAULT_READ_BUF_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            receive: StageOptions::new(DEFAULT_STAGE_CAPACITY, workers, overflow),
            inbound: StageOptions::new(DEFAULT_STAGE_CAPACITY, workers, overflow),
            outbound: StageOptions::new(DEFAULT_STAGE_CAPACITY, workers, overflow),
            unroutable: StageOptions::new(DEFAULT_STAGE_CAPACITY, 1, overflow),
        }
    }

    /// Set number of I/O loop threads.
    pub fn with_io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads.max(1);
        self
    }

    /// Set correlation TTL.
    pub fn with_correlation_ttl(mut self, ttl: Duration) -> Self {
        self.correlation_ttl = ttl;
        self
    }

    /// Set reconnection interval.
    pub fn with_reconnect_ivl(mut self, ivl: Duration) -> Self {
        self.reconnect_ivl = ivl;
        self
    }

    /// Set maximum reconnection interval for exponential backoff.
    pub fn with_reconnect_ivl_max(mut self, max: Duration) -> Self {
        self.reconnect_ivl_max = max;
        self
    }

    /// Set connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set read buffer size.
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set maximum frame payload size.
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Override the receive stage.
    pub fn with_receive_stage(mut self, stage: StageOptions) -> Self {
        self.receive = stage;
        self
    }

    /// Override the inbound (request) stage.
    pub fn with_inbound_stage(mut self, stage: StageOptions) -> Self {
        self.inbound = stage;
        self
    }

    /// Override the outbound (reply) stage.
    pub fn with_outbound_stage(mut self, stage: StageOptions) -> Self {
        self.outbound = stage;
        self
    }

    /// Override the unroutable stage.
    pub fn with_unroutable_stage(mut self, stage: StageOptions) -> Self {
        self.unroutable = stage;
        self
    }
}

fn num_workers() -> usize {
    num_cpus::get().max(1)
}
