//! Reconnection state machine with exponential backoff.
//!
//! [`ReconnectController`] is sans-IO: the client socket driver asks it
//! whether an attempt may start, reports outcomes, and sleeps for the delay
//! it hands back. States move `Disconnected → Connecting → Connected →
//! Disconnected`; at most one attempt is in progress at a time.
//!
//! Every attempt carries the generation it started in. `stop` opens a new
//! generation, so outcomes reported by a driver that outlived a restart are
//! ignored and never hold the attempt slot.
//!
//! The delay for retry `n` is `min(max, base * 2^n)`, and `n` resets on a
//! successful connect.

use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;

use crate::options::GatewayOptions;

/// Shift cap for the backoff multiplier; the ceiling applies long before.
const MAX_BACKOFF_SHIFT: u32 = 20;

/// Link state of one outbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
        }
    }
}

/// Token for one claimed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    generation: u64,
}

#[derive(Debug)]
struct Inner {
    state: LinkState,
    retry_count: u32,
    attempting: bool,
    stopped: bool,
    generation: u64,
}

/// Reconnect bookkeeping for one client target.
///
/// # Example
///
/// ```rust
/// use isoswitch_core::reconnect::ReconnectController;
/// use std::time::Duration;
///
/// let ctl = ReconnectController::new(Duration::from_secs(1), Duration::from_secs(30));
///
/// let attempt = ctl.try_begin_attempt().unwrap();
/// assert_eq!(ctl.on_connect_failed(attempt), Some(Duration::from_secs(1)));
/// let attempt = ctl.try_begin_attempt().unwrap();
/// assert_eq!(ctl.on_connect_failed(attempt), Some(Duration::from_secs(2)));
///
/// let attempt = ctl.try_begin_attempt().unwrap();
/// ctl.on_connected(attempt);
/// assert_eq!(ctl.retry_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectController {
    base: Duration,
    max: Duration,
    inner: Mutex<Inner>,
}

impl ReconnectController {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            inner: Mutex::new(Inner {
                state: LinkState::Disconnected,
                retry_count: 0,
                attempting: false,
                stopped: false,
                generation: 0,
            }),
        }
    }

    /// Controller using the gateway's reconnect interval settings.
    pub fn from_options(options: &GatewayOptions) -> Self {
        Self::new(options.reconnect_ivl, options.reconnect_ivl_max)
    }

    pub fn state(&self) -> LinkState {
        self.inner.lock().state
    }

    /// Consecutive failed attempts since the last successful connect.
    #[inline]
    pub fn retry_count(&self) -> u32 {
        self.inner.lock().retry_count
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    /// Claim the single attempt slot.
    ///
    /// Returns `None` if stopped or if another attempt is already running.
    pub fn try_begin_attempt(&self) -> Option<Attempt> {
        let mut inner = self.inner.lock();
        if inner.stopped || inner.attempting {
            return None;
        }
        inner.attempting = true;
        inner.state = LinkState::Connecting;
        Some(Attempt {
            generation: inner.generation,
        })
    }

    /// Whether an attempt belongs to the running generation.
    pub fn is_current(&self, attempt: Attempt) -> bool {
        self.inner.lock().generation == attempt.generation
    }

    /// Record a successful connect.
    ///
    /// Returns `false` if the controller was stopped while the attempt was
    /// running; the caller then closes the fresh connection.
    pub fn on_connected(&self, attempt: Attempt) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != attempt.generation {
            return false;
        }
        inner.attempting = false;
        inner.retry_count = 0;
        if inner.stopped {
            inner.state = LinkState::Disconnected;
            return false;
        }
        inner.state = LinkState::Connected;
        true
    }

    /// Record a failed attempt. Returns the delay before the next one, or
    /// `None` once stopped.
    pub fn on_connect_failed(&self, attempt: Attempt) -> Option<Duration> {
        let mut inner = self.inner.lock();
        if inner.generation != attempt.generation {
            return None;
        }
        inner.attempting = false;
        inner.state = LinkState::Disconnected;
        self.schedule(&mut inner)
    }

    /// Record loss of an established connection. Returns the delay before
    /// the next attempt, or `None` once stopped.
    pub fn on_disconnected(&self, attempt: Attempt) -> Option<Duration> {
        let mut inner = self.inner.lock();
        if inner.generation != attempt.generation {
            return None;
        }
        inner.state = LinkState::Disconnected;
        self.schedule(&mut inner)
    }

    /// Refuse further attempts and invalidate the one in progress.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        inner.attempting = false;
        inner.generation = inner.generation.wrapping_add(1);
        inner.state = LinkState::Disconnected;
    }

    /// Clear the stopped flag and the retry count.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        inner.retry_count = 0;
        inner.stopped = false;
    }

    /// Delay for a given retry number.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(MAX_BACKOFF_SHIFT);
        self.base.saturating_mul(factor).min(self.max)
    }

    fn schedule(&self, inner: &mut Inner) -> Option<Duration> {
        if inner.stopped {
            return None;
        }
        let retry = inner.retry_count;
        inner.retry_count = retry.saturating_add(1);
        Some(self.delay_for(retry))
    }
}
