//! Gateway sockets: listeners, outbound clients and the per-connection pump.
//!
//! Everything here runs on the I/O loops. Sockets hand decoded messages to
//! the pipeline through [`Ingress`] and report lifecycle changes through
//! [`EventHub`].

mod client;
mod listener;
mod pump;

pub use client::ClientSocket;
pub use listener::ListenerSocket;

use flume::{Sender, TrySendError};
use isoswitch_core::message::Message;
use isoswitch_core::monitor::{SocketEvent, SocketEventSender, SocketMonitor};
use isoswitch_core::options::{GatewayOptions, OverflowPolicy};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

use crate::io_loop::IoLoops;
use crate::wire::Wire;

/// Entry point of the routing pipeline, used by connection readers.
#[derive(Clone)]
pub struct Ingress {
    tx: Sender<Message>,
    overflow: OverflowPolicy,
}

impl Ingress {
    pub(crate) fn new(tx: Sender<Message>, overflow: OverflowPolicy) -> Self {
        Self { tx, overflow }
    }

    /// Queue a decoded message. Never blocks the I/O thread.
    ///
    /// Returns `false` if the message was dropped.
    pub async fn push(&self, msg: Message) -> bool {
        match self.overflow {
            OverflowPolicy::Block => self.tx.send_async(msg).await.is_ok(),
            OverflowPolicy::Reject => match self.tx.try_send(msg) {
                Ok(()) => true,
                Err(TrySendError::Full(msg)) => {
                    warn!(
                        channel = %msg.channel,
                        connection = %msg.origin.id(),
                        mti = msg.mti().unwrap_or("-"),
                        "[Ingress] Receive queue full, message dropped"
                    );
                    false
                }
                Err(TrySendError::Disconnected(_)) => false,
            },
        }
    }
}

/// Fan-out of socket events to every monitor handle.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<SocketEventSender>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new monitor.
    pub fn subscribe(&self) -> SocketMonitor {
        let (tx, rx) = isoswitch_core::monitor::create_monitor();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event; monitors whose receiver is gone are dropped.
    pub fn emit(&self, event: SocketEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Everything a socket needs at runtime.
#[derive(Clone)]
pub struct SocketContext {
    pub loops: Arc<IoLoops>,
    pub ingress: Ingress,
    pub wire: Wire,
    pub events: Arc<EventHub>,
    pub options: Arc<GatewayOptions>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use isoswitch_core::connection::SocketKey;

    #[test]
    fn test_event_hub_fans_out() {
        let hub = EventHub::new();
        let a = hub.subscribe();
        let b = hub.subscribe();
        hub.emit(SocketEvent::Stopped {
            socket: SocketKey::server("pay"),
        });
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_ok());

        drop(b);
        hub.emit(SocketEvent::Stopped {
            socket: SocketKey::server("pay"),
        });
        assert_eq!(hub.subscribers.lock().len(), 1);
    }
}
