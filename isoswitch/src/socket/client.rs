//! Outbound client socket: one link to one target, reconnected with backoff.

use compio::net::TcpStream;
use flume::{Receiver, Sender};
use futures::{select, FutureExt};
use isoswitch_core::connection::{Connection, SocketKey};
use isoswitch_core::endpoint::{AccessList, SocketEndpoint};
use isoswitch_core::error::Result;
use isoswitch_core::monitor::SocketEvent;
use isoswitch_core::pool::ConnectionPool;
use isoswitch_core::reconnect::{Attempt, LinkState, ReconnectController};
use isoswitch_core::tcp::enable_tcp_nodelay;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::{pump, SocketContext};

/// Client link to a single target endpoint.
///
/// Owns a pool holding at most one live connection. The driver task keeps
/// the link up until [`ClientSocket::stop`] is called.
pub struct ClientSocket {
    key: SocketKey,
    target: SocketEndpoint,
    pool: Arc<ConnectionPool>,
    controller: Arc<ReconnectController>,
    stop_tx: Mutex<Option<Sender<()>>>,
}

impl ClientSocket {
    pub fn new(key: SocketKey, target: SocketEndpoint, controller: ReconnectController) -> Self {
        let pool = Arc::new(ConnectionPool::new(key.clone(), AccessList::allow_all()));
        Self {
            key,
            target,
            pool,
            controller: Arc::new(controller),
            stop_tx: Mutex::new(None),
        }
    }

    #[inline]
    pub fn target(&self) -> &SocketEndpoint {
        &self.target
    }

    #[inline]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn link_state(&self) -> LinkState {
        self.controller.state()
    }

    pub fn retry_count(&self) -> u32 {
        self.controller.retry_count()
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.lock().is_some()
    }

    /// Start the driver. The first connect attempt runs immediately.
    ///
    /// Starting a running client is a no-op.
    pub fn start(&self, ctx: &SocketContext) -> Result<()> {
        let mut slot = self.stop_tx.lock();
        if slot.is_some() {
            return Ok(());
        }

        self.controller.resume();
        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let driver = Driver {
            key: self.key.clone(),
            target: self.target.clone(),
            pool: Arc::clone(&self.pool),
            controller: Arc::clone(&self.controller),
            ctx: ctx.clone(),
        };
        ctx.loops.spawn(move || driver.run(stop_rx))?;
        *slot = Some(stop_tx);
        debug!(socket = %self.key, target = %self.target, "[Client] Started");
        Ok(())
    }

    /// Stop reconnecting and close the live connection, if any.
    pub fn stop(&self) -> usize {
        self.controller.stop();
        let was_running = self.stop_tx.lock().take().is_some();
        let closed = self.pool.close_all();
        if was_running {
            debug!(socket = %self.key, target = %self.target, closed, "[Client] Stopped");
        }
        closed
    }
}

struct Driver {
    key: SocketKey,
    target: SocketEndpoint,
    pool: Arc<ConnectionPool>,
    controller: Arc<ReconnectController>,
    ctx: SocketContext,
}

impl Driver {
    async fn run(self, stop_rx: Receiver<()>) {
        loop {
            let Some(attempt) = self.controller.try_begin_attempt() else {
                trace!(socket = %self.key, target = %self.target, "[Client] Attempt refused");
                break;
            };

            let connect = compio::time::timeout(
                self.ctx.options.connect_timeout,
                TcpStream::connect((self.target.host(), self.target.port())),
            );
            let outcome = select! {
                _ = stop_rx.recv_async().fuse() => None,
                res = connect.fuse() => Some(res),
            };

            let delay = match outcome {
                None => {
                    self.controller.on_connect_failed(attempt);
                    break;
                }
                Some(Ok(Ok(stream))) => self.session(stream, attempt, &stop_rx).await,
                Some(Ok(Err(e))) => self.connect_failed(e, attempt),
                Some(Err(_elapsed)) => self.connect_failed(
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                    attempt,
                ),
            };

            let Some(delay) = delay else { break };
            trace!(socket = %self.key, target = %self.target, ?delay, "[Client] Reconnect scheduled");
            select! {
                _ = stop_rx.recv_async().fuse() => break,
                _ = compio::time::sleep(delay).fuse() => {}
            }
        }
        trace!(socket = %self.key, target = %self.target, "[Client] Driver exiting");
    }

    fn connect_failed(&self, e: io::Error, attempt: Attempt) -> Option<Duration> {
        warn!(socket = %self.key, target = %self.target, "[Client] Connect failed: {}", e);
        self.ctx.events.emit(SocketEvent::ConnectFailed {
            socket: self.key.clone(),
            target: self.target.clone(),
            reason: e.to_string(),
        });
        self.controller.on_connect_failed(attempt)
    }

    /// Run one established connection to completion.
    async fn session(&self, stream: TcpStream, attempt: Attempt, stop_rx: &Receiver<()>) -> Option<Duration> {
        if !self.controller.on_connected(attempt) {
            return None;
        }

        let (local, remote) = match (stream.local_addr(), stream.peer_addr()) {
            (Ok(local), Ok(remote)) => (local, remote),
            (Err(e), _) | (_, Err(e)) => return self.connect_failed(e, attempt),
        };
        if let Err(e) = enable_tcp_nodelay(&stream) {
            trace!(socket = %self.key, "[Client] TCP_NODELAY not set: {}", e);
        }

        let (conn, cmd_rx) = Connection::new(self.key.clone(), self.target.clone(), local, remote);
        if !self.pool.add_connection(Arc::clone(&conn)) {
            return self.controller.on_disconnected(attempt);
        }
        info!(socket = %self.key, connection = %conn.id(), target = %self.target, "[Client] Connected");
        self.ctx.events.emit(SocketEvent::Connected {
            socket: self.key.clone(),
            connection: conn.id(),
            target: self.target.clone(),
        });

        let mut session = Box::pin(
            pump::run_connection(
                stream,
                Arc::clone(&conn),
                cmd_rx,
                Arc::clone(&self.pool),
                self.ctx.clone(),
            )
            .fuse(),
        );
        select! {
            _ = stop_rx.recv_async().fuse() => {
                conn.close();
                (&mut session).await;
                return None;
            }
            () = session => {}
        }

        info!(socket = %self.key, connection = %conn.id(), target = %self.target, "[Client] Disconnected");
        self.controller.on_disconnected(attempt)
    }
}
