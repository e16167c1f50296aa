//! Listener socket: accepts inbound connections into a pool.

use compio::net::{TcpListener, TcpStream};
use flume::{Receiver, RecvTimeoutError, Sender};
use futures::{select, FutureExt};
use isoswitch_core::connection::{Connection, SocketKey};
use isoswitch_core::endpoint::SocketEndpoint;
use isoswitch_core::error::{GatewayError, Result};
use isoswitch_core::metadata::ServerConfig;
use isoswitch_core::monitor::SocketEvent;
use isoswitch_core::pool::ConnectionPool;
use isoswitch_core::tcp::enable_tcp_nodelay;
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

use super::{pump, SocketContext};
use crate::io_loop::IoLoops;

/// How long `start` and `stop` wait on the I/O loop.
const BIND_WAIT: Duration = Duration::from_secs(10);

struct Running {
    // Dropping the sender stops the accept loop.
    stop: Sender<()>,
    // Disconnects once the listening socket is closed.
    done: Receiver<()>,
    local_addr: SocketAddr,
}

/// Accept loop plus connection pool for one server channel.
pub struct ListenerSocket {
    key: SocketKey,
    host: String,
    port: u16,
    pool: Arc<ConnectionPool>,
    running: Mutex<Option<Running>>,
}

impl ListenerSocket {
    pub fn new(key: SocketKey, config: &ServerConfig) -> Self {
        let pool = Arc::new(ConnectionPool::new(key.clone(), config.access_list()));
        Self {
            key,
            host: config.host.clone(),
            port: config.port,
            pool,
            running: Mutex::new(None),
        }
    }

    #[inline]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Bind and start accepting. Blocks until the bind completes.
    ///
    /// Starting a running listener is a no-op.
    pub fn start(&self, ctx: &SocketContext) -> Result<SocketAddr> {
        let mut running = self.running.lock();
        if let Some(r) = running.as_ref() {
            return Ok(r.local_addr);
        }

        let (stop_tx, stop_rx) = flume::bounded::<()>(1);
        let (ready_tx, ready_rx) = flume::bounded::<io::Result<SocketAddr>>(1);
        let (done_tx, done_rx) = flume::bounded::<()>(1);
        let bind_host = bind_host(&self.host).to_string();
        let port = self.port;
        let key = self.key.clone();
        let pool = Arc::clone(&self.pool);
        let task_ctx = ctx.clone();

        ctx.loops.spawn(move || async move {
            let listener = match TcpListener::bind((bind_host.as_str(), port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let addr = match listener.local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(addr));
            accept_loop(&listener, stop_rx, &key, &pool, &task_ctx).await;
            if let Err(e) = listener.close().await {
                trace!(socket = %key, "[Listener] Close: {}", e);
            }
            drop(done_tx);
        })?;

        let bound = ready_rx
            .recv_timeout(BIND_WAIT)
            .map_err(|_| GatewayError::transport_down(format!("{}: listener never started", self.key)))
            .and_then(|res| res.map_err(GatewayError::from));

        match bound {
            Ok(addr) => {
                debug!(socket = %self.key, %addr, "[Listener] Listening");
                ctx.events.emit(SocketEvent::Listening {
                    socket: self.key.clone(),
                    addr,
                });
                *running = Some(Running {
                    stop: stop_tx,
                    done: done_rx,
                    local_addr: addr,
                });
                Ok(addr)
            }
            Err(e) => {
                error!(socket = %self.key, host = %self.host, port = self.port, "[Listener] Bind failed: {}", e);
                ctx.events.emit(SocketEvent::BindFailed {
                    socket: self.key.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Stop accepting and close every connection.
    ///
    /// Returns once the listening socket is closed, so the port can be bound
    /// again right away.
    pub fn stop(&self) -> usize {
        let running = self.running.lock().take();
        // Drain the pool only once the accept loop is gone.
        let was_running = running.is_some();
        if let Some(Running { stop, done, .. }) = running {
            drop(stop);
            if let Err(RecvTimeoutError::Timeout) = done.recv_timeout(BIND_WAIT) {
                warn!(socket = %self.key, "[Listener] Listening socket not closed in time");
            }
        }
        let closed = self.pool.close_all();
        if was_running {
            debug!(socket = %self.key, closed, "[Listener] Stopped");
        }
        closed
    }
}

fn bind_host(host: &str) -> &str {
    match host {
        "" | "*" => "0.0.0.0",
        "[::]" => "::",
        other => other,
    }
}

async fn accept_loop(
    listener: &TcpListener,
    stop_rx: Receiver<()>,
    key: &SocketKey,
    pool: &Arc<ConnectionPool>,
    ctx: &SocketContext,
) {
    loop {
        select! {
            _ = stop_rx.recv_async().fuse() => {
                trace!(socket = %key, "[Listener] Accept loop stopping");
                break;
            }
            accepted = listener.accept().fuse() => match accepted {
                Ok((stream, remote)) => admit(stream, remote, key, pool, ctx),
                Err(e) => {
                    warn!(socket = %key, "[Listener] Accept failed: {}", e);
                    compio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

fn admit(
    stream: TcpStream,
    remote: SocketAddr,
    key: &SocketKey,
    pool: &Arc<ConnectionPool>,
    ctx: &SocketContext,
) {
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            warn!(socket = %key, %remote, "[Listener] No local address: {}", e);
            return;
        }
    };
    let endpoint = pool
        .resolve_endpoint(remote)
        .unwrap_or_else(|| SocketEndpoint::from_addr(remote));
    let (conn, cmd_rx) = Connection::new(key.clone(), endpoint, local, remote);

    if !pool.add_connection(Arc::clone(&conn)) {
        ctx.events.emit(SocketEvent::Rejected {
            socket: key.clone(),
            remote,
        });
        // Dropping the stream closes it
        return;
    }

    if let Err(e) = enable_tcp_nodelay(&stream) {
        trace!(connection = %conn.id(), "[Listener] TCP_NODELAY not set: {}", e);
    }

    // Hand the stream to the next loop so connections spread across threads.
    let pump_ctx = ctx.clone();
    let pump_pool = Arc::clone(pool);
    let pump_conn = Arc::clone(&conn);
    let handed = hand_off(&ctx.loops, pool, &conn, move || {
        pump::run_connection(stream, pump_conn, cmd_rx, pump_pool, pump_ctx)
    });
    if handed {
        debug!(socket = %key, connection = %conn.id(), %remote, "[Listener] Accepted");
        ctx.events.emit(SocketEvent::Accepted {
            socket: key.clone(),
            connection: conn.id(),
            remote,
        });
    }
}

/// Start the pump of a registered connection on the next loop.
///
/// If no loop takes it the connection is closed and unregistered; the
/// stream inside `make` is dropped with the job.
fn hand_off<F, Fut>(loops: &IoLoops, pool: &ConnectionPool, conn: &Connection, make: F) -> bool
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + 'static,
{
    match loops.spawn(make) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                socket = %pool.socket(),
                connection = %conn.id(),
                remote = %conn.remote_addr(),
                "[Listener] Could not schedule connection: {}", e
            );
            conn.close();
            pool.remove_connection(conn);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{EventHub, Ingress};
    use crate::wire::Wire;
    use isoswitch_core::endpoint::AccessList;
    use isoswitch_core::options::{GatewayOptions, OverflowPolicy};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn pooled(pool: &ConnectionPool) -> Arc<Connection> {
        let remote: SocketAddr = "10.0.0.9:4000".parse().unwrap();
        let (conn, _rx) = Connection::new(
            pool.socket().clone(),
            SocketEndpoint::from_addr(remote),
            "10.0.0.1:9100".parse().unwrap(),
            remote,
        );
        assert!(pool.add_connection(Arc::clone(&conn)));
        conn
    }

    #[test]
    fn test_bind_host_wildcards() {
        assert_eq!(bind_host(""), "0.0.0.0");
        assert_eq!(bind_host("*"), "0.0.0.0");
        assert_eq!(bind_host("[::]"), "::");
        assert_eq!(bind_host("127.0.0.1"), "127.0.0.1");
    }

    #[test]
    fn test_hand_off_runs_job() {
        let loops = IoLoops::new(1).unwrap();
        let pool = ConnectionPool::new(SocketKey::server("pay"), AccessList::allow_all());
        let conn = pooled(&pool);
        let (tx, rx) = flume::bounded(1);

        assert!(hand_off(&loops, &pool, &conn, move || async move {
            tx.send(()).unwrap();
        }));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(conn.is_active());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_hand_off_failure_unregisters() {
        let loops = IoLoops::new(1).unwrap();
        loops.shutdown();
        let pool = ConnectionPool::new(SocketKey::server("pay"), AccessList::allow_all());
        let conn = pooled(&pool);

        assert!(!hand_off(&loops, &pool, &conn, || async {}));
        assert!(!conn.is_active());
        assert!(pool.is_empty());
        assert!(pool.candidates().is_empty());
    }

    #[test]
    fn test_stop_leaves_no_connections_behind() {
        let options = GatewayOptions::new(OverflowPolicy::Reject);
        let (ingress_tx, _ingress_rx) = flume::bounded(64);
        let ctx = SocketContext {
            loops: Arc::new(IoLoops::new(2).unwrap()),
            ingress: Ingress::new(ingress_tx, OverflowPolicy::Reject),
            wire: Wire::standard(&options),
            events: Arc::new(EventHub::new()),
            options: Arc::new(options),
        };
        let listener = ListenerSocket::new(SocketKey::server("pay"), &ServerConfig::new("127.0.0.1", 0));
        let addr = listener.start(&ctx).unwrap();

        // Keep dialing while the listener stops; held streams stay open.
        let dialing = Arc::new(AtomicBool::new(true));
        let dialer = {
            let dialing = Arc::clone(&dialing);
            thread::spawn(move || {
                let mut held = Vec::new();
                while dialing.load(Ordering::Acquire) {
                    if let Ok(stream) = std::net::TcpStream::connect(addr) {
                        held.push(stream);
                    }
                }
                held
            })
        };
        thread::sleep(Duration::from_millis(50));

        listener.stop();
        assert!(!listener.is_running());
        thread::sleep(Duration::from_millis(50));
        dialing.store(false, Ordering::Release);
        let held = dialer.join().unwrap();

        assert_eq!(listener.pool().len(), 0);
        assert_eq!(listener.pool().active_count(), 0);
        drop(held);
    }
}
