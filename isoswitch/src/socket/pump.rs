//! Per-connection read and write pumps.
//!
//! - Read pump: kernel → framer → field codec → pipeline ingress
//! - Write pump: connection command queue → framer → kernel
//!
//! The write pump is the only writer of its stream, so frames written to one
//! connection keep their submission order. Either pump ending tears the
//! connection down: the reader closes the handle (which stops the writer),
//! and the writer shuts the socket down (which ends the pending read).

use bytes::BytesMut;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::TcpStream;
use compio::runtime::TryClone;
use flume::Receiver;
use isoswitch_core::connection::{ConnCommand, Connection};
use isoswitch_core::message::Message;
use isoswitch_core::monitor::SocketEvent;
use isoswitch_core::pool::ConnectionPool;
use isoswitch_core::tcp::shutdown_both;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::SocketContext;
use crate::wire::Wire;

/// Smallest read buffer the reader will use.
const MIN_READ_BUF: usize = 512;

/// Drive one connection until it closes, then unregister it.
pub(crate) async fn run_connection(
    stream: TcpStream,
    conn: Arc<Connection>,
    cmd_rx: Receiver<ConnCommand>,
    pool: Arc<ConnectionPool>,
    ctx: SocketContext,
) {
    match stream.try_clone() {
        Ok(writer) => {
            compio::runtime::spawn(write_pump(writer, Arc::clone(&conn), cmd_rx, ctx.wire.clone()))
                .detach();
        }
        Err(e) => {
            warn!(connection = %conn.id(), "[Connection] Failed to clone stream: {}", e);
            conn.mark_closed();
            pool.remove_connection(&conn);
            return;
        }
    }

    read_pump(stream, &conn, &ctx).await;

    conn.close();
    pool.remove_connection(&conn);
    ctx.events.emit(SocketEvent::Disconnected {
        socket: conn.socket().clone(),
        connection: conn.id(),
        remote: conn.remote_addr(),
    });
    debug!(
        socket = %conn.socket(),
        connection = %conn.id(),
        remote = %conn.remote_addr(),
        "[Connection] Closed"
    );
}

async fn read_pump(mut stream: TcpStream, conn: &Arc<Connection>, ctx: &SocketContext) {
    let size = ctx.options.read_buffer_size.max(MIN_READ_BUF);
    let mut pending = BytesMut::with_capacity(size);
    let mut recv_buf: Vec<u8> = Vec::with_capacity(size);

    loop {
        recv_buf.clear();
        let BufResult(res, buf) = AsyncRead::read(&mut stream, recv_buf).await;
        recv_buf = buf;
        match res {
            Ok(0) => {
                trace!(connection = %conn.id(), "[Connection] EOF");
                return;
            }
            Ok(n) => pending.extend_from_slice(&recv_buf[..n]),
            Err(e) => {
                debug!(connection = %conn.id(), "[Connection] Read error: {}", e);
                return;
            }
        }

        loop {
            let payload = match ctx.wire.next_frame(&mut pending) {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        connection = %conn.id(),
                        remote = %conn.remote_addr(),
                        "[Connection] Framing error, closing: {}", e
                    );
                    return;
                }
            };

            match ctx.wire.decode_fields(&payload) {
                Ok(fields) => {
                    let msg = Message::new(payload, fields, Arc::clone(conn));
                    ctx.ingress.push(msg).await;
                }
                Err(e) => {
                    warn!(
                        channel = %conn.socket().channel,
                        connection = %conn.id(),
                        size = payload.len(),
                        "[Connection] Undecodable message dropped: {}", e
                    );
                }
            }
        }
    }
}

async fn write_pump(
    mut stream: TcpStream,
    conn: Arc<Connection>,
    cmd_rx: Receiver<ConnCommand>,
    wire: Wire,
) {
    while let Ok(cmd) = cmd_rx.recv_async().await {
        match cmd {
            ConnCommand::Write(payload) => {
                let frame = match wire.frame(&payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(connection = %conn.id(), "[Connection] Outgoing message not framed: {}", e);
                        continue;
                    }
                };
                let BufResult(res, _) = stream.write_all(frame).await;
                if let Err(e) = res {
                    debug!(connection = %conn.id(), "[Connection] Write error: {}", e);
                    break;
                }
            }
            ConnCommand::Close => {
                trace!(connection = %conn.id(), "[Connection] Close requested");
                break;
            }
        }
    }

    conn.mark_closed();
    if let Err(e) = shutdown_both(&stream) {
        trace!(connection = %conn.id(), "[Connection] Shutdown: {}", e);
    }
}
