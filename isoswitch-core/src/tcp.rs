//! TCP socket tuning for gateway connections.
//!
//! compio streams do not expose every socket option, so these helpers borrow
//! the raw descriptor through `socket2` for the duration of one call.
//!
//! # Safety
//!
//! The borrowed `socket2::Socket` is forgotten before returning, so the
//! descriptor stays owned by the compio stream.

#![allow(unsafe_code)]

use std::io;
use std::net::Shutdown;

fn with_socket<S, R>(stream: &S, f: impl FnOnce(&socket2::Socket) -> io::Result<R>) -> io::Result<R>
where
    S: RawSocket,
{
    let sock = stream.borrow_socket();
    let result = f(&sock);
    std::mem::forget(sock); // Don't close the fd
    result
}

/// Streams whose descriptor can be borrowed as a `socket2::Socket`.
pub trait RawSocket {
    #[doc(hidden)]
    fn borrow_socket(&self) -> socket2::Socket;
}

#[cfg(unix)]
impl<T: std::os::unix::io::AsRawFd> RawSocket for T {
    fn borrow_socket(&self) -> socket2::Socket {
        use std::os::unix::io::FromRawFd;
        unsafe { socket2::Socket::from_raw_fd(self.as_raw_fd()) }
    }
}

#[cfg(windows)]
impl<T: std::os::windows::io::AsRawSocket> RawSocket for T {
    fn borrow_socket(&self) -> socket2::Socket {
        use std::os::windows::io::FromRawSocket;
        unsafe { socket2::Socket::from_raw_socket(self.as_raw_socket()) }
    }
}

/// Disable Nagle's algorithm. Request/reply traffic is latency bound.
///
/// # Errors
///
/// Returns an error if the socket option cannot be set.
#[inline]
pub fn enable_tcp_nodelay<S: RawSocket>(stream: &S) -> io::Result<()> {
    with_socket(stream, |sock| sock.set_nodelay(true))
}

/// Shut down both halves of a connection.
///
/// A read pending on the stream completes with EOF, which is how the gateway
/// stops a connection's reader from outside its task.
pub fn shutdown_both<S: RawSocket>(stream: &S) -> io::Result<()> {
    with_socket(stream, |sock| match sock.shutdown(Shutdown::Both) {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    })
}
