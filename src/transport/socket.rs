//! Non-blocking stream socket seam.
//!
//! A [`Connection`](super::connection::Connection) only ever talks to its
//! socket through this trait, so tests can substitute an in-memory socket.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::Interest;
use tokio::net::TcpStream;

use super::Readiness;

pub trait Socket: Send + Sync {
    /// Read without blocking; `WouldBlock` when nothing is available.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write without blocking; `WouldBlock` when the send buffer is full.
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()>;

    /// Make the next close send a reset instead of a FIN.
    fn set_linger_zero(&self) -> io::Result<()>;

    /// Future resolving once the socket may be read and/or written.
    fn readiness(self: Arc<Self>, read: bool, write: bool) -> Readiness;
}

impl Socket for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }

    #[allow(deprecated)]
    fn set_linger_zero(&self) -> io::Result<()> {
        TcpStream::set_linger(self, Some(Duration::ZERO))
    }

    fn readiness(self: Arc<Self>, read: bool, write: bool) -> Readiness {
        let interest = match (read, write) {
            (true, true) => Interest::READABLE.add(Interest::WRITABLE),
            (false, true) => Interest::WRITABLE,
            _ => Interest::READABLE,
        };
        Box::pin(async move {
            let _ = self.ready(interest).await;
        })
    }
}

/// Errors that mean the process is out of sockets or buffers, not that the
/// peer failed: EMFILE, ENFILE, ENOBUFS, ENOMEM.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

/// Accept failures caused by the peer giving up before we got to it.
pub fn is_connection_failure(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_exhaustion_is_transient() {
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::ENOBUFS)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::ECONNREFUSED)));
        assert!(!is_transient(&io::Error::new(io::ErrorKind::Other, "x")));
    }
}
