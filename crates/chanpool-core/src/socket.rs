//! Byte-stream socket abstraction.
//!
//! A `Socket` is always non-blocking: `read`/`write` return
//! `io::ErrorKind::WouldBlock` instead of parking the caller. `read`
//! returning `Ok(0)` means the peer closed its sending half.
//!
//! # Implementors
//!
//! - `TcpSocket` (chanpool-module): wraps `mio::net::TcpStream`.
//! - Test doubles in `chanpool` script reads and writes without a kernel
//!   socket.

use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::os::fd::RawFd;

/// Which half of a connection to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Read,
    Write,
    Both,
}

impl From<Shutdown> for std::net::Shutdown {
    fn from(how: Shutdown) -> Self {
        match how {
            Shutdown::Read => std::net::Shutdown::Read,
            Shutdown::Write => std::net::Shutdown::Write,
            Shutdown::Both => std::net::Shutdown::Both,
        }
    }
}

/// A connected, non-blocking stream socket.
///
/// **Contract:**
/// - Only the owning event manager thread calls `read`/`write`.
/// - `raw_fd()` stays valid until the socket is dropped; the event manager
///   uses it as the registration key.
/// - Dropping the socket closes it.
pub trait Socket: Send {
    /// Read into `buf`. `Ok(0)` is end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning how many bytes the kernel accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Gathering write. The default writes the first non-empty slice.
    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match bufs.iter().find(|b| !b.is_empty()) {
            Some(buf) => self.write(buf),
            None => Ok(0),
        }
    }

    /// Shut down one or both halves.
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;

    /// Pending socket error (`SO_ERROR`), used to resolve a non-blocking
    /// connect.
    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        Ok(None)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Descriptor used as the readiness registration key.
    fn raw_fd(&self) -> RawFd;
}

impl<S: Socket + ?Sized> Socket for Box<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).write(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        (**self).write_vectored(bufs)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        (**self).shutdown(how)
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        (**self).take_error()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        (**self).peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }

    fn raw_fd(&self) -> RawFd {
        (**self).raw_fd()
    }
}


/// Options applied to sockets the factory creates or accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// `SO_KEEPALIVE`
    pub keep_alive: bool,
    /// `TCP_NODELAY`
    pub no_delay: bool,
    /// `SO_REUSEADDR` (listeners only)
    pub reuse_address: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            keep_alive: false,
            no_delay: true,
            reuse_address: true,
        }
    }
}

/// A non-blocking listening socket.
pub trait Listener: Send {
    /// Accept one pending connection, or `WouldBlock` when none is queued.
    fn accept(&mut self) -> io::Result<(Box<dyn Socket>, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn raw_fd(&self) -> RawFd;
}

/// Creates sockets. Name resolution and option plumbing live behind this
/// trait so the pool only ever sees connected or listening sockets.
pub trait SocketFactory: Send + Sync {
    /// Start a non-blocking connect. The returned socket becomes writable
    /// once the handshake resolves; `take_error` reports the outcome.
    fn connect(&self, addr: SocketAddr, options: &SocketOptions) -> io::Result<Box<dyn Socket>>;

    /// Bind and listen with the given backlog.
    fn listen(
        &self,
        addr: SocketAddr,
        backlog: u32,
        options: &SocketOptions,
    ) -> io::Result<Box<dyn Listener>>;
}
