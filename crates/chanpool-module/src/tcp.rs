//! TCP sockets on `mio::net`, with options applied through `socket2`.
//!
//! Listeners are built with `socket2` so the backlog and `SO_REUSEADDR`
//! can be set before `listen(2)`, then handed to `mio`. Every socket this
//! module returns is non-blocking.

use std::io::{self, IoSlice, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

use chanpool_core::{Listener, Shutdown, Socket, SocketFactory, SocketOptions};
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, SockRef, Type};
use tracing::trace;

/// A connected TCP stream.
#[derive(Debug)]
pub struct TcpSocket {
    stream: TcpStream,
}

impl TcpSocket {
    /// Adopt a std stream, switching it to non-blocking mode.
    pub fn from_std(stream: std::net::TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: TcpStream::from_std(stream),
        })
    }

    pub fn from_mio(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Apply `TCP_NODELAY` and `SO_KEEPALIVE`.
    pub fn apply_options(&self, options: &SocketOptions) -> io::Result<()> {
        self.stream.set_nodelay(options.no_delay)?;
        SockRef::from(&self.stream).set_keepalive(options.keep_alive)
    }
}

impl Socket for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.write_vectored(bufs)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        match self.stream.shutdown(how.into()) {
            // Already torn down by the peer.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        self.stream.take_error()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// A listening TCP socket.
#[derive(Debug)]
pub struct TcpListenerSocket {
    listener: TcpListener,
    options: SocketOptions,
}

impl TcpListenerSocket {
    /// Bind `addr` and listen with `backlog`.
    pub fn bind(addr: SocketAddr, backlog: u32, options: &SocketOptions) -> io::Result<Self> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(options.reuse_address)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog.min(i32::MAX as u32) as i32)?;

        let std_listener: std::net::TcpListener = socket.into();
        Ok(Self {
            listener: TcpListener::from_std(std_listener),
            options: *options,
        })
    }
}

impl Listener for TcpListenerSocket {
    fn accept(&mut self) -> io::Result<(Box<dyn Socket>, SocketAddr)> {
        let (stream, peer) = self.listener.accept()?;
        let socket = TcpSocket::from_mio(stream);
        socket.apply_options(&self.options)?;
        trace!(%peer, fd = socket.raw_fd(), "accepted");
        Ok((Box::new(socket), peer))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

/// Default `SocketFactory`: plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpSocketFactory;

impl TcpSocketFactory {
    pub fn new() -> Self {
        Self
    }
}

impl SocketFactory for TcpSocketFactory {
    fn connect(&self, addr: SocketAddr, options: &SocketOptions) -> io::Result<Box<dyn Socket>> {
        let socket = TcpSocket::from_mio(TcpStream::connect(addr)?);
        socket.apply_options(options)?;
        Ok(Box::new(socket))
    }

    fn listen(
        &self,
        addr: SocketAddr,
        backlog: u32,
        options: &SocketOptions,
    ) -> io::Result<Box<dyn Listener>> {
        Ok(Box::new(TcpListenerSocket::bind(addr, backlog, options)?))
    }
}
