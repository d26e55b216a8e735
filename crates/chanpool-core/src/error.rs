//! Capability error types.

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The event manager no longer accepts work.
    #[error("event manager stopped")]
    Stopped,
    /// Registration with the readiness demultiplexer failed.
    #[error("register fd {fd}: {source}")]
    Register {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
    /// Waiting for readiness failed.
    #[error("poll: {0}")]
    Poll(#[source] io::Error),
    /// OS error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// `true` for errors that only mean "try again later".
#[inline]
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// `true` when the peer tore the connection down rather than the local
/// host failing.
pub fn is_peer_reset(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(code) => matches!(code, libc::ECONNRESET | libc::EPIPE | libc::ECONNABORTED),
        None => matches!(
            err.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionAborted
        ),
    }
}

/// `true` when accept failed for lack of descriptors or memory, which
/// calls for backing off rather than retrying immediately.
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", CoreError::Stopped), "event manager stopped");
        let e = CoreError::Register {
            fd: 7,
            source: io::Error::from_raw_os_error(libc::EBADF),
        };
        assert!(format!("{}", e).starts_with("register fd 7:"));
    }

    #[test]
    fn test_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_peer_reset(&io::Error::from_raw_os_error(libc::ECONNRESET)));
        assert!(is_peer_reset(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_peer_reset(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(is_resource_exhaustion(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!is_resource_exhaustion(&io::Error::from_raw_os_error(libc::EAGAIN)));
    }
}
