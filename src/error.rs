//! Error handling (§7: "detection via assertions is permitted, recovery is
//! not required" for internal contract violations; this type covers the
//! externally-observable failure modes instead: syscall failures and
//! misuse of the public API).

use std::fmt;
use std::io;

/// Errors surfaced by the public API, including the two contract
/// violations §7 calls out (double insert, operating on an unregistered
/// FD): `FdTable::insert`/`delete`/`remove` check for these unconditionally,
/// in release builds too, since this table is a library surface driven by
/// code outside its control.
#[derive(Debug)]
pub enum Error {
    /// A poller backend syscall (`epoll_ctl`, `kevent`, `poll`, the waker's
    /// `eventfd`/`pipe` setup) failed.
    Io(io::Error),
    /// `insert` was called for an FD the table already holds a live
    /// registration for.
    AlreadyRegistered,
    /// A direction-transition or `delete`/`remove` call named an FD with no
    /// live registration.
    NotRegistered,
    /// No poller backend is usable on this platform (every candidate in the
    /// fallback order failed `init`).
    NoBackend,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "fdcore: i/o error: {e}"),
            Error::AlreadyRegistered => write!(f, "fdcore: fd is already registered"),
            Error::NotRegistered => write!(f, "fdcore: fd is not registered"),
            Error::NoBackend => write!(f, "fdcore: no poller backend available on this platform"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
