//! A lock-free, per-file-descriptor readiness core for a multi-threaded
//! reverse proxy.
//!
//! Each registered FD carries a small atomic state word recording whether
//! the application currently wants to read/write it (`ACTIVE`), whether the
//! kernel last reported it ready (`READY`), and whether it is currently
//! registered with a poller backend (`POLLED`). Direction transitions
//! (`want_recv`, `cant_send`, ...) run as CAS retry loops against that word
//! with no lock and no syscall on the hot path; only a transition that
//! actually needs to change the FD's poller registration touches a
//! thread-local update list, and only a transition that actually changes
//! cache membership touches a ready cache.
//!
//! FDs affined to exactly one worker thread live in that thread's
//! lock-free [`PerThreadCache`](cache::PerThreadCache); FDs shared across
//! threads live in a single [`GlobalCache`](cache::GlobalCache) behind an
//! `RwLock`. A thread's [`Dispatcher`](dispatch::Dispatcher) drains its own
//! cache unconditionally every tick and takes a non-blocking pass at the
//! global one, so lock contention never blocks a dispatch loop: it only
//! ever delays processing of shared FDs to a later tick.
//!
//! See `SPEC_FULL.md` for the full per-module contract this crate
//! implements, and `DESIGN.md` for where each piece of it is grounded.

#[macro_use]
mod macros;

pub mod cache;
pub mod dispatch;
pub mod error;
pub mod ev;
pub mod fd_table;
pub mod poller;
pub mod runtime;
pub mod spinlock;
pub mod state;
pub mod token;
mod percpu;
mod updt;
pub mod waker;

pub use crate::dispatch::Dispatcher;
pub use crate::error::{Error, Result};
pub use crate::ev::Ev;
pub use crate::fd_table::{FdTable, Iocb};
pub use crate::runtime::{Config, FdCore};
pub use crate::state::Dir;
pub use crate::token::{Owner, ThreadId, ThreadMask};

/// Compile-time feature flags this build was made with, exposed for
/// diagnostics (e.g. a status page reporting whether structured logging is
/// compiled in).
pub mod features {
    /// Whether the `log` crate integration is compiled in.
    pub const LOG: bool = cfg!(feature = "log");
}
