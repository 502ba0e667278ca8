//! The poller backend contract (§6): a narrow surface any kernel readiness
//! API can implement, plus the fixed fallback order used to pick one at
//! startup.
//!
//! Every method here is called from exactly one thread (the dispatcher that
//! owns this backend instance) except `fork_recover`, which every thread
//! calls on its own instance after a `fork(2)` that landed them in the
//! child (§8 scenario 6).

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::ev::Ev;
use crate::fd_table::FdTable;
use crate::token::ThreadId;

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;
pub mod poll;

/// A kernel readiness notification API, narrowed to what the dispatch loop
/// needs (§6): register/deregister driven entirely by draining a thread's
/// update list, a blocking or non-blocking wait, and fork recovery.
pub trait Backend: Send {
    /// Reconcile this thread's update list against the kernel: for each
    /// pending FD, register, modify, or deregister its interest set
    /// depending on its current `ACTIVE_*` bits, then clear the
    /// corresponding `update_mask` bit and `polled_mask` bookkeeping.
    fn reconcile(&mut self, table: &FdTable, tid: ThreadId) -> io::Result<()>;

    /// Block for up to `timeout` (`None` = forever, `Some(Duration::ZERO)`
    /// = return immediately) and append every FD that became ready to
    /// `out`, alongside the raw event bits the kernel reported.
    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<(i32, Ev)>) -> io::Result<()>;

    /// Re-create any kernel-side state that does not survive `fork(2)`
    /// (epoll/kqueue descriptors are not inherited usefully into the
    /// child) and mark every currently active FD for re-registration.
    fn fork_recover(&mut self, table: &FdTable, tid: ThreadId) -> io::Result<()>;

    /// Ensure `waker_fd` is registered for read-readiness, so a cross-thread
    /// wakeup surfaces through the normal `wait` path.
    fn register_waker(&mut self, waker_fd: RawFd) -> io::Result<()>;
}

/// Construct the best backend available on this platform, honoring the
/// fixed fallback order from `SPEC_FULL.md`'s poller-selection section:
/// epoll before poll on Linux/Android, kqueue before poll on the BSDs,
/// poll alone elsewhere. `FDCORE_FORCE_POLL_BACKEND` forces the portable
/// fallback regardless of platform, for backend-parity testing.
pub fn select() -> io::Result<Box<dyn Backend>> {
    if std::env::var_os("FDCORE_FORCE_POLL_BACKEND").is_some() {
        cfg_debug!("fdcore: poller backend forced to poll(2) via env override");
        return Ok(Box::new(poll::Poll::init()?));
    }

    #[cfg(target_os = "linux")]
    {
        match epoll::Epoll::init() {
            Ok(b) => {
                cfg_debug!("fdcore: poller backend: epoll");
                return Ok(Box::new(b));
            }
            Err(e) => cfg_warn!("fdcore: epoll init failed ({e}), falling back to poll(2)"),
        }
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    {
        match kqueue::Kqueue::init() {
            Ok(b) => {
                cfg_debug!("fdcore: poller backend: kqueue");
                return Ok(Box::new(b));
            }
            Err(e) => cfg_warn!("fdcore: kqueue init failed ({e}), falling back to poll(2)"),
        }
    }

    cfg_debug!("fdcore: poller backend: poll");
    Ok(Box::new(poll::Poll::init()?))
}
