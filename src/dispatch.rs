//! The per-thread dispatch loop (§4.5): the five-step tick a worker thread
//! runs to reconcile pending registration changes, wait for readiness, and
//! invoke callbacks for whatever is cached as ready.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use crate::ev::Ev;
use crate::fd_table::FdTable;
use crate::poller::Backend;
use crate::token::ThreadId;
use crate::waker::Waker;

/// One worker thread's private view onto the shared [`FdTable`]: its
/// poller backend instance and its wakeup handle.
pub struct Dispatcher {
    tid: ThreadId,
    backend: Box<dyn Backend>,
    waker: Arc<Waker>,
    waker_fd: RawFd,
    events: Vec<(i32, Ev)>,
}

impl Dispatcher {
    pub fn new(tid: ThreadId, mut backend: Box<dyn Backend>, waker: Arc<Waker>) -> io::Result<Dispatcher> {
        let waker_fd = waker.raw_fd();
        backend.register_waker(waker_fd)?;
        Ok(Dispatcher {
            tid,
            backend,
            waker,
            waker_fd,
            events: Vec::with_capacity(256),
        })
    }

    pub fn thread_id(&self) -> ThreadId {
        self.tid
    }

    /// Run one iteration of the dispatch loop against `table`. `timer_due`
    /// mirrors the spec's "expired timers, if any" step. This crate has no
    /// timer wheel of its own (out of scope, §1 Non-goals), so callers that
    /// layer one on top pass whatever their own timer subsystem computed.
    pub fn tick(&mut self, table: &FdTable, timer_due: bool) -> io::Result<()> {
        // 1. Reconcile this thread's pending registration changes.
        self.backend.reconcile(table, self.tid)?;

        // 2/3. Decide how long to wait: never block if there is already
        // cached work (this thread's own cache, or a share of the global
        // one) or an expired timer, since processing that work must not
        // wait on a fresh kernel readiness report.
        let own_share = self.tid.bit();
        let cached_work = table.cache_mask.contains(own_share) || !table.global_cache().is_empty();
        let timeout = if cached_work || timer_due {
            Some(Duration::ZERO)
        } else {
            None
        };

        self.events.clear();
        self.backend.wait(timeout, &mut self.events)?;

        for (fd, ev) in self.events.drain(..) {
            if fd == self.waker_fd {
                self.waker.ack_and_reset()?;
                continue;
            }
            table.update_events(fd, self.tid, ev);
        }

        // 4. Drain this thread's own cache first; it needs no locking.
        self.process_cache(table, table.per_thread_cache(self.tid).drain_snapshot());

        // 5. Take a non-blocking pass at the global cache, but only service
        // entries whose thread_mask actually includes this thread (§4.5
        // item 4: "process entries whose thread_mask includes this
        // thread"). A shared FD's thread_mask need not span every worker,
        // so anything this thread isn't authorised for is spliced back in
        // for whichever thread is to pick up on a later tick. Skipping the
        // whole drain under contention is correct: whichever thread does
        // win the try_write drains the fds visible at that instant, and
        // anything admitted afterward waits for a later tick on any thread.
        if let Some(fds) = table.global_cache().try_drain_snapshot() {
            let (mine, theirs): (Vec<i32>, Vec<i32>) = fds
                .into_iter()
                .partition(|&fd| table.thread_mask_of(fd).contains(self.tid));
            for fd in theirs {
                table.global_cache().admit(fd as usize);
            }
            self.process_cache(table, mine);
        }

        Ok(())
    }

    fn process_cache(&self, table: &FdTable, fds: Vec<i32>) {
        for fd in fds {
            // The state word may have been zeroed by a concurrent `delete`
            // between admission and this tick; skip invoking a callback
            // for a torn-down fd (§8 scenario 5).
            if table.state_bits(fd) == 0 {
                continue;
            }
            if let Some(iocb) = table.iocb(fd) {
                iocb(fd);
            }
        }
    }

    /// Re-create this thread's backend after observing this process is the
    /// child side of a `fork(2)` (§8 scenario 6; see `SPEC_FULL.md`'s
    /// concrete fork-recovery discipline).
    pub fn recover_after_fork(&mut self, table: &FdTable) -> io::Result<()> {
        self.backend.fork_recover(table, self.tid)?;
        self.backend.register_waker(self.waker_fd)?;
        Ok(())
    }
}
