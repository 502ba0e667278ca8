//! The portable `poll(2)` fallback, used on any platform without an epoll
//! or kqueue backend and available everywhere else as an explicit
//! `FDCORE_FORCE_POLL_BACKEND` override for testing.
//!
//! `poll(2)` has no persistent kernel-side registration to reconcile
//! against: every call re-describes the full interest set. `reconcile`
//! therefore just drains the update list (to keep `update_mask`/
//! `polled_mask` bookkeeping consistent with the other backends) and
//! otherwise leaves the real work to `wait`, which rebuilds the `pollfd`
//! array from the table's active FDs each time.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::ev::Ev;
use crate::fd_table::FdTable;
use crate::state::{ACTIVE_R, ACTIVE_W};
use crate::token::ThreadId;

use super::Backend;

pub struct Poll {
    /// FDs this thread currently considers active, along with the interest
    /// bits to poll for, rebuilt into a `pollfd` array on every `wait`. A
    /// plain `Vec` rather than a set: table sizes in scope for `poll(2)` are
    /// small by construction (it is only selected when epoll/kqueue are
    /// unavailable).
    tracked: Vec<(i32, i16)>,
    waker_fd: Option<RawFd>,
}

impl Poll {
    pub fn init() -> io::Result<Poll> {
        Ok(Poll {
            tracked: Vec::new(),
            waker_fd: None,
        })
    }
}

impl Backend for Poll {
    fn reconcile(&mut self, table: &FdTable, tid: ThreadId) -> io::Result<()> {
        let pending = table.update_list(tid).borrow_mut().drain();
        for fd in pending {
            let state = table.state_bits(fd);
            let mut bits = 0i16;
            if state & ACTIVE_R != 0 {
                bits |= libc::POLLIN;
            }
            if state & ACTIVE_W != 0 {
                bits |= libc::POLLOUT;
            }
            match self.tracked.iter().position(|&(f, _)| f == fd) {
                Some(idx) if bits == 0 => {
                    self.tracked.swap_remove(idx);
                    table.clear_polled(fd, tid.bit());
                }
                Some(idx) => {
                    self.tracked[idx].1 = bits;
                    table.set_polled(fd, tid.bit());
                }
                None if bits != 0 => {
                    self.tracked.push((fd, bits));
                    table.set_polled(fd, tid.bit());
                }
                None => {}
            }
            table.clear_pending_update(fd, tid);
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<(i32, Ev)>) -> io::Result<()> {
        let mut fds: Vec<libc::pollfd> = self
            .tracked
            .iter()
            .map(|&(fd, bits)| libc::pollfd {
                fd,
                events: bits,
                revents: 0,
            })
            .chain(self.waker_fd.iter().map(|&fd| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            }))
            .collect();
        if fds.is_empty() && timeout.is_none() {
            // Nothing tracked and asked to block forever: nothing will
            // ever wake us. The dispatch loop never actually reaches this
            // (the waker is always registered once a runtime is running),
            // but guard against spinning if it ever does.
            return Ok(());
        }
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };
        let n = loop {
            let res = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
            if res == -1 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }
            break res;
        };
        if n == 0 {
            return Ok(());
        }
        for pfd in &fds {
            if pfd.revents == 0 {
                continue;
            }
            let mut ev = Ev::empty();
            if pfd.revents & libc::POLLIN != 0 {
                ev |= Ev::IN;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                ev |= Ev::OUT;
            }
            if pfd.revents & libc::POLLHUP != 0 {
                ev |= Ev::HUP;
            }
            if pfd.revents & libc::POLLERR != 0 {
                ev |= Ev::ERR;
            }
            if pfd.revents & libc::POLLPRI != 0 {
                ev |= Ev::PRI;
            }
            out.push((pfd.fd, ev));
        }
        Ok(())
    }

    fn fork_recover(&mut self, table: &FdTable, tid: ThreadId) -> io::Result<()> {
        // poll(2) holds no kernel-side registration to rebuild; just
        // re-derive `tracked` from the table's current active set.
        self.tracked.clear();
        table.requeue_all_active();
        cfg_trace!("fdcore: poll backend reset after fork on thread {:?}", tid);
        Ok(())
    }

    fn register_waker(&mut self, waker_fd: RawFd) -> io::Result<()> {
        self.waker_fd = Some(waker_fd);
        Ok(())
    }
}
