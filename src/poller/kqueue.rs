//! The BSD/macOS kqueue backend.
//!
//! Grounded on mio's `sys/unix/selector/kqueue.rs`: same `kevent(2)`
//! shape, but, as with the epoll backend, interests are plain
//! level-triggered read/write filters, not mio's one-shot/edge style,
//! since `spec.md`'s state machine expects the kernel to keep reporting
//! readiness until a `cant_*` call says otherwise.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::ev::Ev;
use crate::fd_table::FdTable;
use crate::state::{ACTIVE_R, ACTIVE_W};
use crate::token::ThreadId;

use super::Backend;

pub struct Kqueue {
    kq: RawFd,
    events: Vec<libc::kevent>,
}

impl Kqueue {
    pub fn init() -> io::Result<Kqueue> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Kqueue {
            kq,
            events: vec![unsafe { mem::zeroed() }; 1024],
        })
    }

    fn change(&self, fd: i32, filter: i16, flags: u16) -> io::Result<()> {
        let change = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags: flags as _,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        let res = unsafe {
            libc::kevent(
                self.kq,
                &change,
                1,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        if res == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}

impl Backend for Kqueue {
    fn reconcile(&mut self, table: &FdTable, tid: ThreadId) -> io::Result<()> {
        let pending = table.update_list(tid).borrow_mut().drain();
        for fd in pending {
            let state = table.state_bits(fd);
            let want_r = state & ACTIVE_R != 0;
            let want_w = state & ACTIVE_W != 0;

            let r_flags = if want_r {
                libc::EV_ADD
            } else {
                libc::EV_DELETE
            };
            if let Err(e) = self.change(fd, libc::EVFILT_READ, r_flags) {
                // ENOENT deleting a filter that was never added is fine.
                if !(r_flags == libc::EV_DELETE && e.raw_os_error() == Some(libc::ENOENT)) {
                    return Err(e);
                }
            }

            let w_flags = if want_w {
                libc::EV_ADD
            } else {
                libc::EV_DELETE
            };
            if let Err(e) = self.change(fd, libc::EVFILT_WRITE, w_flags) {
                if !(w_flags == libc::EV_DELETE && e.raw_os_error() == Some(libc::ENOENT)) {
                    return Err(e);
                }
            }

            if want_r || want_w {
                table.set_polled(fd, tid.bit());
            } else {
                table.clear_polled(fd, tid.bit());
            }
            table.clear_pending_update(fd, tid);
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<(i32, Ev)>) -> io::Result<()> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts
            .as_ref()
            .map_or(std::ptr::null(), |t| t as *const libc::timespec);
        let n = loop {
            let res = unsafe {
                libc::kevent(
                    self.kq,
                    std::ptr::null(),
                    0,
                    self.events.as_mut_ptr(),
                    self.events.len() as i32,
                    ts_ptr,
                )
            };
            if res == -1 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }
            break res;
        };
        for raw in &self.events[..n as usize] {
            let fd = raw.ident as i32;
            let mut ev = Ev::empty();
            if raw.filter == libc::EVFILT_READ {
                ev |= Ev::IN;
            }
            if raw.filter == libc::EVFILT_WRITE {
                ev |= Ev::OUT;
            }
            if raw.flags & libc::EV_EOF != 0 {
                ev |= Ev::HUP;
            }
            if raw.flags & libc::EV_ERROR != 0 {
                ev |= Ev::ERR;
            }
            out.push((fd, ev));
        }
        Ok(())
    }

    fn fork_recover(&mut self, table: &FdTable, tid: ThreadId) -> io::Result<()> {
        unsafe {
            libc::close(self.kq);
        }
        self.kq = syscall!(kqueue())?;
        syscall!(fcntl(self.kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        table.requeue_all_active();
        cfg_trace!("fdcore: kqueue backend recreated after fork on thread {:?}", tid);
        Ok(())
    }

    fn register_waker(&mut self, waker_fd: RawFd) -> io::Result<()> {
        self.change(waker_fd, libc::EVFILT_READ, libc::EV_ADD)
    }
}
