//! Cross-thread wakeup (§5: "a sleeping thread... must be woken if an FD
//! becomes eligible that it, specifically, must service").
//!
//! Two implementations, selected at compile time exactly like mio's own
//! `sys::unix::waker` module: an `eventfd`-backed one on Linux/Android,
//! and a self-pipe fallback everywhere else `poll`/`kqueue` is used. Both
//! register their read end with the thread's poller backend so a wake is
//! just another readiness event arriving through the normal `wait` path.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use eventfd::Waker;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub use pipe::Waker;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod eventfd {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

    /// A cross-thread wakeup signal backed by Linux's `eventfd(2)`.
    pub struct Waker {
        fd: File,
    }

    impl Waker {
        pub fn new() -> io::Result<Waker> {
            let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
            Ok(Waker {
                fd: unsafe { File::from_raw_fd(fd) },
            })
        }

        pub fn raw_fd(&self) -> RawFd {
            self.fd.as_raw_fd()
        }

        /// Arm the wakeup. Idempotent: writing `1` repeatedly before the
        /// reader drains just accumulates in the kernel's 8-byte counter,
        /// still reported as a single readiness event.
        pub fn wake(&self) -> io::Result<()> {
            match (&self.fd).write(&1u64.to_ne_bytes()) {
                Ok(_) => Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Counter is already saturated; a pending wake is
                    // already visible to the reader, nothing further to do.
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }

        /// Drain the counter after observing readiness on `raw_fd`.
        pub fn ack_and_reset(&self) -> io::Result<()> {
            let mut buf = [0u8; 8];
            match (&self.fd).read(&mut buf) {
                Ok(_) => Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
                Err(e) => Err(e),
            }
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod pipe {
    use std::fs::File;
    use std::io::{self, Read, Write};
    use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

    /// A cross-thread wakeup signal backed by a self-pipe, for platforms
    /// without `eventfd` (BSD/macOS kqueue backends, and the portable
    /// `poll` fallback).
    pub struct Waker {
        sender: File,
        receiver: File,
    }

    impl Waker {
        pub fn new() -> io::Result<Waker> {
            let mut fds = [-1; 2];
            syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK))?;
            Ok(Waker {
                receiver: unsafe { File::from_raw_fd(fds[0]) },
                sender: unsafe { File::from_raw_fd(fds[1]) },
            })
        }

        pub fn raw_fd(&self) -> RawFd {
            self.receiver.as_raw_fd()
        }

        pub fn wake(&self) -> io::Result<()> {
            match (&self.sender).write(&[1]) {
                Ok(_) => Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
                // A full pipe buffer also means a wake is already pending.
                Err(ref e) if e.kind() == io::ErrorKind::WriteZero => Ok(()),
                Err(e) => Err(e),
            }
        }

        pub fn ack_and_reset(&self) -> io::Result<()> {
            let mut buf = [0u8; 128];
            loop {
                match (&self.receiver).read(&mut buf) {
                    Ok(0) => return Ok(()),
                    Ok(n) if n < buf.len() => return Ok(()),
                    Ok(_) => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
    }
}
