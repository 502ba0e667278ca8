//! The configuration surface and a small convenience runtime tying the
//! table, caches, update lists and N dispatcher threads together.
//!
//! `spec.md` itself describes only the FD core's internals; everything in
//! this module is the ambient "how does a caller actually stand one of
//! these up" layer, which every production consumer needs regardless.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::fd_table::FdTable;
use crate::poller;
use crate::token::{ThreadId, MAX_THREADS};
use crate::waker::Waker;

/// Startup configuration for an [`FdCore`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of dispatcher threads. Must fit in a [`ThreadMask`]
    /// (`crate::token::MAX_THREADS` bits).
    pub num_threads: usize,
    /// FD table capacity. `None` resolves to the process's current
    /// `RLIMIT_NOFILE` soft limit via `getrlimit(2)`, mirroring how a
    /// reverse proxy sizes this table from its own ulimit at startup.
    pub max_fds: Option<usize>,
}

impl Config {
    pub fn new(num_threads: usize) -> Config {
        Config {
            num_threads,
            max_fds: None,
        }
    }

    fn resolve_max_fds(&self) -> io::Result<usize> {
        match self.max_fds {
            Some(n) => Ok(n),
            None => {
                let mut limit = libc::rlimit {
                    rlim_cur: 0,
                    rlim_max: 0,
                };
                syscall!(getrlimit(libc::RLIMIT_NOFILE, &mut limit))?;
                Ok(limit.rlim_cur as usize)
            }
        }
    }
}

/// Owns the FD table plus one poller backend and wakeup handle per thread.
/// Short for "FD core", the thing `spec.md` as a whole describes.
pub struct FdCore {
    table: Arc<FdTable>,
    waker: Arc<Waker>,
    dispatchers: Vec<Dispatcher>,
    shutdown: Arc<AtomicBool>,
}

impl FdCore {
    pub fn new(config: Config) -> Result<FdCore> {
        if config.num_threads == 0 || config.num_threads > MAX_THREADS {
            return Err(Error::NoBackend);
        }
        let capacity = config.resolve_max_fds()?;
        let table = Arc::new(FdTable::new(capacity, config.num_threads));
        let waker = Arc::new(Waker::new()?);

        let mut dispatchers = Vec::with_capacity(config.num_threads);
        for i in 0..config.num_threads {
            let backend = poller::select()?;
            let dispatcher = Dispatcher::new(ThreadId(i as u32), backend, Arc::clone(&waker))?;
            dispatchers.push(dispatcher);
        }

        Ok(FdCore {
            table,
            waker,
            dispatchers,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn table(&self) -> &Arc<FdTable> {
        &self.table
    }

    /// Wake every dispatcher thread out of a blocking `wait`. Used after
    /// an out-of-band state change (e.g. a signal handler enqueuing work)
    /// that a dispatcher's own poller has no way to observe directly.
    pub fn wake_all(&self) -> io::Result<()> {
        self.waker.wake()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Best-effort: a blocked dispatcher needs a nudge to notice.
        let _ = self.waker.wake();
    }

    /// Spawn one OS thread per configured dispatcher, each running `body`
    /// in a loop until [`FdCore::request_shutdown`] is called. `body` is
    /// handed the thread's own [`Dispatcher`] and the shared table each
    /// tick, and decides the per-tick `timer_due` flag (§4.5 item 1), since
    /// this crate has no timer wheel of its own.
    ///
    /// Fork recovery (§8 scenario 6) happens per-thread, inside `body`: a
    /// thread that notices it is now the child of a `fork(2)` (typically
    /// by comparing `libc::getpid()` against a value cached at thread
    /// start) should call [`Dispatcher::recover_after_fork`] before its
    /// next `tick`, and call [`FdTable::force_clear_all_polled`] exactly
    /// once process-wide before any thread does so. There is no single
    /// "the runtime" moment to hook this into, since `fork` only ever
    /// leaves one of these threads alive in the child.
    pub fn run<F>(mut self, body: F) -> Vec<thread::JoinHandle<()>>
    where
        F: Fn(&mut Dispatcher, &FdTable) -> bool + Send + Sync + Clone + 'static,
    {
        let mut handles = Vec::with_capacity(self.dispatchers.len());
        while let Some(mut dispatcher) = self.dispatchers.pop() {
            let table = Arc::clone(&self.table);
            let shutdown = Arc::clone(&self.shutdown);
            let body = body.clone();
            handles.push(thread::spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    let timer_due = body(&mut dispatcher, &table);
                    if let Err(e) = dispatcher.tick(&table, timer_due) {
                        cfg_warn!(
                            "fdcore: dispatcher {:?} tick failed: {e}",
                            dispatcher.thread_id()
                        );
                    }
                }
            }));
        }
        handles
    }
}
