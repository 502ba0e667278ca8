//! A `Vec<T>` indexed by [`ThreadId`](crate::token::ThreadId) where every
//! element is only ever touched by its owning thread.
//!
//! `spec.md` §5 states plainly: "No thread may touch another thread's
//! per-thread cache." That is an external convention this crate's own API
//! upholds (every method that reaches into per-thread state takes the
//! caller's `ThreadId` and indexes with it), not something the type system
//! can check on its own, hence the `unsafe impl Sync` below, scoped
//! narrowly to this one invariant.

use crate::token::ThreadId;

pub struct PerThread<T>(Vec<T>);

// SAFETY: every accessor below indexes with the caller-supplied `ThreadId`,
// and the crate's own API (Runtime/Dispatcher) never calls them with a
// `ThreadId` other than the thread currently executing. No two threads ever
// read or write the same element concurrently.
unsafe impl<T> Sync for PerThread<T> {}

impl<T> PerThread<T> {
    pub fn new(num_threads: usize, mut make: impl FnMut(ThreadId) -> T) -> PerThread<T> {
        PerThread((0..num_threads as u32).map(ThreadId).map(make).collect())
    }

    pub fn get(&self, tid: ThreadId) -> &T {
        &self.0[tid.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, &T)> {
        self.0.iter().enumerate().map(|(i, t)| (ThreadId(i as u32), t))
    }
}
