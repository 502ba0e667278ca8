//! The ready cache: a two-tier, intrusive doubly-linked list of FDs believed
//! ready (§3, §4.2), plus `fd_cache_mask` (§5) for cross-thread wakeups.
//!
//! Both tiers share the same list representation. Links are stored in a flat
//! array co-located with (conceptually) the FD table rather than allocated
//! per node, which is the "intrusive" part: admission and eviction are O(1)
//! pointer splices, no allocation. A slot that isn't currently linked has its
//! `prev` field pointing at itself; that self-loop is the "invalid neighbour
//! pointer" sentinel the spec's §9 design notes call for, and it is what
//! makes `remove` idempotent.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

const NIL: i32 = -1;

#[derive(Clone, Copy)]
struct Link {
    prev: i32,
    next: i32,
}

struct LinkedList {
    head: i32,
    tail: i32,
    links: Vec<Link>,
    len: usize,
}

impl LinkedList {
    fn with_capacity(capacity: usize) -> LinkedList {
        let links = (0..capacity as i32)
            .map(|i| Link { prev: i, next: i }) // self-loop: not linked
            .collect();
        LinkedList {
            head: NIL,
            tail: NIL,
            links,
            len: 0,
        }
    }

    #[inline]
    fn is_linked(&self, fd: usize) -> bool {
        self.links[fd].prev != fd as i32
    }

    /// Append `fd`. No-op (returns `false`) if already present: admission
    /// is idempotent, matching `update_cache`'s re-evaluation being safe to
    /// call repeatedly.
    fn push_back(&mut self, fd: usize) -> bool {
        if self.is_linked(fd) {
            return false;
        }
        let prev = self.tail;
        self.links[fd] = Link { prev, next: NIL };
        if prev == NIL {
            self.head = fd as i32;
        } else {
            self.links[prev as usize].next = fd as i32;
        }
        self.tail = fd as i32;
        self.len += 1;
        true
    }

    /// Remove `fd`. No-op (returns `false`) if not present.
    fn remove(&mut self, fd: usize) -> bool {
        if !self.is_linked(fd) {
            return false;
        }
        let Link { prev, next } = self.links[fd];
        if prev == NIL {
            self.head = next;
        } else {
            self.links[prev as usize].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.links[next as usize].prev = prev;
        }
        self.links[fd] = Link {
            prev: fd as i32,
            next: fd as i32,
        };
        self.len -= 1;
        true
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pop every entry currently in the list into a `Vec`, leaving the list
    /// empty. Used by the dispatch loop to get single-pass-per-tick
    /// semantics (§4.5): an FD re-admitted by a callback while we're
    /// processing this snapshot lands in the (now separate) live list and is
    /// only visited on the *next* tick.
    fn drain_snapshot(&mut self) -> Vec<i32> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while cur != NIL {
            let next = self.links[cur as usize].next;
            self.links[cur as usize] = Link {
                prev: cur,
                next: cur,
            };
            out.push(cur);
            cur = next;
        }
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
        out
    }
}

/// The global cache, for FDs whose `thread_mask` spans more than one thread.
/// Readers (dispatch threads scanning) and writers (admission/eviction) both
/// go through the `RwLock`; `spec.md` §5 calls this out explicitly.
pub struct GlobalCache {
    list: RwLock<LinkedList>,
}

impl GlobalCache {
    pub fn with_capacity(capacity: usize) -> GlobalCache {
        GlobalCache {
            list: RwLock::new(LinkedList::with_capacity(capacity)),
        }
    }

    pub fn admit(&self, fd: usize) -> bool {
        self.list.write().unwrap().push_back(fd)
    }

    pub fn evict(&self, fd: usize) -> bool {
        self.list.write().unwrap().remove(fd)
    }

    pub fn is_empty(&self) -> bool {
        self.list.read().unwrap().is_empty()
    }

    /// Non-blocking scan: used by the dispatch loop's "try-lock the global
    /// cache" step (§4.5 item 4). Returns `None` if the lock is contended.
    pub fn try_drain_snapshot(&self) -> Option<Vec<i32>> {
        self.list
            .try_write()
            .ok()
            .map(|mut g| g.drain_snapshot())
    }
}

/// A single thread's ready cache: no locking, since §5 forbids any other
/// thread from touching it.
pub struct PerThreadCache {
    list: RefCell<LinkedList>,
}

impl PerThreadCache {
    pub fn with_capacity(capacity: usize) -> PerThreadCache {
        PerThreadCache {
            list: RefCell::new(LinkedList::with_capacity(capacity)),
        }
    }

    pub fn admit(&self, fd: usize) -> bool {
        self.list.borrow_mut().push_back(fd)
    }

    pub fn evict(&self, fd: usize) -> bool {
        self.list.borrow_mut().remove(fd)
    }

    pub fn is_empty(&self) -> bool {
        self.list.borrow().is_empty()
    }

    pub fn drain_snapshot(&self) -> Vec<i32> {
        self.list.borrow_mut().drain_snapshot()
    }
}

/// Bitmask of threads whose per-thread cache is non-empty, or (bit reserved
/// for the global cache's servicing threads) whose share of the global
/// cache ought to be serviced. Consulted by the dispatch loop to decide
/// whether to poll with a zero timeout instead of blocking (§4.5 item 3),
/// and to wake sleeping peers (§5).
#[derive(Default)]
pub struct CacheMask(AtomicUsize);

impl CacheMask {
    pub fn set(&self, bit: usize) {
        self.0.fetch_or(bit, Ordering::Release);
    }

    pub fn clear(&self, bit: usize) {
        self.0.fetch_and(!bit, Ordering::Release);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn contains(&self, bit: usize) -> bool {
        self.get() & bit != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_remove_is_idempotent() {
        let mut l = LinkedList::with_capacity(8);
        assert!(l.push_back(3));
        assert!(!l.push_back(3)); // already linked
        assert!(l.remove(3));
        assert!(!l.remove(3)); // already gone
    }

    #[test]
    fn fifo_order_preserved() {
        let mut l = LinkedList::with_capacity(8);
        l.push_back(1);
        l.push_back(2);
        l.push_back(3);
        assert_eq!(l.drain_snapshot(), vec![1, 2, 3]);
    }

    #[test]
    fn remove_middle_preserves_links() {
        let mut l = LinkedList::with_capacity(8);
        l.push_back(1);
        l.push_back(2);
        l.push_back(3);
        assert!(l.remove(2));
        assert_eq!(l.drain_snapshot(), vec![1, 3]);
    }

    #[test]
    fn global_cache_try_drain_is_nonblocking_under_contention() {
        let cache = GlobalCache::with_capacity(4);
        cache.admit(0);
        let _reader = cache.list.read().unwrap();
        // A reader holds the lock; try_write must not block.
        assert!(cache.try_drain_snapshot().is_none());
    }

    #[test]
    fn i3_each_cache_eligible_fd_appears_exactly_once() {
        let global = GlobalCache::with_capacity(8);
        let per_thread = PerThreadCache::with_capacity(8);
        global.admit(1);
        per_thread.admit(2);
        // Re-admission is a no-op, not a duplicate.
        assert!(!global.admit(1));
        assert_eq!(global.try_drain_snapshot().unwrap(), vec![1]);
        assert_eq!(per_thread.drain_snapshot(), vec![2]);
    }
}
