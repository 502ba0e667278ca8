//! The per-thread update list (§3, §4.3): FDs whose `POLLED_*` bits changed
//! since the last time this thread synced with its poller backend.

use std::sync::atomic::{AtomicUsize, Ordering};

/// A thread's pending-registration-change queue. Capacity equals the FD
/// table size, since an FD can appear at most once per thread per drain
/// (enforced by the caller via the FD's `update_mask` bit, not by this
/// type).
pub struct UpdateList {
    buf: Vec<i32>,
}

impl UpdateList {
    pub fn with_capacity(capacity: usize) -> UpdateList {
        UpdateList {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, fd: i32) {
        self.buf.push(fd);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take every pending entry, leaving the list empty. The caller (the
    /// poller backend, per §4.3) is responsible for clearing the
    /// corresponding `update_mask` bit for each entry once it has reconciled
    /// the kernel registration.
    pub fn drain(&mut self) -> Vec<i32> {
        std::mem::take(&mut self.buf)
    }
}

/// `updt_fd_polling`: record that `fd`'s polled intent changed on thread
/// `bit` and should be reconciled with the kernel on the next sync. Returns
/// `true` if this is the first time since the last drain (and the FD was
/// actually enqueued), `false` if it was already pending (idempotent).
pub fn updt_fd_polling(
    update_mask: &AtomicUsize,
    bit: usize,
    list: &mut UpdateList,
    fd: i32,
) -> bool {
    let prev = update_mask.fetch_or(bit, Ordering::AcqRel);
    if prev & bit != 0 {
        return false; // already queued, at-most-once per drain
    }
    list.push(fd);
    true
}

/// Clear this thread's bit in `update_mask`, called once the backend has
/// finished reconciling `fd`'s registration for this drain.
pub fn clear_pending(update_mask: &AtomicUsize, bit: usize) {
    update_mask.fetch_and(!bit, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i4_at_most_once_until_drained() {
        let mask = AtomicUsize::new(0);
        let mut list = UpdateList::with_capacity(4);
        assert!(updt_fd_polling(&mask, 1, &mut list, 7));
        assert!(!updt_fd_polling(&mask, 1, &mut list, 7)); // idempotent
        assert_eq!(list.drain(), vec![7]);
        clear_pending(&mask, 1);
        // After drain + clear, the same FD can be enqueued again.
        assert!(updt_fd_polling(&mask, 1, &mut list, 7));
    }

    #[test]
    fn l3_n_threads_enqueue_independently() {
        let mask = AtomicUsize::new(0);
        let mut t0 = UpdateList::with_capacity(4);
        let mut t1 = UpdateList::with_capacity(4);
        assert!(updt_fd_polling(&mask, 1 << 0, &mut t0, 7));
        assert!(updt_fd_polling(&mask, 1 << 1, &mut t1, 7));
        assert_eq!(t0.drain(), vec![7]);
        assert_eq!(t1.drain(), vec![7]);
    }
}
