//! The 8-bit per-FD state word and its lock-free transitions (§3, §4.1).
//!
//! Layout (`WwPwRwAw PrRrAr`, low nibble is the read direction):
//!
//! ```text
//! bit 0: ACTIVE_R   bit 4: ACTIVE_W
//! bit 1: READY_R    bit 5: READY_W
//! bit 2: POLLED_R   bit 6: POLLED_W
//! bit 3: unused     bit 7: unused
//! ```
//!
//! `POLLED_d ⇒ ACTIVE_d` and `POLLED_d` is never set in the same CAS that
//! sets `READY_d`, both invariants maintained by construction in the
//! functions below, not checked at runtime on the hot path.

use std::sync::atomic::{AtomicU8, Ordering};

pub const ACTIVE_R: u8 = 0x01;
pub const READY_R: u8 = 0x02;
pub const POLLED_R: u8 = 0x04;
pub const STATUS_R: u8 = 0x07;

pub const SHIFT_W: u8 = 4;
pub const ACTIVE_W: u8 = ACTIVE_R << SHIFT_W;
pub const READY_W: u8 = READY_R << SHIFT_W;
pub const POLLED_W: u8 = POLLED_R << SHIFT_W;
pub const STATUS_W: u8 = STATUS_R << SHIFT_W;

/// Read or write direction. Every transition is defined once, parameterised
/// over the bit shift, rather than duplicated per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Recv,
    Send,
}

impl Dir {
    #[inline]
    fn shift(self) -> u8 {
        match self {
            Dir::Recv => 0,
            Dir::Send => SHIFT_W,
        }
    }

    #[inline]
    fn active(self) -> u8 {
        ACTIVE_R << self.shift()
    }

    #[inline]
    fn ready(self) -> u8 {
        READY_R << self.shift()
    }

    #[inline]
    fn polled(self) -> u8 {
        POLLED_R << self.shift()
    }
}

/// The result of a successful transition: the bits before and after.
#[derive(Debug, Clone, Copy)]
pub struct Delta {
    pub old: u8,
    pub new: u8,
}

impl Delta {
    #[inline]
    pub fn polled_changed(&self, dir: Dir) -> bool {
        (self.old ^ self.new) & dir.polled() != 0
    }
}

/// `true` iff `state` belongs in the ready cache: ready and active in some
/// direction (§4.2's admission predicate).
#[inline]
pub fn cache_eligible(state: u8) -> bool {
    (state & (ACTIVE_R | READY_R) == (ACTIVE_R | READY_R))
        || (state & (ACTIVE_W | READY_W) == (ACTIVE_W | READY_W))
}

/// `want_recv` / `want_send`: the application wants data in `dir`.
fn want(old: u8, dir: Dir) -> Option<u8> {
    if old & dir.active() != 0 {
        return None; // already ACTIVE_d
    }
    let mut new = old | dir.active();
    if new & dir.ready() == 0 {
        new |= dir.polled();
    }
    Some(new)
}

/// `stop_recv` / `stop_send`.
fn stop(old: u8, dir: Dir) -> Option<u8> {
    if old & dir.active() == 0 {
        return None;
    }
    Some(old & !(dir.active() | dir.polled()))
}

/// `cant_recv` / `cant_send`: caller observed `EAGAIN`.
fn cant(old: u8, dir: Dir) -> Option<u8> {
    if old & dir.ready() == 0 {
        return None;
    }
    let mut new = old & !dir.ready();
    if new & dir.active() != 0 {
        new |= dir.polled();
    }
    Some(new)
}

/// `may_recv` / `may_send`: the kernel (or a caller on its behalf) observed
/// readiness. Unconditional; never a no-op.
fn may(old: u8, dir: Dir) -> u8 {
    old | dir.ready()
}

/// `done_recv` / `done_send`: caller suspects EOF on a level-triggered FD.
fn done(old: u8, dir: Dir) -> Option<u8> {
    if old & (dir.polled() | dir.ready()) != (dir.polled() | dir.ready()) {
        return None;
    }
    let mut new = old & !dir.ready();
    if new & dir.active() != 0 {
        new |= dir.polled();
    }
    Some(new)
}

/// The atomic state word itself plus its CAS-retry driver.
#[derive(Debug, Default)]
pub struct StateWord(AtomicU8);

impl StateWord {
    #[inline]
    pub fn load(&self, order: Ordering) -> u8 {
        self.0.load(order)
    }

    /// Reset to the zero state (used by `delete`, §4.4).
    #[inline]
    pub fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    /// Run a CAS retry loop with `compute`, which sees the current value and
    /// returns `None` to short-circuit (no-op) or `Some(new)` to attempt that
    /// transition. Returns the before/after pair on success, `None` on a
    /// short-circuited no-op.
    #[inline]
    fn transition(&self, mut compute: impl FnMut(u8) -> Option<u8>) -> Option<Delta> {
        let mut old = self.0.load(Ordering::Acquire);
        loop {
            let new = compute(old)?;
            if new == old {
                return None;
            }
            match self
                .0
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(Delta { old, new }),
                Err(cur) => old = cur,
            }
        }
    }

    pub fn want(&self, dir: Dir) -> Option<Delta> {
        self.transition(|old| want(old, dir))
    }

    pub fn stop(&self, dir: Dir) -> Option<Delta> {
        self.transition(|old| stop(old, dir))
    }

    pub fn cant(&self, dir: Dir) -> Option<Delta> {
        self.transition(|old| cant(old, dir))
    }

    pub fn may(&self, dir: Dir) -> Delta {
        // `may` never short-circuits, so `transition` always returns `Some`
        // unless the bit was already set (new == old), which is a
        // legitimate no-op we still want to report as "no delta".
        self.transition(|old| Some(may(old, dir)))
            .unwrap_or(Delta { old: 0, new: 0 })
    }

    pub fn done(&self, dir: Dir) -> Option<Delta> {
        self.transition(|old| done(old, dir))
    }

    /// `stop_both`: clear ACTIVE/POLLED in both directions atomically.
    /// No-op if neither direction is active.
    pub fn stop_both(&self) -> Option<Delta> {
        self.transition(|old| {
            if old & (ACTIVE_R | ACTIVE_W) == 0 {
                return None;
            }
            Some(old & !(ACTIVE_R | POLLED_R | ACTIVE_W | POLLED_W))
        })
    }
}
