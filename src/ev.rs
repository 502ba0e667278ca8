//! `ev`: the raw poll-event snapshot held per FD, and `update_events`, the
//! single entry point a poller backend uses to report readiness (§3, §4.6).

/// Readiness bits as reported by the kernel, independent of the §4 state
/// word. `HUP` and `ERR` are sticky: once observed they are never cleared
/// by a later, more innocent readiness report, only by `delete`/`insert`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ev(u8);

impl Ev {
    pub const IN: Ev = Ev(0x01);
    pub const OUT: Ev = Ev(0x02);
    pub const HUP: Ev = Ev(0x04);
    pub const ERR: Ev = Ev(0x08);
    pub const PRI: Ev = Ev(0x10);

    const STICKY: u8 = Self::HUP.0 | Self::ERR.0;

    pub const fn empty() -> Ev {
        Ev(0)
    }

    pub fn contains(self, other: Ev) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Merge a fresh kernel report into the previous snapshot, preserving
    /// sticky bits (§4.6: "merge `evts` into `ev`, preserving sticky bits").
    pub fn merge(self, incoming: Ev) -> Ev {
        Ev((self.0 & Self::STICKY) | incoming.0)
    }
}

impl std::ops::BitOr for Ev {
    type Output = Ev;
    fn bitor(self, rhs: Ev) -> Ev {
        Ev(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Ev {
    fn bitor_assign(&mut self, rhs: Ev) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Debug for Ev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut wrote = false;
        let mut flag = |f: &mut std::fmt::Formatter<'_>, set: bool, name: &str| {
            if set {
                if wrote {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                wrote = true;
            }
            Ok(())
        };
        write!(f, "Ev(")?;
        flag(f, self.contains(Ev::IN), "IN")?;
        flag(f, self.contains(Ev::OUT), "OUT")?;
        flag(f, self.contains(Ev::HUP), "HUP")?;
        flag(f, self.contains(Ev::ERR), "ERR")?;
        flag(f, self.contains(Ev::PRI), "PRI")?;
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_preserves_sticky_hup() {
        let prev = Ev::HUP;
        let next = prev.merge(Ev::IN);
        assert!(next.contains(Ev::HUP));
        assert!(next.contains(Ev::IN));
    }

    #[test]
    fn merge_preserves_sticky_err_across_empty_report() {
        let prev = Ev::ERR | Ev::IN;
        let next = prev.merge(Ev::empty());
        assert!(next.contains(Ev::ERR));
        assert!(!next.contains(Ev::IN));
    }

    #[test]
    fn merge_drops_non_sticky_in_when_absent() {
        let prev = Ev::IN;
        let next = prev.merge(Ev::OUT);
        assert!(!next.contains(Ev::IN));
        assert!(next.contains(Ev::OUT));
    }
}
