//! Active Segment Table Entry (§3).

use bitflags::bitflags;

use crate::ids::{AoteId, AsteId};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AsteFlags: u16 {
        const IN_TRANSITION = 1 << 0;
        const BUSY          = 1 << 1;
        const DIRTY         = 1 << 2;
        const TOUCHED       = 1 << 3;
        const AREA          = 1 << 4;
        const REMOTE        = 1 << 5;
        const LOCKED        = 1 << 6;
    }
}

/// One cached (object, segment) pair (§3). The segment map itself lives in
/// [`crate::pmap::Pmap`], indexed by the same [`AsteId`]; this struct holds
/// everything the AST lock (rather than the PMAP lock) governs.
#[derive(Debug, Clone)]
pub struct Aste {
    pub aote: AoteId,
    pub segment: u32,
    pub wire_count: u32,
    pub flags: AsteFlags,
    /// Next entry in the AOTE's descending-by-segment list, or the next
    /// free-list entry when this ASTE is unallocated. The two uses are
    /// mutually exclusive (an ASTE is either owned by an AOTE or on the
    /// free list, never both), mirroring the original's pointer reuse.
    pub next: AsteId,
}

impl Aste {
    pub fn vacant() -> Self {
        Self {
            aote: AoteId::NONE,
            segment: 0,
            wire_count: 0,
            flags: AsteFlags::empty(),
            next: AsteId::NONE,
        }
    }

    pub fn is_free(&self) -> bool {
        self.aote.is_none()
    }
}

impl Default for Aste {
    fn default() -> Self {
        Self::vacant()
    }
}

/// Tracks counts of local/remote/area ASTEs (§4.3, "Counters for
/// local/remote/area ASTEs are maintained; on type transition, update all
/// three").
#[derive(Debug, Default, Clone, Copy)]
pub struct AsteTypeCounts {
    pub local: usize,
    pub remote: usize,
    pub area: usize,
}

impl AsteTypeCounts {
    pub fn on_allocate(&mut self, flags: AsteFlags) {
        self.bump(flags, 1);
    }

    pub fn on_free(&mut self, flags: AsteFlags) {
        self.bump(flags, -1);
    }

    fn bump(&mut self, flags: AsteFlags, delta: isize) {
        let apply = |n: &mut usize| {
            if delta < 0 {
                *n = n.saturating_sub(1);
            } else {
                *n += 1;
            }
        };
        if flags.contains(AsteFlags::AREA) {
            apply(&mut self.area);
        } else if flags.contains(AsteFlags::REMOTE) {
            apply(&mut self.remote);
        } else {
            apply(&mut self.local);
        }
    }
}
