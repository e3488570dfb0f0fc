//! Active Object Table Entry (§3).

use bitflags::bitflags;

use crate::external::{AttrBuffer, ObjectLocation, VtocHandle, ATTR_BUFFER_LEN};
use crate::ids::{AoteId, AsteId};
use crate::ids::Uid;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AoteFlags: u16 {
        const IN_TRANSITION    = 1 << 0;
        const BUSY             = 1 << 1;
        const DIRTY            = 1 << 2;
        const TOUCHED          = 1 << 3;
        const SIZE_HINT_DIRTY  = 1 << 4;
        const REMOTE           = 1 << 5;
        /// Object content is reinitialized at boot and effectively
        /// read-only from the core's perspective (§GLOSSARY, "per-boot").
        const PER_BOOT         = 1 << 6;
    }
}

/// One currently-cached object (§3).
#[derive(Debug, Clone)]
pub struct Aote {
    pub uid: Uid,
    pub location: ObjectLocation,
    /// Resolved VTOC handle for local objects (populated during
    /// `force_activate_segment`'s `vtoc_lookup`). `None` for remote
    /// objects, which route attribute IO through the network contracts
    /// instead.
    pub vtoc: Option<VtocHandle>,
    pub attrs: AttrBuffer,
    pub dts: u64,
    pub dtm: u64,
    pub dtu: u64,
    /// Head of the descending-by-segment ASTE list.
    pub aste_head: AsteId,
    pub aste_count: usize,
    pub refcount: u32,
    /// Per-object concurrency token (§3): `0` means unheld, `1` is the
    /// wildcard value that is always compatible, anything else marks an
    /// exclusive hold that only an identical token may join. Checked (never
    /// written) by `touch`'s step-1 access enforcement (§4.3); see
    /// DESIGN.md for how this crate's API establishes it.
    pub concurrency_token: u32,
    pub flags: AoteFlags,
    /// Monotonically increasing on every allocation, used to detect a race
    /// between a lookup and a concurrent `force_activate_segment` (§4.4
    /// step 2).
    pub seqn: u64,
    /// Next AOTE in this UID-hash bucket's chain, or the next free-list
    /// entry when unallocated.
    pub hash_next: AoteId,
}

impl Aote {
    pub fn vacant() -> Self {
        Self {
            uid: Uid::NIL,
            location: ObjectLocation::Local { volume: 0 },
            vtoc: None,
            attrs: [0u8; ATTR_BUFFER_LEN],
            dts: 0,
            dtm: 0,
            dtu: 0,
            aste_head: AsteId::NONE,
            aste_count: 0,
            refcount: 0,
            concurrency_token: 0,
            flags: AoteFlags::empty(),
            seqn: 0,
            hash_next: AoteId::NONE,
        }
    }

    pub fn is_free(&self) -> bool {
        self.uid.is_nil() && self.aste_count == 0 && self.refcount == 0
    }
}

impl Default for Aote {
    fn default() -> Self {
        Self::vacant()
    }
}
