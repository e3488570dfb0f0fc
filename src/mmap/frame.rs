//! Per-frame bookkeeping entry (MMAPE, §3).

use bitflags::bitflags;

use crate::external::DiskAddress;
use crate::ids::{AsteId, FrameId};

bitflags! {
    /// Frame-entry flags (§3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// Frame is linked into some WSL (every non-leaked frame is,
        /// always exactly one).
        const IN_WSL    = 1 << 0;
        /// Frame holds data not directly backed by a unique disk block
        /// (e.g. zero-fill or COW-shared) and needs special eviction
        /// handling.
        const IMPURE    = 1 << 1;
        /// A cached disk address exists for this frame's contents.
        const ON_DISK   = 1 << 2;
        /// Contents differ from the cached disk copy.
        const MODIFIED  = 1 << 3;
    }
}

/// One physical page frame's bookkeeping (§3).
#[derive(Debug, Clone)]
pub struct Frame {
    pub wire_count: u32,
    /// Back-pointer: which ASTE's segment map slot references this frame.
    pub back_segment: AsteId,
    /// Back-pointer: which page-in-segment (0..32) references this frame.
    pub back_page: u8,
    pub wsl: crate::ids::WslId,
    pub next: FrameId,
    pub prev: FrameId,
    pub priority: u8,
    pub flags: FrameFlags,
    /// Cached disk address, used both for classification during eviction
    /// and to restore a segment-map slot's disk address on disassociate.
    pub disk_addr: DiskAddress,
}

impl Frame {
    /// A fresh, unowned frame sitting on the free pool.
    pub fn free(id: FrameId) -> Self {
        Self {
            wire_count: 0,
            back_segment: AsteId::NONE,
            back_page: 0,
            wsl: crate::ids::wsl::FREE,
            next: id,
            prev: id,
            priority: 0,
            flags: FrameFlags::empty(),
            disk_addr: 0,
        }
    }
}
