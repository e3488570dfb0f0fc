//! Working-set list headers (§3).

use bitflags::bitflags;

use crate::ids::FrameId;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WslFlags: u8 {
        /// A reserved pool WSL (free/clean/dirty/wired), not a per-process
        /// working set.
        const POOL = 1 << 0;
    }
}

/// A WSL header: the circular list is threaded entirely through
/// [`crate::mmap::Frame::next`]/`prev`; this struct only records the
/// entry point and bookkeeping (§3).
#[derive(Debug, Clone)]
pub struct WslHeader {
    pub flags: WslFlags,
    pub page_count: usize,
    /// Where the scanner left off last time (§4.1, `ws_scan`).
    pub scan_cursor: FrameId,
    pub head: FrameId,
    pub max_pages: usize,
}

impl WslHeader {
    pub fn empty() -> Self {
        Self {
            flags: WslFlags::empty(),
            page_count: 0,
            scan_cursor: FrameId::NONE,
            head: FrameId::NONE,
            max_pages: usize::MAX,
        }
    }
}
