//! MMAP: frame table, working-set lists, and the replacement scanner
//! (§4.1).
//!
//! Frames form a circular doubly-linked list per working-set list (WSL).
//! The original source links these intrusively via raw frame-table
//! pointers; here each [`Frame`] carries `next`/`prev` [`FrameId`]s and a
//! frame whose `next == prev == self` is the sole member of its list (§9).
//! All mutating entry points take the table's single mutex, held only for
//! pointer-chasing bookkeeping — never across I/O.

mod frame;
mod scan;
mod wsl;

pub use frame::{Frame, FrameFlags};
pub use wsl::{WslFlags, WslHeader};

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{PagingError, PagingResult};
use crate::external::{Collaborators, DiskAddress};
use crate::ids::{wsl as wsl_index, AsteId, FrameId, WslId};

/// Replacement-scan mode (§4.1, `ws_scan`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Honor the REFERENCED bit (second-chance).
    Normal,
    /// Eagerly evict dirty-pageable frames too.
    Aggressive,
}

/// Classification bucket a frame is moved to when evicted by `ws_scan`
/// (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvictionBucket {
    CleanImpure,
    CleanPure,
    DirtyNoFlush,
    DirtyFlush,
}

impl EvictionBucket {
    fn target_wsl(self) -> WslId {
        match self {
            Self::CleanImpure => wsl_index::CLEAN_IMPURE,
            Self::CleanPure => wsl_index::CLEAN_PURE,
            Self::DirtyNoFlush | Self::DirtyFlush => wsl_index::DIRTY,
        }
    }
}

/// Running statistics, exposed mainly so tests can assert on them (§8
/// scenario 4: `MMAP_$ALLOC_CNT` / `MMAP_$ALLOC_PAGES`).
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapStats {
    pub alloc_count: u64,
    pub alloc_pages: u64,
    pub free_count: u64,
    pub free_pages: u64,
}

struct MmapState {
    frames: Vec<Frame>,
    wsls: Vec<WslHeader>,
    pid_to_wsl: HashMap<u64, WslId>,
    stats: MmapStats,
}

impl MmapState {
    /// True if `frame` is the sole member of its own list.
    fn is_singleton(&self, frame: FrameId) -> bool {
        let f = &self.frames[frame.index()];
        f.next == frame && f.prev == frame
    }

    /// Unlink `frame` from whatever WSL it is currently linked into.
    /// No-op if the frame is not IN_WSL.
    fn unlink(&mut self, frame: FrameId) {
        if !self.frames[frame.index()].flags.contains(FrameFlags::IN_WSL) {
            return;
        }
        let wsl_id = self.frames[frame.index()].wsl;
        let (next, prev) = {
            let f = &self.frames[frame.index()];
            (f.next, f.prev)
        };
        if self.is_singleton(frame) {
            self.wsls[wsl_id.index()].head = FrameId::NONE;
        } else {
            self.frames[next.index()].prev = prev;
            self.frames[prev.index()].next = next;
            if self.wsls[wsl_id.index()].head == frame {
                self.wsls[wsl_id.index()].head = next;
            }
        }
        let f = &mut self.frames[frame.index()];
        f.next = frame;
        f.prev = frame;
        f.flags.remove(FrameFlags::IN_WSL);
        self.wsls[wsl_id.index()].page_count -= 1;
    }

    /// Insert `frame` at the head of `wsl`.
    fn insert_head(&mut self, wsl: WslId, frame: FrameId) {
        self.insert(wsl, frame, true);
    }

    /// Insert `frame` at the tail of `wsl` (i.e. as the new `prev` of the
    /// current head — "oldest" position).
    fn insert_tail(&mut self, wsl: WslId, frame: FrameId) {
        self.insert(wsl, frame, false);
    }

    fn insert(&mut self, wsl: WslId, frame: FrameId, at_head: bool) {
        let head = self.wsls[wsl.index()].head;
        if head == FrameId::NONE {
            let f = &mut self.frames[frame.index()];
            f.next = frame;
            f.prev = frame;
            self.wsls[wsl.index()].head = frame;
        } else {
            let tail = self.frames[head.index()].prev;
            self.frames[frame.index()].next = head;
            self.frames[frame.index()].prev = tail;
            self.frames[tail.index()].next = frame;
            self.frames[head.index()].prev = frame;
            if at_head {
                self.wsls[wsl.index()].head = frame;
            }
        }
        let f = &mut self.frames[frame.index()];
        f.wsl = wsl;
        f.flags.insert(FrameFlags::IN_WSL);
        self.wsls[wsl.index()].page_count += 1;
    }

    fn iter_wsl(&self, wsl: WslId) -> Vec<FrameId> {
        let mut out = Vec::new();
        let head = self.wsls[wsl.index()].head;
        if head == FrameId::NONE {
            return out;
        }
        let mut cur = head;
        loop {
            out.push(cur);
            cur = self.frames[cur.index()].next;
            if cur == head {
                break;
            }
        }
        out
    }
}

/// The MMAP table: physical frames and the working-set lists that thread
/// them together.
pub struct Mmap {
    state: Mutex<MmapState>,
}

impl Mmap {
    /// Build a fresh table with `frame_count` frames, all on the free list
    /// (WSL 0), and the five reserved WSLs plus `process_wsl_hint` extra
    /// slots pre-allocated for per-process working sets.
    pub fn new(frame_count: usize, process_wsl_hint: usize) -> Self {
        let mut frames = Vec::with_capacity(frame_count);
        for i in 0..frame_count {
            frames.push(Frame::free(FrameId::new(i as u32)));
        }
        let reserved = wsl_index::PROCESS_BASE as usize;
        let mut wsls = Vec::with_capacity(reserved + process_wsl_hint);
        for _ in 0..reserved + process_wsl_hint {
            wsls.push(WslHeader::empty());
        }

        let mut state = MmapState {
            frames,
            wsls,
            pid_to_wsl: HashMap::new(),
            stats: MmapStats::default(),
        };
        // Thread every frame onto the free-pool WSL (index 0), tail order.
        for i in 0..frame_count {
            state.insert_tail(wsl_index::FREE, FrameId::new(i as u32));
        }
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn stats(&self) -> MmapStats {
        self.state.lock().unwrap().stats
    }

    /// `alloc_free(count)`: take frames from the free pool only.
    pub fn alloc_free(&self, count: usize) -> PagingResult<Vec<FrameId>> {
        let mut st = self.state.lock().unwrap();
        let taken = Self::take_from(&mut st, wsl_index::FREE, count);
        if taken.len() < count {
            // Roll back; the caller (allocate_aste/allocate_aote/fault
            // path) is responsible for invoking the purifier and retrying.
            for f in &taken {
                st.insert_head(wsl_index::FREE, *f);
            }
            return Err(PagingError::Collaborator {
                status: crate::error::StatusCode::MmapContigPagesUnavailable as u32,
            });
        }
        st.stats.alloc_count += 1;
        st.stats.alloc_pages += taken.len() as u64;
        Ok(taken)
    }

    /// `alloc_pure(count)`: try the clean pools (free, clean-pure,
    /// clean-impure) before falling back to stealing from `steal_from`'s
    /// own working set via `ws_scan` (§4.1).
    pub fn alloc_pure(&self, count: usize, steal_from: Option<WslId>) -> PagingResult<Vec<FrameId>> {
        let mut out = {
            let mut st = self.state.lock().unwrap();
            let mut out = Self::take_from(&mut st, wsl_index::FREE, count);
            if out.len() < count {
                out.extend(Self::take_from(
                    &mut st,
                    wsl_index::CLEAN_PURE,
                    count - out.len(),
                ));
            }
            if out.len() < count {
                out.extend(Self::take_from(
                    &mut st,
                    wsl_index::CLEAN_IMPURE,
                    count - out.len(),
                ));
            }
            if out.len() == count {
                st.stats.alloc_count += 1;
                st.stats.alloc_pages += out.len() as u64;
            }
            out
        };

        if out.len() < count {
            if let Some(wsl) = steal_from {
                // Steal heuristic (§4.1): don't bother stealing from a WSL
                // already below a reasonable working-set floor, and only
                // try once per call.
                const STEAL_FLOOR_PAGES: usize = 0x180;
                let eligible = {
                    let st = self.state.lock().unwrap();
                    st.wsls[wsl.index()].page_count > STEAL_FLOOR_PAGES
                };
                if eligible {
                    self.ws_scan(wsl, ScanMode::Normal, count - out.len());
                    let mut st = self.state.lock().unwrap();
                    let more = Self::take_from(&mut st, wsl_index::CLEAN_PURE, count - out.len());
                    out.extend(more);
                    let more = Self::take_from(&mut st, wsl_index::CLEAN_IMPURE, count - out.len());
                    out.extend(more);
                    if out.len() == count {
                        st.stats.alloc_count += 1;
                        st.stats.alloc_pages += out.len() as u64;
                    }
                }
            }
        }

        if out.len() < count {
            // Roll back whatever was taken; caller retries after waking
            // the purifier (§4.1, "starvation is prevented by callers
            // retrying").
            let mut st = self.state.lock().unwrap();
            for f in &out {
                st.insert_head(wsl_index::FREE, *f);
            }
            return Err(PagingError::Collaborator {
                status: crate::error::StatusCode::MmapContigPagesUnavailable as u32,
            });
        }
        Ok(out)
    }

    /// `alloc_contig` is never supported (§4.1).
    pub fn alloc_contig(&self, _count: usize) -> PagingResult<Vec<FrameId>> {
        Err(PagingError::ContigPagesUnavailable)
    }

    fn take_from(st: &mut MmapState, wsl: WslId, count: usize) -> Vec<FrameId> {
        let mut out = Vec::with_capacity(count);
        while out.len() < count {
            let head = st.wsls[wsl.index()].head;
            if head == FrameId::NONE {
                break;
            }
            st.unlink(head);
            out.push(head);
        }
        out
    }

    /// `free(frame)`: return a single frame to the free pool.
    pub fn free(&self, frame: FrameId) {
        self.free_list(&[frame]);
    }

    /// `free_list(frames)` / `free_pages(array)`: return frames to the
    /// free pool, clearing residual flags so the round-trip law in §8
    /// holds (indistinguishable from pre-alloc state).
    pub fn free_list(&self, frames: &[FrameId]) {
        let mut st = self.state.lock().unwrap();
        for &frame in frames {
            st.unlink(frame);
            let f = &mut st.frames[frame.index()];
            f.wire_count = 0;
            f.back_segment = AsteId::NONE;
            f.back_page = 0;
            f.flags = FrameFlags::empty();
            f.disk_addr = 0;
            st.insert_head(wsl_index::FREE, frame);
        }
        st.stats.free_count += 1;
        st.stats.free_pages += frames.len() as u64;
    }

    pub fn free_pages(&self, frames: &[FrameId]) {
        self.free_list(frames)
    }

    /// `install_list` / `install_pages`: thread freshly-associated frames
    /// into the wired WSL or a process's working set.
    pub fn install_list(&self, frames: &[FrameId], wired: bool) {
        let mut st = self.state.lock().unwrap();
        for &frame in frames {
            st.unlink(frame);
            let target = if wired { wsl_index::WIRED } else { wsl_index::CLEAN_PURE };
            st.insert_head(target, frame);
        }
    }

    pub fn install_pages(&self, frames: &[FrameId], pid: u64) -> PagingResult<()> {
        let mut st = self.state.lock().unwrap();
        let wsl = *st
            .pid_to_wsl
            .get(&pid)
            .ok_or(PagingError::IllegalPid { pid })?;
        for &frame in frames {
            st.unlink(frame);
            st.insert_head(wsl, frame);
        }
        Ok(())
    }

    /// `reclaim(frames, wired?)`: a frame that is already installed and was
    /// just touched again moves to the head of its target list (refresh
    /// its recency) without changing ownership.
    pub fn reclaim(&self, frames: &[FrameId], wired: bool) {
        self.install_list(frames, wired);
    }

    /// `wire(frame)`: pin a frame so it cannot be evicted or moved between
    /// WSLs. Removes it from its user WSL if present.
    pub fn wire(&self, frame: FrameId) {
        let mut st = self.state.lock().unwrap();
        let count = st.frames[frame.index()].wire_count;
        if count == u32::MAX {
            // Wire-count overflow is fatal (§4.1).
            drop(st);
            panic!("wire count overflow on frame {}", frame);
        }
        st.unlink(frame);
        st.frames[frame.index()].wire_count = count + 1;
        st.insert_head(wsl_index::WIRED, frame);
    }

    /// `unwire(frame)`: decrement the wire count; at zero, a non-ON_DISK
    /// frame is inserted at the tail of `pid`'s working set.
    pub fn unwire(&self, frame: FrameId, pid: u64) {
        let mut st = self.state.lock().unwrap();
        let count = st.frames[frame.index()].wire_count;
        debug_assert!(count > 0, "unwire on a frame with zero wire count");
        let count = count.saturating_sub(1);
        st.frames[frame.index()].wire_count = count;
        if count == 0 {
            let on_disk = st.frames[frame.index()]
                .flags
                .contains(FrameFlags::ON_DISK);
            if !on_disk {
                st.unlink(frame);
                if let Some(&wsl) = st.pid_to_wsl.get(&pid) {
                    st.insert_tail(wsl, frame);
                } else {
                    st.insert_tail(wsl_index::CLEAN_IMPURE, frame);
                }
            }
        }
    }

    /// Remove a frame from its current WSL without freeing it, e.g. while
    /// it is being prepared for a fresh association (mirrors the
    /// `unavailable_remove` entry point in §4.1).
    pub fn unavailable_remove(&self, frame: FrameId) {
        self.state.lock().unwrap().unlink(frame);
    }

    /// Make a previously `unavailable_remove`d frame available again by
    /// reinserting it into the WSL recorded on its frame entry (mirrors
    /// `avail`).
    pub fn avail(&self, frame: FrameId) {
        let mut st = self.state.lock().unwrap();
        let wsl = st.frames[frame.index()].wsl;
        st.insert_head(wsl, frame);
    }

    /// `impure_transfer(frame)`: move a clean frame with refcount 0 from
    /// wherever it sits into the clean-impure pool (used by `invalidate`'s
    /// no-wait path, §4.6).
    pub fn impure_transfer(&self, frame: FrameId) {
        let mut st = self.state.lock().unwrap();
        st.unlink(frame);
        st.frames[frame.index()].flags.insert(FrameFlags::IMPURE);
        st.insert_head(wsl_index::CLEAN_IMPURE, frame);
    }

    pub fn get_ws_index(&self, pid: u64) -> Option<WslId> {
        self.state.lock().unwrap().pid_to_wsl.get(&pid).copied()
    }

    pub fn set_ws_index(&self, pid: u64, wsl: Option<WslId>) -> PagingResult<()> {
        let mut st = self.state.lock().unwrap();
        match wsl {
            Some(id) => {
                if id.index() >= st.wsls.len() {
                    return Err(PagingError::IllegalWslIndex { index: id.0 });
                }
                st.pid_to_wsl.insert(pid, id);
            }
            None => {
                st.pid_to_wsl.remove(&pid);
            }
        }
        Ok(())
    }

    pub fn set_ws_max(&self, wsl: WslId, cap: usize) -> PagingResult<()> {
        let mut st = self.state.lock().unwrap();
        let hdr = st
            .wsls
            .get_mut(wsl.index())
            .ok_or(PagingError::IllegalWslIndex { index: wsl.0 })?;
        hdr.max_pages = cap;
        Ok(())
    }

    /// `free_wsl(pid)`: tear down a process's working set, returning its
    /// frames to the free pool.
    pub fn free_wsl(&self, pid: u64) {
        let wsl = {
            let mut st = self.state.lock().unwrap();
            st.pid_to_wsl.remove(&pid)
        };
        if let Some(wsl) = wsl {
            self.purge(wsl);
        }
    }

    /// `purge(wsl)`: evict every frame in `wsl` back to the free pool.
    pub fn purge(&self, wsl: WslId) {
        let frames = {
            let st = self.state.lock().unwrap();
            st.iter_wsl(wsl)
        };
        self.free_list(&frames);
    }

    pub fn get_impure(&self, wsl: WslId, cap: usize) -> Vec<FrameId> {
        let st = self.state.lock().unwrap();
        st.iter_wsl(wsl)
            .into_iter()
            .filter(|f| st.frames[f.index()].flags.contains(FrameFlags::IMPURE))
            .take(cap)
            .collect()
    }

    /// Back-pointer accessor used by PMAP to validate/update a frame's
    /// reverse mapping during association (§4.2).
    pub fn set_back_pointer(&self, frame: FrameId, seg: AsteId, page: u8, disk_addr: DiskAddress) {
        let mut st = self.state.lock().unwrap();
        let f = &mut st.frames[frame.index()];
        f.back_segment = seg;
        f.back_page = page;
        f.disk_addr = disk_addr;
    }

    pub fn frame_wire_count(&self, frame: FrameId) -> u32 {
        self.state.lock().unwrap().frames[frame.index()].wire_count
    }

    pub fn frame_disk_addr(&self, frame: FrameId) -> DiskAddress {
        self.state.lock().unwrap().frames[frame.index()].disk_addr
    }

    pub fn frame_back_pointer(&self, frame: FrameId) -> (AsteId, u8) {
        let st = self.state.lock().unwrap();
        let f = &st.frames[frame.index()];
        (f.back_segment, f.back_page)
    }

    pub fn frame_modified(&self, frame: FrameId) -> bool {
        self.state.lock().unwrap().frames[frame.index()]
            .flags
            .contains(FrameFlags::MODIFIED)
    }

    pub fn set_modified(&self, frame: FrameId, modified: bool) {
        let mut st = self.state.lock().unwrap();
        let f = &mut st.frames[frame.index()];
        if modified {
            f.flags.insert(FrameFlags::MODIFIED);
        } else {
            f.flags.remove(FrameFlags::MODIFIED);
        }
    }

    pub fn set_referenced(&self, _frame: FrameId, _referenced: bool) {
        // REFERENCED lives on the hardware PTE in the original design; the
        // MMU collaborator owns it. Kept here as a documented no-op seam
        // so callers don't need a feature-gated call site (§9, PTE bits
        // are a collaborator concern via `mmu_install`/`mmu_vtop`).
    }

    #[cfg(any(test, feature = "debug-invariants"))]
    pub fn check_invariants(&self) {
        let st = self.state.lock().unwrap();
        for (i, wsl) in st.wsls.iter().enumerate() {
            let members = st.iter_wsl(WslId::new(i as u32));
            assert_eq!(members.len(), wsl.page_count, "WSL {} page_count mismatch", i);
            for m in &members {
                assert_eq!(
                    st.frames[m.index()].wsl,
                    WslId::new(i as u32),
                    "frame {} claims wrong wsl_index",
                    m
                );
            }
        }
    }
}

/// `ws_scan_callback`/`ws_scan` entry point, kept as an inherent impl split
/// into its own file for readability.
impl Mmap {
    pub fn ws_scan(&self, wsl: WslId, mode: ScanMode, needed: usize) -> usize {
        scan::ws_scan(self, wsl, mode, needed)
    }
}

// Allow the scan submodule to reach the lock-protected state directly.
impl Mmap {
    fn with_state<R>(&self, f: impl FnOnce(&mut MmapState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_exhaustion_rolls_back() {
        let mmap = Mmap::new(4, 0);
        let first = mmap.alloc_free(4).unwrap();
        assert_eq!(first.len(), 4);
        // Pool is empty now; asking for even one more must fail and leave
        // nothing half-taken.
        let err = mmap.alloc_free(1).unwrap_err();
        assert!(matches!(err, PagingError::Collaborator { .. }));
        mmap.free_list(&first);
        let stats = mmap.stats();
        assert_eq!(stats.alloc_pages, 4);
        assert_eq!(stats.free_pages, 4);
    }

    #[test]
    fn alloc_pure_prefers_free_then_clean_pools() {
        let mmap = Mmap::new(8, 0);
        let frames = mmap.alloc_free(8).unwrap();
        mmap.install_list(&frames, false); // lands in CLEAN_PURE
        let reclaimed = mmap.alloc_pure(8, None).unwrap();
        assert_eq!(reclaimed.len(), 8);
    }

    #[test]
    fn alloc_contig_always_fails() {
        let mmap = Mmap::new(4, 0);
        assert!(matches!(
            mmap.alloc_contig(1),
            Err(PagingError::ContigPagesUnavailable)
        ));
    }

    #[test]
    fn wire_then_unwire_round_trips() {
        let mmap = Mmap::new(4, 1);
        mmap.set_ws_index(7, Some(WslId::new(crate::ids::wsl::PROCESS_BASE)))
            .unwrap();
        let frame = mmap.alloc_free(1).unwrap()[0];
        mmap.install_list(&[frame], false);
        mmap.wire(frame);
        assert_eq!(mmap.frame_wire_count(frame), 1);
        mmap.unwire(frame, 7);
        assert_eq!(mmap.frame_wire_count(frame), 0);
        mmap.check_invariants();
    }

    #[test]
    fn free_list_clears_residual_flags() {
        let mmap = Mmap::new(2, 0);
        let frame = mmap.alloc_free(1).unwrap()[0];
        mmap.set_modified(frame, true);
        mmap.set_back_pointer(frame, AsteId::new(3), 7, 42);
        mmap.free(frame);
        assert!(!mmap.frame_modified(frame));
        assert_eq!(mmap.frame_disk_addr(frame), 0);
        assert_eq!(mmap.frame_back_pointer(frame), (AsteId::NONE, 0));
    }

    #[test]
    fn ws_scan_classifies_and_bulk_moves() {
        let mmap = Mmap::new(16, 1);
        let wsl = WslId::new(crate::ids::wsl::PROCESS_BASE);
        mmap.set_ws_index(1, Some(wsl)).unwrap();
        let frames = mmap.alloc_free(16).unwrap();
        mmap.install_pages(&frames, 1).unwrap();
        let scanned = mmap.ws_scan(wsl, ScanMode::Aggressive, 16);
        assert!(scanned > 0);
        mmap.check_invariants();
    }
}
