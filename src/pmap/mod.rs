//! PMAP: segment-map slots, the installed/wired/dirty bookkeeping that
//! associates a frame with a (segment, page) slot, and the per-ASTE
//! installed-page counter (§4.2).
//!
//! The PMAP lock is a distinct, coarser-grained lock than the AST lock
//! (§5): it protects segment-map slots, frame back-pointers, MMU
//! installation, and the ASTE page-count field. Rather than split a single
//! `Aste` struct's fields across two locks with careful field-level
//! discipline, this module owns the segment-map table itself, indexed by
//! [`AsteId`] — the AST module allocates the ID and asks PMAP to
//! initialize/release the matching slot. This keeps "what the PMAP lock
//! guards" and "what the AST lock guards" as two separate data structures
//! instead of one struct mutexed two different ways.

mod slot;

pub use slot::SegMapSlot;

use std::sync::Mutex;

use crate::error::{PagingError, PagingResult};
use crate::event_count::EventCount;
use crate::external::{AbortReason, Collaborators, DiskAddress};
use crate::ids::{AsteId, FrameId};
use crate::mmap::Mmap;
use crate::PAGES_PER_SEGMENT;

struct PmapState {
    segmaps: Vec<[SegMapSlot; PAGES_PER_SEGMENT]>,
    page_counts: Vec<u32>,
}

/// Flush mode for `pmap_flush` (used by `deactivate_segment`, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Write dirty pages back, keep clean ones resident.
    Normal,
    /// Write back and discard everything (object is going away).
    Purge,
}

pub struct Pmap {
    state: Mutex<PmapState>,
    /// The PMAP-in-transition event count (§5).
    in_trans: EventCount,
}

impl Pmap {
    pub fn new(aste_capacity: usize) -> Self {
        Self {
            state: Mutex::new(PmapState {
                segmaps: vec![[SegMapSlot::EMPTY; PAGES_PER_SEGMENT]; aste_capacity],
                page_counts: vec![0; aste_capacity],
            }),
            in_trans: EventCount::new(),
        }
    }

    fn ensure_capacity(st: &mut PmapState, aste: AsteId) {
        if aste.index() >= st.segmaps.len() {
            st.segmaps
                .resize(aste.index() + 1, [SegMapSlot::EMPTY; PAGES_PER_SEGMENT]);
            st.page_counts.resize(aste.index() + 1, 0);
        }
    }

    /// Reset the segment map for a freshly allocated or about-to-be-reused
    /// ASTE slot to all-empty.
    pub fn init_segment(&self, aste: AsteId) {
        let mut st = self.state.lock().unwrap();
        Self::ensure_capacity(&mut st, aste);
        st.segmaps[aste.index()] = [SegMapSlot::EMPTY; PAGES_PER_SEGMENT];
        st.page_counts[aste.index()] = 0;
    }

    pub fn slot(&self, aste: AsteId, page: usize) -> SegMapSlot {
        self.state.lock().unwrap().segmaps[aste.index()][page]
    }

    pub fn segment_image(&self, aste: AsteId) -> [SegMapSlot; PAGES_PER_SEGMENT] {
        self.state.lock().unwrap().segmaps[aste.index()]
    }

    pub fn page_count(&self, aste: AsteId) -> u32 {
        self.state.lock().unwrap().page_counts[aste.index()]
    }

    /// Seed a slot with a disk-only backing address (used when populating
    /// a segment map from an on-disk FM record, or by `setup_page_read`).
    pub fn set_disk_address(&self, aste: AsteId, page: usize, addr: DiskAddress, cow: bool) {
        let mut st = self.state.lock().unwrap();
        st.segmaps[aste.index()][page] = SegMapSlot::disk_only(addr, cow);
    }

    /// Block the caller until the slot's IN_TRANSITION bit clears.
    pub fn wait_for_page_transition(&self, aste: AsteId, page: usize) {
        loop {
            let target = {
                let st = self.state.lock().unwrap();
                if !st.segmaps[aste.index()][page].is_in_transition() {
                    return;
                }
                self.in_trans.read().wrapping_add(1)
            };
            self.in_trans.wait(target);
        }
    }

    /// Mark `[start, end)` as IN_TRANSITION ahead of an I/O operation.
    pub fn set_transition_bits(&self, aste: AsteId, start: usize, end: usize) {
        let mut st = self.state.lock().unwrap();
        for p in start..end {
            st.segmaps[aste.index()][p] = st.segmaps[aste.index()][p].with_in_transition(true);
        }
    }

    /// Clear IN_TRANSITION over `[start, end)` and wake any waiters. Called
    /// both when a read completes successfully and when it fails (so
    /// waiters are never stranded, §7 propagation policy).
    pub fn clear_transition_bits(&self, aste: AsteId, start: usize, end: usize) {
        {
            let mut st = self.state.lock().unwrap();
            for p in start..end {
                st.segmaps[aste.index()][p] = st.segmaps[aste.index()][p].with_in_transition(false);
            }
        }
        self.in_trans.advance();
    }

    /// `pmap_assoc(aste, page, frame, wired)` (§4.2). `assoc_area` uses the
    /// same implementation; the AOTE concurrency check it skips happens
    /// one layer up, in the AST module.
    pub fn pmap_assoc(
        &self,
        mmap: &Mmap,
        collab: &dyn Collaborators,
        aste: AsteId,
        page: usize,
        frame: FrameId,
        wired: bool,
    ) -> PagingResult<()> {
        self.wait_for_page_transition(aste, page);

        if frame.is_none() {
            collab.abort(AbortReason::PmapInvariantViolation);
        }

        let mut st = self.state.lock().unwrap();
        let slot = st.segmaps[aste.index()][page];

        if slot.is_in_use() {
            let old_frame = FrameId::new(slot.frame_number());
            drop(st);
            if mmap.frame_wire_count(old_frame) != 0 {
                return Err(PagingError::PmapHasRefs);
            }
            if slot.is_wired() {
                collab.mmu_remove(old_frame.0);
            }
            let restored_addr = mmap.frame_disk_addr(old_frame);
            mmap.free(old_frame);
            st = self.state.lock().unwrap();
            st.segmaps[aste.index()][page] = SegMapSlot::disk_only(restored_addr, slot.is_cow());
            st.page_counts[aste.index()] -= 1;
        }

        let disk_addr = st.segmaps[aste.index()][page].disk_address();
        let cow = st.segmaps[aste.index()][page].is_cow();
        drop(st);

        mmap.set_back_pointer(frame, aste, page as u8, disk_addr);
        if wired {
            // Pin the frame in MMAP too, so its PMAP refcount (the wire
            // count `pmap_assoc`'s own HAS_REFS check above reads) reflects
            // the WIRED bit being set here, not just the segment-map slot.
            mmap.wire(frame);
        }

        let mut st = self.state.lock().unwrap();
        st.segmaps[aste.index()][page] = SegMapSlot::installed(frame.0, wired, cow);
        st.page_counts[aste.index()] += 1;
        Ok(())
    }

    /// `invalidate_page(aste, page, frame)` (§4.2): disassociate a frame
    /// from a slot, restoring its disk address and returning it to the
    /// free pool.
    pub fn invalidate_page(
        &self,
        mmap: &Mmap,
        collab: &dyn Collaborators,
        aste: AsteId,
        page: usize,
    ) {
        let mut st = self.state.lock().unwrap();
        let slot = st.segmaps[aste.index()][page];
        if !slot.is_in_use() {
            return;
        }
        let frame = FrameId::new(slot.frame_number());
        drop(st);

        collab.mmu_remove(frame.0);
        let disk_addr = mmap.frame_disk_addr(frame);
        mmap.free(frame);

        let mut st = self.state.lock().unwrap();
        st.segmaps[aste.index()][page] = SegMapSlot::disk_only(disk_addr, slot.is_cow());
        st.page_counts[aste.index()] -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::Mmap;
    use crate::test_support::StubCollaborators;

    #[test]
    fn assoc_then_invalidate_round_trips_page_count() {
        let pmap = Pmap::new(4);
        let mmap = Mmap::new(4, 0);
        let collab = StubCollaborators::new();
        let aste = AsteId::new(0);
        pmap.init_segment(aste);
        let frame = mmap.alloc_free(1).unwrap()[0];

        pmap.pmap_assoc(&mmap, &collab, aste, 0, frame, false).unwrap();
        assert_eq!(pmap.page_count(aste), 1);
        assert!(pmap.slot(aste, 0).is_in_use());

        pmap.invalidate_page(&mmap, &collab, aste, 0);
        assert_eq!(pmap.page_count(aste), 0);
        assert!(!pmap.slot(aste, 0).is_in_use());
    }

    #[test]
    fn assoc_over_wired_slot_rejects_with_has_refs() {
        let pmap = Pmap::new(4);
        let mmap = Mmap::new(4, 0);
        let collab = StubCollaborators::new();
        let aste = AsteId::new(0);
        pmap.init_segment(aste);
        let frames = mmap.alloc_free(2).unwrap();

        pmap.pmap_assoc(&mmap, &collab, aste, 0, frames[0], false).unwrap();
        mmap.wire(frames[0]);

        let err = pmap
            .pmap_assoc(&mmap, &collab, aste, 0, frames[1], false)
            .unwrap_err();
        assert!(matches!(err, PagingError::PmapHasRefs));
    }

    #[test]
    fn transition_bits_block_until_cleared() {
        let pmap = Pmap::new(2);
        let aste = AsteId::new(0);
        pmap.init_segment(aste);
        pmap.set_transition_bits(aste, 0, 4);
        assert!(pmap.slot(aste, 0).is_in_transition());
        pmap.clear_transition_bits(aste, 0, 4);
        assert!(!pmap.slot(aste, 0).is_in_transition());
        // Should return immediately now that the bit is clear.
        pmap.wait_for_page_transition(aste, 0);
    }

    #[test]
    fn slot_bit_packing_round_trips_through_disk_word() {
        let installed = SegMapSlot::installed(0x1234, true, true);
        assert_eq!(installed.frame_number(), 0x1234);
        assert!(installed.is_wired());
        assert!(installed.is_cow());

        let word = installed.to_disk_word(0xABCDE, true);
        let restored = SegMapSlot::from_disk_word(word);
        assert!(!restored.is_in_use());
        assert!(restored.is_cow());
        assert_eq!(restored.disk_address(), 0xABCDE);
    }
}
