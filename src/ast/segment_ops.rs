//! `deactivate_segment`, `update_aste`, `invalidate`, `free_pages`,
//! `release_pages` (§4.3, §4.6).

use bitflags::bitflags;

use crate::error::{PagingError, PagingResult};
use crate::ids::{AsteId, FrameId};
use crate::external::Collaborators;
use crate::PAGES_PER_SEGMENT;

use super::{AsteFlags, AstTable};

bitflags! {
    /// Flags to `deactivate_segment` (§4.3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DeactivateFlags: u8 {
        /// Discard rather than preserve (object going away). Currently
        /// handled identically to normal flush at this layer: dirty page
        /// *content* writeback is delegated entirely to the disk
        /// subsystem once a page has a BAT-reserved block (§1 scope —
        /// only `fm_read`/`fm_write`/`bat_*` are modeled collaborators).
        /// `update_aste`'s `fm_write` call is what actually persists the
        /// segment's disk-address directory either way.
        const PURGE = 1 << 0;
        /// Skip the `update_aste`/`area_deactivate_aste` writeback step
        /// (caller already knows the segment is clean, or is purging
        /// without caring about the FM record).
        const SKIP_UPDATE = 1 << 1;
    }
}

impl DeactivateFlags {
    pub const NORMAL: Self = Self::empty();
}

impl AstTable {
    /// `deactivate_segment(aste, flags)` (§4.3).
    pub fn deactivate_segment(
        &self,
        collab: &dyn Collaborators,
        id: AsteId,
        flags: DeactivateFlags,
    ) -> PagingResult<()> {
        {
            let mut st = self.state.lock().unwrap();
            let a = &st.astes[id.index()];
            if a.flags.contains(AsteFlags::IN_TRANSITION) || a.wire_count != 0 {
                return Err(PagingError::AstSegmentNotDeactivatable);
            }
            st.astes[id.index()].flags.insert(AsteFlags::IN_TRANSITION);
        }

        self.pmap_flush(collab, id);

        let result = if flags.contains(DeactivateFlags::SKIP_UPDATE) {
            Ok(())
        } else {
            self.update_aste(collab, id)
        };

        match result {
            Ok(()) => {
                let aote = self.with_state(|st| {
                    let aote = st.astes[id.index()].aote;
                    Self::detach_aste(st, aote, id);
                    aote
                });
                let _ = aote;
                // §3: an ASTE is destroyed once deactivated. Return it to
                // the free list here rather than leaving it merely
                // detached — callers that need the specific slot back for
                // immediate reuse (the eviction scan) pop it straight back
                // off instead of assuming it's still theirs.
                self.free_aste(id);
                self.ast_trans.advance();
                Ok(())
            }
            Err(e) => {
                let mut st = self.state.lock().unwrap();
                st.astes[id.index()].flags.remove(AsteFlags::IN_TRANSITION);
                drop(st);
                self.ast_trans.advance();
                Err(e)
            }
        }
    }

    /// Demote every installed page of a segment back to disk-address form,
    /// freeing its frames. The portable part of `pmap_flush` (§4.3).
    fn pmap_flush(&self, collab: &dyn Collaborators, id: AsteId) {
        for page in 0..PAGES_PER_SEGMENT {
            if self.pmap.slot(id, page).is_in_use() {
                self.pmap.invalidate_page(&self.mmap, collab, id, page);
            }
        }
    }

    /// `update_aste(aste, segmap, flags)` (§4.3).
    pub fn update_aste(&self, collab: &dyn Collaborators, id: AsteId) -> PagingResult<()> {
        let (dirty, remote) = {
            let st = self.state.lock().unwrap();
            let a = &st.astes[id.index()];
            (a.flags.contains(AsteFlags::DIRTY), a.flags.contains(AsteFlags::REMOTE))
        };
        if !dirty || remote {
            return Ok(());
        }
        self.with_state(|st| st.astes[id.index()].flags.remove(AsteFlags::DIRTY));

        let mut image = [0u32; PAGES_PER_SEGMENT];
        for page in 0..PAGES_PER_SEGMENT {
            let slot = self.pmap.slot(id, page);
            let (disk_addr, needs_write) = if slot.is_in_use() {
                let frame = FrameId::new(slot.frame_number());
                (self.mmap.frame_disk_addr(frame), self.mmap.frame_modified(frame))
            } else {
                (slot.disk_address(), slot.is_cow())
            };
            image[page] = slot.to_disk_word(disk_addr, needs_write);
        }

        let (aote, segment) = self.with_state(|st| {
            let a = &st.astes[id.index()];
            (a.aote, a.segment)
        });
        let handle = self.with_state(|st| st.aotes[aote.index()].vtoc);
        let handle = match handle {
            Some(h) => h,
            // Remote objects, or an object whose VTOC handle was never
            // resolved locally, have nothing to write through FM.
            None => return Ok(()),
        };

        let (fm_ptr, _delta) = collab.vtoce_lookup_fm(handle, segment)?;
        match collab.fm_write(handle, fm_ptr, segment, &image) {
            Ok(()) => Ok(()),
            Err(PagingError::DiskWriteProtected) => Ok(()),
            Err(e) => {
                self.with_state(|st| st.astes[id.index()].flags.insert(AsteFlags::DIRTY));
                Err(e)
            }
        }
    }

    /// `invalidate(uid, [start, end], flags)` (§4.6), scoped to one ASTE's
    /// page range; the UID/segment-range fan-out lives in
    /// [`crate::aot`]'s object-level entry point.
    pub fn invalidate_range(
        &self,
        collab: &dyn Collaborators,
        id: AsteId,
        start: usize,
        end: usize,
        with_wait: bool,
    ) -> PagingResult<()> {
        for page in (start..end).rev() {
            if with_wait {
                self.pmap.wait_for_page_transition(id, page);
            } else if self.pmap.slot(id, page).is_in_transition() {
                continue;
            }

            let slot = self.pmap.slot(id, page);
            if !slot.is_in_use() {
                continue;
            }
            let frame = FrameId::new(slot.frame_number());
            if with_wait {
                if self.mmap.frame_wire_count(frame) != 0 {
                    return Err(PagingError::PageHasRefs);
                }
                self.pmap.invalidate_page(&self.mmap, collab, id, page);
                self.with_state(|st| st.astes[id.index()].flags.insert(AsteFlags::DIRTY));
            } else if self.mmap.frame_wire_count(frame) == 0 {
                self.mmap.impure_transfer(frame);
            }
        }
        Ok(())
    }

    /// `free_pages(aste, start, end, bat_flags)` (§4.6).
    pub fn free_pages(
        &self,
        collab: &dyn Collaborators,
        id: AsteId,
        start: usize,
        end: usize,
        bat_flags: u32,
    ) -> PagingResult<()> {
        let mut addr_batch = Vec::with_capacity(self.config.free_pages_batch);
        for page in start..end {
            let slot = self.pmap.slot(id, page);
            let addr = if slot.is_in_use() {
                let frame = FrameId::new(slot.frame_number());
                let addr = self.mmap.frame_disk_addr(frame);
                self.pmap.invalidate_page(&self.mmap, collab, id, page);
                addr
            } else {
                slot.disk_address()
            };
            self.pmap.set_disk_address(id, page, 0, false);
            if addr != 0 {
                addr_batch.push(addr);
            }
            if addr_batch.len() >= self.config.free_pages_batch {
                collab.bat_free(&addr_batch, bat_flags)?;
                addr_batch.clear();
            }
        }
        if !addr_batch.is_empty() {
            collab.bat_free(&addr_batch, bat_flags)?;
        }
        self.with_state(|st| st.astes[id.index()].flags.insert(AsteFlags::DIRTY));
        Ok(())
    }

    /// `release_pages(aste, return_to_pool?)` (§6): drop the caller's pin
    /// on a segment obtained through `activate_and_wire` without tearing
    /// down its content.
    pub fn release_pages(&self, id: AsteId) {
        self.with_state(|st| {
            st.astes[id.index()].wire_count = st.astes[id.index()].wire_count.saturating_sub(1);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{TouchFlags, TouchMode};
    use crate::config::PagingConfig;
    use crate::external::ObjectLocation;
    use crate::ids::Uid;
    use crate::mmap::Mmap;
    use crate::pmap::Pmap;
    use crate::test_support::StubCollaborators;
    use std::sync::Arc;

    fn small_table() -> AstTable {
        let config = PagingConfig {
            max_aste: 4,
            max_aote: 4,
            max_frames: 32,
            ..PagingConfig::default()
        };
        let pmap = Arc::new(Pmap::new(4));
        let mmap = Arc::new(Mmap::new(32, 0));
        AstTable::new(config, pmap, mmap)
    }

    #[test]
    fn deactivate_segment_rejects_wired_then_succeeds_once_unwired() {
        let table = small_table();
        let collab = StubCollaborators::new();
        let aote = table
            .force_activate_segment(&collab, Uid(1), ObjectLocation::Local { volume: 0 })
            .unwrap();
        let aste = table.lookup_or_create_aste(&collab, aote, 0);
        table
            .touch(&collab, aste, TouchMode::Exclusive, 0, 1, TouchFlags::GROW, 0)
            .unwrap();

        table.wire_aste(aste);
        assert!(matches!(
            table.deactivate_segment(&collab, aste, DeactivateFlags::NORMAL),
            Err(PagingError::AstSegmentNotDeactivatable)
        ));

        table.release_pages(aste);
        table
            .deactivate_segment(&collab, aste, DeactivateFlags::NORMAL)
            .unwrap();
        assert!(table.with_state(|st| st.astes[aste.index()].is_free()));
    }

    #[test]
    fn invalidate_range_with_wait_rejects_wired_pages() {
        let table = small_table();
        let collab = StubCollaborators::new();
        let aote = table
            .force_activate_segment(&collab, Uid(2), ObjectLocation::Local { volume: 0 })
            .unwrap();
        let aste = table.lookup_or_create_aste(&collab, aote, 0);
        let frames = table
            .touch(&collab, aste, TouchMode::Exclusive, 0, 1, TouchFlags::GROW, 0)
            .unwrap();
        table.mmap.wire(frames[0]);

        let err = table
            .invalidate_range(&collab, aste, 0, 1, true)
            .unwrap_err();
        assert!(matches!(err, PagingError::PageHasRefs));
    }

    #[test]
    fn invalidate_range_no_wait_skips_in_transition_pages() {
        let table = small_table();
        let collab = StubCollaborators::new();
        let aote = table
            .force_activate_segment(&collab, Uid(3), ObjectLocation::Local { volume: 0 })
            .unwrap();
        let aste = table.lookup_or_create_aste(&collab, aote, 0);
        table
            .touch(&collab, aste, TouchMode::Exclusive, 0, 1, TouchFlags::GROW, 0)
            .unwrap();

        // The no-wait path only reclassifies the frame for eviction; the
        // segment-map slot itself stays installed until something actually
        // demands the frame back (§4.6).
        table.invalidate_range(&collab, aste, 0, 1, false).unwrap();
        assert!(table.pmap.slot(aste, 0).is_in_use());
    }
}
