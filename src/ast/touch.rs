//! `touch` and `assoc`: the fault engine's inner loop (§4.3).

use bitflags::bitflags;

use crate::error::{PagingError, PagingResult};
use crate::external::Collaborators;
use crate::ids::{AsteId, FrameId};
use crate::PAGES_PER_SEGMENT;

use super::{AoteFlags, AsteFlags, AstTable};

/// Access mode requested of `touch` (§4.3 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchMode {
    Shared,
    Exclusive,
}

impl TouchMode {
    /// The value this mode presents to the AOTE's concurrency-token check
    /// (§4.3 step 1, `examples/original_source/domain_os/ast/touch.c:54-59`:
    /// `concurrency != 0 && concurrency != mode && concurrency != 1`).
    /// `Shared` is the wildcard value (`1`) the original treats as always
    /// compatible; `Exclusive` is a distinct held value that only an
    /// identical token may join.
    fn as_token(self) -> u32 {
        match self {
            TouchMode::Shared => 1,
            TouchMode::Exclusive => 2,
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TouchFlags: u8 {
        /// Extend the object if the fault lands past EOF (§4.3 step 6).
        const GROW = 1 << 0;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AssocFlags: u8 {
        const WIRED = 1 << 0;
    }
}

impl AstTable {
    /// `touch(aste, mode, page, count, flags)` (§4.3). Returns the frames
    /// now installed at `[page, page + n)`, where `n <= count` may be
    /// shorter if the run was clipped to the segment boundary or stopped
    /// early by an IN_TRANSITION/WIRED boundary.
    pub fn touch(
        &self,
        collab: &dyn Collaborators,
        id: AsteId,
        mode: TouchMode,
        page: usize,
        count: usize,
        flags: TouchFlags,
        volume: u32,
    ) -> PagingResult<Vec<FrameId>> {
        let (remote, aote) = self.with_state(|st| {
            let a = &st.astes[id.index()];
            (a.flags.contains(AsteFlags::REMOTE), a.aote)
        });

        // Step 1 (§4.3, `touch.c:54-59`): the concurrency token check is
        // skipped entirely for remote objects, same as the original.
        if !remote {
            let token = self.with_state(|st| st.aotes[aote.index()].concurrency_token);
            let requested = mode.as_token();
            if token != 0 && token != requested && token != 1 {
                return Err(PagingError::ReadConcurrencyViolation);
            }
        }

        self.with_state(|st| st.astes[id.index()].flags.insert(AsteFlags::BUSY));
        self.with_state(|st| st.aotes[aote.index()].flags.insert(AoteFlags::BUSY));

        let count = count.min(PAGES_PER_SEGMENT - page);

        self.pmap.wait_for_page_transition(id, page);

        // Step 5: already-installed run.
        let mut installed_run = Vec::new();
        for p in page..page + count {
            let slot = self.pmap.slot(id, p);
            if slot.is_in_transition() || !slot.is_in_use() || slot.is_wired() {
                break;
            }
            installed_run.push(FrameId::new(slot.frame_number()));
        }
        if !installed_run.is_empty() {
            self.mmap.reclaim(&installed_run, false);
            self.with_state(|st| st.astes[id.index()].flags.remove(AsteFlags::BUSY));
            return Ok(installed_run);
        }

        let slot0 = self.pmap.slot(id, page);
        let result = if slot0.is_cow() {
            self.touch_cow(collab, id, aote, page, count)
        } else {
            self.touch_normal(collab, id, aote, page, count, flags, remote, volume)
        };

        self.with_state(|st| st.astes[id.index()].flags.remove(AsteFlags::BUSY));
        result
    }

    fn touch_cow(
        &self,
        collab: &dyn Collaborators,
        id: AsteId,
        aote: crate::ids::AoteId,
        page: usize,
        count: usize,
    ) -> PagingResult<Vec<FrameId>> {
        let per_boot = self.with_state(|st| st.aotes[aote.index()].flags.contains(AoteFlags::PER_BOOT));
        if per_boot {
            return Err(PagingError::FileReadOnly);
        }

        let mut run_len = 0;
        while run_len < count && self.pmap.slot(id, page + run_len).is_cow() {
            run_len += 1;
        }
        self.pmap.set_transition_bits(id, page, page + run_len);

        let frames = match self.mmap.alloc_pure(run_len, None) {
            Ok(f) => f,
            Err(e) => {
                self.pmap.clear_transition_bits(id, page, page + run_len);
                return Err(e);
            }
        };

        for (i, &frame) in frames.iter().enumerate() {
            self.pmap
                .pmap_assoc(&self.mmap, collab, id, page + i, frame, false)?;
        }
        self.pmap.clear_transition_bits(id, page, page + run_len);
        self.mmap.install_list(&frames, false);
        self.with_state(|st| st.astes[id.index()].flags.insert(AsteFlags::DIRTY | AsteFlags::TOUCHED));
        Ok(frames)
    }

    #[allow(clippy::too_many_arguments)]
    fn touch_normal(
        &self,
        collab: &dyn Collaborators,
        id: AsteId,
        aote: crate::ids::AoteId,
        page: usize,
        count: usize,
        flags: TouchFlags,
        remote: bool,
        volume: u32,
    ) -> PagingResult<Vec<FrameId>> {
        if remote {
            return self.touch_remote(collab, id, aote, page, count);
        }

        // Clip the run to existing disk-backed slots unless GROW is set,
        // in which case we're allowed to extend past the first
        // not-yet-backed slot up to the read-ahead cap.
        let mut run_len = 0;
        while run_len < count {
            let slot = self.pmap.slot(id, page + run_len);
            if slot.is_in_use() || slot.is_in_transition() {
                break;
            }
            if slot.disk_address() == 0 {
                if !flags.contains(TouchFlags::GROW) {
                    if run_len == 0 {
                        return Err(PagingError::Eof);
                    }
                    break;
                }
                if run_len >= self.config.grow_read_ahead_pages {
                    break;
                }
            }
            run_len += 1;
        }
        if run_len == 0 {
            return Err(PagingError::Eof);
        }

        if flags.contains(TouchFlags::GROW) {
            for i in 0..run_len {
                if self.pmap.slot(id, page + i).disk_address() == 0 {
                    let hint = self.pmap.slot(id, page + i.saturating_sub(1).max(0)).disk_address();
                    crate::fault::setup_page_read(
                        collab, &self.pmap, id, volume, page + i, 1, false, hint,
                    )?;
                }
            }
            let now = self.tick();
            self.with_state(|st| {
                let a = &mut st.aotes[aote.index()];
                a.flags.insert(AoteFlags::SIZE_HINT_DIRTY);
                a.dtu = now;
            });
        }

        self.pmap.set_transition_bits(id, page, page + run_len);

        let frames = match crate::fault::read_area_pages(
            collab, &self.mmap, &self.pmap, id, volume, page, run_len,
        ) {
            Ok(f) => f,
            Err(e) => {
                self.pmap.clear_transition_bits(id, page, page + run_len);
                return Err(e);
            }
        };

        self.pmap
            .clear_transition_bits(id, page + frames.len(), page + run_len);

        for (i, &frame) in frames.iter().enumerate() {
            let p = page + i;
            if !self.pmap.slot(id, p).is_in_use() {
                self.pmap.pmap_assoc(&self.mmap, collab, id, p, frame, false)?;
            }
        }
        self.mmap.install_list(&frames, false);
        self.with_state(|st| st.astes[id.index()].flags.insert(AsteFlags::TOUCHED));
        Ok(frames)
    }

    /// Remote half of `touch`'s fetch step (§4.5 `read_area_pages_network`).
    /// Kept separate from `touch_normal`'s local path because the two share
    /// almost none of their post-fetch handling: a remote reply carries its
    /// own DTM/clock/EOF-extension metadata and may signal "zero-fill and
    /// mark COW" via `first_page_nul` instead of handing back real content
    /// (§9 Open Question 4), neither of which the local disk path has an
    /// analog for.
    fn touch_remote(
        &self,
        collab: &dyn Collaborators,
        id: AsteId,
        aote: crate::ids::AoteId,
        page: usize,
        count: usize,
    ) -> PagingResult<Vec<FrameId>> {
        let (node, uid) = self.with_state(|st| {
            let a = &st.aotes[aote.index()];
            match a.location {
                crate::external::ObjectLocation::Remote { node } => (node, a.uid),
                crate::external::ObjectLocation::Local { .. } => {
                    unreachable!("touch_remote called on a local AOTE")
                }
            }
        });

        self.pmap.set_transition_bits(id, page, page + count);
        let net_info = match collab.network_get_net(node) {
            Ok(n) => n,
            Err(e) => {
                self.pmap.clear_transition_bits(id, page, page + count);
                return Err(e);
            }
        };

        let (frames, result) =
            match crate::fault::read_area_pages_network(collab, &self.mmap, uid, net_info, count, false) {
                Ok(v) => v,
                Err(e) => {
                    self.pmap.clear_transition_bits(id, page, page + count);
                    return Err(e);
                }
            };

        if !result.first_page_nul && frames.is_empty() {
            self.pmap.clear_transition_bits(id, page, page + count);
            return Err(PagingError::Eof);
        }

        self.pmap
            .clear_transition_bits(id, page + frames.len(), page + count);

        if result.first_page_nul {
            // All-or-nothing zero-fill: the server had nothing to serve, so
            // every allocated frame becomes a fresh COW page instead of
            // installed content.
            for (i, &frame) in frames.iter().enumerate() {
                let p = page + i;
                self.pmap.set_disk_address(id, p, 0, true);
                collab.frame_zero(frame.0);
                self.pmap.pmap_assoc(&self.mmap, collab, id, p, frame, false)?;
            }
            self.mmap.install_list(&frames, false);
            self.with_state(|st| {
                st.astes[id.index()].flags.insert(AsteFlags::DIRTY | AsteFlags::TOUCHED)
            });
        } else {
            for (i, &frame) in frames.iter().enumerate() {
                let p = page + i;
                if !self.pmap.slot(id, p).is_in_use() {
                    self.pmap.pmap_assoc(&self.mmap, collab, id, p, frame, false)?;
                }
            }
            self.mmap.install_list(&frames, false);
            self.with_state(|st| st.astes[id.index()].flags.insert(AsteFlags::TOUCHED));
        }

        // Apply the server's DTM, falling back to its reported clock value
        // when it didn't supply one (§4.5).
        let dtm = result.dtm.unwrap_or(result.clock);
        self.with_state(|st| st.aotes[aote.index()].dtm = dtm);

        if result.extended_eof_to.is_some() {
            self.with_state(|st| {
                let a = &mut st.aotes[aote.index()];
                a.flags.insert(AoteFlags::SIZE_HINT_DIRTY);
                a.dtu = result.clock;
            });
        }

        Ok(frames)
    }

    /// `assoc(uid, seg, mode, page, flags, ppn)` (§4.3).
    pub fn assoc(
        &self,
        collab: &dyn Collaborators,
        id: AsteId,
        page: usize,
        frame: FrameId,
        assoc_flags: AssocFlags,
        volume: u32,
    ) -> PagingResult<()> {
        self.with_state(|st| st.astes[id.index()].wire_count += 1);
        let wired = assoc_flags.contains(AssocFlags::WIRED);
        let result = match self.pmap.pmap_assoc(&self.mmap, collab, id, page, frame, wired) {
            Err(PagingError::PmapBadAssoc) => {
                self.touch(collab, id, TouchMode::Exclusive, page, 1, TouchFlags::empty(), volume)?;
                self.pmap.pmap_assoc(&self.mmap, collab, id, page, frame, wired)
            }
            other => other,
        };
        self.with_state(|st| st.astes[id.index()].wire_count -= 1);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PagingConfig;
    use crate::external::ObjectLocation;
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
    fn touch_without_grow_past_eof_fails() {
        let table = small_table();
        let collab = StubCollaborators::new();
        let aote = table
            .force_activate_segment(&collab, crate::ids::Uid(1), ObjectLocation::Local { volume: 0 })
            .unwrap();
        let aste = table.lookup_or_create_aste(&collab, aote, 0);

        let err = table
            .touch(&collab, aste, TouchMode::Shared, 0, 1, TouchFlags::empty(), 0)
            .unwrap_err();
        assert!(matches!(err, PagingError::Eof));
    }

    #[test]
    fn touch_rejects_conflicting_concurrency_token() {
        let table = small_table();
        let collab = StubCollaborators::new();
        let aote = table
            .force_activate_segment(&collab, crate::ids::Uid(4), ObjectLocation::Local { volume: 0 })
            .unwrap();
        let aste = table.lookup_or_create_aste(&collab, aote, 0);
        table.with_state(|st| st.aotes[aote.index()].concurrency_token = TouchMode::Exclusive.as_token());

        let err = table
            .touch(&collab, aste, TouchMode::Shared, 0, 1, TouchFlags::GROW, 0)
            .unwrap_err();
        assert!(matches!(err, PagingError::ReadConcurrencyViolation));
    }

    #[test]
    fn touch_allows_matching_concurrency_token() {
        let table = small_table();
        let collab = StubCollaborators::new();
        let aote = table
            .force_activate_segment(&collab, crate::ids::Uid(5), ObjectLocation::Local { volume: 0 })
            .unwrap();
        let aste = table.lookup_or_create_aste(&collab, aote, 0);
        table.with_state(|st| st.aotes[aote.index()].concurrency_token = TouchMode::Exclusive.as_token());

        let frames = table
            .touch(&collab, aste, TouchMode::Exclusive, 0, 1, TouchFlags::GROW, 0)
            .unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn touch_with_grow_extends_and_installs() {
        let table = small_table();
        let collab = StubCollaborators::new();
        let aote = table
            .force_activate_segment(&collab, crate::ids::Uid(2), ObjectLocation::Local { volume: 0 })
            .unwrap();
        let aste = table.lookup_or_create_aste(&collab, aote, 0);

        let frames = table
            .touch(&collab, aste, TouchMode::Exclusive, 0, 1, TouchFlags::GROW, 0)
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert!(table.pmap.slot(aste, 0).is_in_use());
        assert!(table.with_state(|st| st.astes[aste.index()].flags.contains(AsteFlags::TOUCHED)));
    }

    #[test]
    fn touch_on_already_installed_run_just_reclaims() {
        let table = small_table();
        let collab = StubCollaborators::new();
        let aote = table
            .force_activate_segment(&collab, crate::ids::Uid(3), ObjectLocation::Local { volume: 0 })
            .unwrap();
        let aste = table.lookup_or_create_aste(&collab, aote, 0);
        let first = table
            .touch(&collab, aste, TouchMode::Exclusive, 0, 1, TouchFlags::GROW, 0)
            .unwrap();

        let second = table
            .touch(&collab, aste, TouchMode::Shared, 0, 1, TouchFlags::empty(), 0)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn touch_remote_installs_fetched_content_and_stamps_dtm() {
        let table = small_table();
        let collab = StubCollaborators::new();
        collab.set_network_dtm(Some(77));
        let aote = table
            .force_activate_segment(&collab, crate::ids::Uid(10), ObjectLocation::Remote { node: 1 })
            .unwrap();
        let aste = table.lookup_or_create_aste(&collab, aote, 0);

        let frames = table
            .touch(&collab, aste, TouchMode::Shared, 0, 3, TouchFlags::empty(), 0)
            .unwrap();
        assert_eq!(frames.len(), 3);
        for p in 0..3 {
            assert!(table.pmap.slot(aste, p).is_in_use());
            assert!(!table.pmap.slot(aste, p).is_cow());
        }
        assert_eq!(table.with_state(|st| st.aotes[aote.index()].dtm), 77);
    }

    #[test]
    fn touch_remote_zero_fill_marks_cow_and_dirty() {
        let table = small_table();
        let collab = StubCollaborators::new();
        collab.set_network_zero_fill(true);
        let aote = table
            .force_activate_segment(&collab, crate::ids::Uid(11), ObjectLocation::Remote { node: 1 })
            .unwrap();
        let aste = table.lookup_or_create_aste(&collab, aote, 0);

        let frames = table
            .touch(&collab, aste, TouchMode::Shared, 0, 2, TouchFlags::empty(), 0)
            .unwrap();
        assert_eq!(frames.len(), 2);
        for p in 0..2 {
            assert!(table.pmap.slot(aste, p).is_in_use());
            assert!(table.pmap.slot(aste, p).is_cow());
        }
        assert!(table.with_state(|st| st.astes[aste.index()].flags.contains(AsteFlags::DIRTY)));
    }

    #[test]
    fn touch_remote_zero_pages_read_fails_with_eof() {
        let table = small_table();
        let collab = StubCollaborators::new();
        collab.set_network_pages_read(Some(0));
        let aote = table
            .force_activate_segment(&collab, crate::ids::Uid(12), ObjectLocation::Remote { node: 1 })
            .unwrap();
        let aste = table.lookup_or_create_aste(&collab, aote, 0);

        let err = table
            .touch(&collab, aste, TouchMode::Shared, 0, 1, TouchFlags::empty(), 0)
            .unwrap_err();
        assert!(matches!(err, PagingError::Eof));
    }
}
