//! [`PagingCore`]: wires AOT/AST/PMAP/MMAP together behind the external
//! interface named in §6.
//!
//! This is the crate's single entry point. A host constructs one
//! `PagingCore` per paging domain (§GLOSSARY defines "the paging core" as
//! this whole subsystem), handing it a [`Collaborators`] implementation and
//! a [`PagingConfig`]; everything else — locking order, eviction, the
//! periodic sweep — lives behind the methods below.

use std::sync::Arc;

use crate::ast::{AssocFlags, AstTable, DeactivateFlags, TouchFlags, TouchMode, UpdateReport};
use crate::config::PagingConfig;
use crate::error::{PagingError, PagingResult};
use crate::external::{AttrBuffer, Collaborators, ObjectLocation};
use crate::ids::{AoteId, AsteId, FrameId, Uid};
use crate::mmap::{Mmap, ScanMode};
use crate::pmap::Pmap;
use crate::PAGES_PER_SEGMENT;

/// The paging core: one AST (which owns the AOT too, §5), one PMAP, one
/// MMAP, and the collaborator set they were built against.
pub struct PagingCore {
    ast: AstTable,
    mmap: Arc<Mmap>,
    pmap: Arc<Pmap>,
    collab: Arc<dyn Collaborators>,
    config: PagingConfig,
}

impl PagingCore {
    /// `ast_init`/system bootstrap (§6): build the tables fresh from
    /// `config`, with every frame on the free list and every
    /// ASTE/AOTE slot on its respective free list.
    pub fn new(config: PagingConfig, collab: Arc<dyn Collaborators>) -> Self {
        let mmap = Arc::new(Mmap::new(config.max_frames, config.process_wsl_hint));
        let pmap = Arc::new(Pmap::new(config.max_aste));
        let ast = AstTable::new(config, Arc::clone(&pmap), Arc::clone(&mmap));
        Self {
            ast,
            mmap,
            pmap,
            collab,
            config,
        }
    }

    fn collab(&self) -> &dyn Collaborators {
        self.collab.as_ref()
    }

    // -- Object/segment activation ----------------------------------------

    /// `activate_and_wire(uid, location, segment)` (§6): the fault path's
    /// entry point. Activates the object if necessary, finds or creates
    /// the segment's ASTE, and wires it so it cannot be evicted out from
    /// under the caller before `release_pages` drops the pin.
    pub fn activate_and_wire(
        &self,
        uid: Uid,
        location: ObjectLocation,
        segment: u32,
    ) -> PagingResult<AsteId> {
        let aote = self.ast.force_activate_segment(self.collab(), uid, location)?;
        self.ast.with_state(|st| st.aotes[aote.index()].refcount += 1);
        let aste = self.ast.lookup_or_create_aste(self.collab(), aote, segment);
        self.ast.wire_aste(aste);
        self.ast.release_aote(aote);
        Ok(aste)
    }

    /// `mste_activate_and_wire` (§6): the MSTE-bearing variant of
    /// `activate_and_wire`. §4.4/§9 leave MSTE's internal structure out of
    /// scope (no MSTE type or its fields are defined anywhere in the spec's
    /// data model); this crate treats an MSTE handle as opaque and supplies
    /// only the wiring half the paging core actually owns. See DESIGN.md.
    pub fn mste_activate_and_wire(
        &self,
        uid: Uid,
        location: ObjectLocation,
        segment: u32,
    ) -> PagingResult<AsteId> {
        self.activate_and_wire(uid, location, segment)
    }

    /// `deactivate_segment(aste, flags)` (§4.3).
    pub fn deactivate_segment(&self, aste: AsteId, flags: DeactivateFlags) -> PagingResult<()> {
        self.ast.deactivate_segment(self.collab(), aste, flags)
    }

    /// `release_pages(aste)` (§6): drop a pin taken by `activate_and_wire`.
    pub fn release_pages(&self, aste: AsteId) {
        self.ast.release_pages(aste)
    }

    /// `locate_aste(uid, segment)` (§4.3): look up an already-resident
    /// segment without creating or activating anything.
    pub fn locate_aste(&self, uid: Uid, segment: u32) -> Option<AsteId> {
        let aote = self.ast.lookup_aote_by_uid(uid)?;
        self.ast.lookup_aste(aote, segment)
    }

    // -- Fault engine -------------------------------------------------------

    /// `touch(aste, mode, page, count, flags, volume)` (§4.3).
    #[allow(clippy::too_many_arguments)]
    pub fn touch(
        &self,
        aste: AsteId,
        mode: TouchMode,
        page: usize,
        count: usize,
        flags: TouchFlags,
        volume: u32,
    ) -> PagingResult<Vec<FrameId>> {
        self.ast.touch(self.collab(), aste, mode, page, count, flags, volume)
    }

    /// `assoc(aste, page, frame, flags, volume)` (§4.3): associate an
    /// already-resident frame with a slot, touching the segment first if
    /// the slot has no disk backing yet.
    pub fn assoc(
        &self,
        aste: AsteId,
        page: usize,
        frame: FrameId,
        flags: AssocFlags,
        volume: u32,
    ) -> PagingResult<()> {
        self.ast.assoc(self.collab(), aste, page, frame, flags, volume)
    }

    /// `assoc_area` (§4.2): identical to `assoc` at this layer — the
    /// AOTE-level concurrency check `assoc_area` skips relative to `assoc`
    /// happens one layer up, in whatever dispatches to `activate_and_wire`
    /// versus a direct area mapping; both converge on the same
    /// `pmap_assoc` call here.
    pub fn assoc_area(
        &self,
        aste: AsteId,
        page: usize,
        frame: FrameId,
        flags: AssocFlags,
        volume: u32,
    ) -> PagingResult<()> {
        self.assoc(aste, page, frame, flags, volume)
    }

    /// `pmap_assoc(aste, page, frame, wired)` (§4.2), bypassing the touch
    /// fallback `assoc` performs on a bad-backing slot.
    pub fn pmap_assoc(&self, aste: AsteId, page: usize, frame: FrameId, wired: bool) -> PagingResult<()> {
        self.pmap.pmap_assoc(&self.mmap, self.collab(), aste, page, frame, wired)
    }

    /// `invalidate_page(aste, page)` (§4.2).
    pub fn invalidate_page(&self, aste: AsteId, page: usize) {
        self.pmap.invalidate_page(&self.mmap, self.collab(), aste, page)
    }

    /// `page_zero(frame)` (§6): zero-fill a frame's backing storage,
    /// delegated to the MMU collaborator (§4.3 step 6, COW faults with no
    /// disk content to read).
    pub fn page_zero(&self, frame: FrameId) {
        self.collab().frame_zero(frame.0)
    }

    // -- Object-level range operations --------------------------------------

    /// `invalidate(uid, [start, end], flags)` (§4.6): fan a UID+page-range
    /// out across every overlapping segment's ASTE, descending by segment
    /// number to match the AOTE's list order.
    pub fn invalidate(
        &self,
        uid: Uid,
        start_page: u64,
        end_page: u64,
        with_wait: bool,
    ) -> PagingResult<()> {
        let aote = match self.ast.lookup_aote_by_uid(uid) {
            Some(a) => a,
            None => return Ok(()),
        };
        let seg_lo = (start_page / PAGES_PER_SEGMENT as u64) as u32;
        let seg_hi = (end_page.saturating_sub(1) / PAGES_PER_SEGMENT as u64) as u32;
        for segment in (seg_lo..=seg_hi).rev() {
            let aste = match self.ast.lookup_aste(aote, segment) {
                Some(a) => a,
                None => continue,
            };
            let seg_start = segment as u64 * PAGES_PER_SEGMENT as u64;
            let lo = start_page.saturating_sub(seg_start).min(PAGES_PER_SEGMENT as u64) as usize;
            let hi = end_page
                .saturating_sub(seg_start)
                .min(PAGES_PER_SEGMENT as u64) as usize;
            if lo >= hi {
                continue;
            }
            self.ast.invalidate_range(self.collab(), aste, lo, hi, with_wait)?;
        }
        Ok(())
    }

    /// `free_pages(aste, start, end, bat_flags)` (§4.6).
    pub fn free_pages(&self, aste: AsteId, start: usize, end: usize, bat_flags: u32) -> PagingResult<()> {
        self.ast.free_pages(self.collab(), aste, start, end, bat_flags)
    }

    // -- AOT bootstrap / attributes ------------------------------------------

    /// `load_aote(uid, location, attrs)` (§4.4): publish an AOTE from
    /// caller-supplied attributes without driving `vtoc_lookup`/
    /// `vtoce_read`/`network_ast_get_info` IO (bootstrap/recovery paths
    /// that already hold the attribute payload).
    pub fn load_aote(&self, uid: Uid, location: ObjectLocation, attrs: AttrBuffer) -> AoteId {
        self.ast.load_aote(self.collab(), uid, location, attrs)
    }

    /// `set_attribute_internal(aote, offset, bytes)` (§6): patch the
    /// cached VTOCE attribute buffer and mark it dirty for the next
    /// `purify_aote`. §4.4 names the attribute buffer's existence and
    /// round trip but not a field layout for individual attributes, so
    /// this writes a raw byte range — see DESIGN.md.
    pub fn set_attribute_internal(&self, aote: AoteId, offset: usize, bytes: &[u8]) -> PagingResult<()> {
        if offset + bytes.len() > crate::external::ATTR_BUFFER_LEN {
            return Err(PagingError::Collaborator {
                status: crate::error::StatusCode::AstIncompatibleRequest as u32,
            });
        }
        self.ast.with_state(|st| {
            st.aotes[aote.index()].attrs[offset..offset + bytes.len()].copy_from_slice(bytes);
            st.aotes[aote.index()].flags.insert(crate::aot::AoteFlags::DIRTY);
        });
        Ok(())
    }

    // -- Table growth / periodic sweep ---------------------------------------

    /// `add_astes(count)` (§6).
    pub fn add_astes(&self, count: usize) -> PagingResult<()> {
        self.ast.add_astes(count)
    }

    /// `add_aotes(count)` (§6).
    pub fn add_aotes(&self, count: usize) -> PagingResult<()> {
        self.ast.add_aotes(count)
    }

    /// `update()` (§4.4): the periodic timer sweep.
    pub fn update(&self) -> UpdateReport {
        self.ast.update(self.collab())
    }

    /// `ws_scan_callback` (§4.1): the periodic tick that asks MMAP to
    /// reclaim frames from one working-set list, bounded by
    /// `config.ws_scan_batch`.
    pub fn ws_scan_callback(&self, wsl: crate::ids::WslId, aggressive: bool) -> usize {
        let mode = if aggressive { ScanMode::Aggressive } else { ScanMode::Normal };
        self.mmap.ws_scan(wsl, mode, self.config.ws_scan_batch)
    }

    /// `free_asid(pid)` (§6): tear down a process's working set.
    pub fn free_asid(&self, pid: u64) {
        self.mmap.free_wsl(pid)
    }

    /// Direct accessor for hosts that need to register a process's WSL
    /// before its first fault (§4.1, per-process working sets are created
    /// out of band from the fault path itself).
    pub fn set_ws_index(&self, pid: u64, wsl: Option<crate::ids::WslId>) -> PagingResult<()> {
        self.mmap.set_ws_index(pid, wsl)
    }
}
