//! Fault-read paths: `read_area_pages`, `read_area_pages_network`,
//! `setup_page_read` (§4.5).
//!
//! These are the long-latency I/O subroutines `touch` dispatches to once
//! it has decided a run of pages needs fetching. They're free functions
//! rather than methods on [`crate::ast::AstTable`] because they only need
//! the frame/segment-map primitives, not the AOTE/ASTE bookkeeping tables
//! — keeping them decoupled makes it easy to unit test the read-then-
//! install sequencing on its own.

use crate::error::PagingResult;
use crate::external::{Collaborators, DiskAddress};
use crate::ids::{AsteId, FrameId};
use crate::mmap::Mmap;
use crate::pmap::Pmap;

/// `setup_page_read` (§4.5): reserve disk backing for a run of pages that
/// don't have one yet, ahead of a read (or as preparation for a future
/// write, in the `bat_allocate` contiguous case).
pub fn setup_page_read(
    collab: &dyn Collaborators,
    pmap: &Pmap,
    aste: AsteId,
    volume: u32,
    start: usize,
    count: usize,
    area: bool,
    hint: DiskAddress,
) -> PagingResult<()> {
    let addrs = if area {
        collab.bat_allocate(volume, hint, count)?
    } else {
        collab.bat_reserve(volume, count)?;
        // Reservation alone doesn't hand back addresses for a scattered
        // (non-area) allocation; a real collaborator would hand back
        // per-page addresses from its own free-block cursor. We ask for
        // a best-effort contiguous run from the same hint for symmetry;
        // a production BAT implementation may return non-contiguous
        // addresses here instead.
        collab.bat_allocate(volume, hint, count)?
    };
    for (i, addr) in addrs.into_iter().enumerate() {
        pmap.set_disk_address(aste, start + i, addr, true);
    }
    Ok(())
}

/// `read_area_pages(aste, segmap, ppns, start, count)` (§4.5, local path).
pub fn read_area_pages(
    collab: &dyn Collaborators,
    mmap: &Mmap,
    pmap: &Pmap,
    aste: AsteId,
    volume: u32,
    start: usize,
    count: usize,
) -> PagingResult<Vec<FrameId>> {
    let frames = mmap.alloc_pure(count, None)?;
    let addrs: Vec<DiskAddress> = (0..count)
        .map(|i| pmap.slot(aste, start + i).disk_address())
        .collect();
    let frame_nums: Vec<u32> = frames.iter().map(|f| f.0).collect();

    let outcome = match collab.disk_read_multi(volume, &addrs, &frame_nums) {
        Ok(o) => o,
        Err(e) => {
            mmap.free_list(&frames);
            return Err(e);
        }
    };

    if outcome.pages_read < frames.len() {
        mmap.free_list(&frames[outcome.pages_read..]);
    }
    Ok(frames[..outcome.pages_read].to_vec())
}

/// `read_area_pages_network(aste, segmap, ppns, start, count, flags)`
/// (§4.5, remote path). Returns the frames actually backing the fetch
/// alongside the full result metadata (DTM/clock/ACL/EOF extension) so the
/// caller can finish installing them without re-deriving frame numbers from
/// segment-map state that hasn't been updated yet.
///
/// A `first_page_nul` result is treated as all-or-nothing (§9 Open Question
/// 4): every frame allocated for the request is handed back for the caller
/// to zero-fill and mark COW, none are released early.
pub fn read_area_pages_network(
    collab: &dyn Collaborators,
    mmap: &Mmap,
    uid: crate::ids::Uid,
    net: crate::external::NetInfo,
    count: usize,
    no_read_ahead: bool,
) -> PagingResult<(Vec<FrameId>, crate::external::NetworkReadResult)> {
    let frames = mmap.alloc_pure(count, None)?;
    let frame_nums: Vec<u32> = frames.iter().map(|f| f.0).collect();

    match collab.network_read_ahead(net, uid, &frame_nums, count, no_read_ahead) {
        Ok(result) => {
            if result.first_page_nul {
                return Ok((frames, result));
            }
            if result.pages_read < frames.len() {
                mmap.free_list(&frames[result.pages_read..]);
            }
            let kept = frames[..result.pages_read].to_vec();
            Ok((kept, result))
        }
        Err(e) => {
            mmap.free_list(&frames);
            Err(e)
        }
    }
}
