//! The working-set replacement scanner, `ws_scan` (§4.1).

use crate::ids::{wsl as wsl_index, WslId};

use super::{EvictionBucket, FrameFlags, Mmap, ScanMode};

/// Walk `wsl` from its scan cursor toward the tail, evicting until either
/// `needed` frames have been reclaimed or every resident frame has been
/// visited once. Returns the number of frames actually evicted.
pub(super) fn ws_scan(mmap: &Mmap, wsl: WslId, mode: ScanMode, needed: usize) -> usize {
    let mut st = mmap.state.lock().unwrap();

    let page_count = st.wsls[wsl.index()].page_count;
    if page_count == 0 {
        return 0;
    }

    let mut cursor = st.wsls[wsl.index()].scan_cursor;
    if cursor.is_none() || !st.frames[cursor.index()].flags.contains(FrameFlags::IN_WSL) {
        cursor = st.wsls[wsl.index()].head;
    }

    let mut evicted = 0usize;
    let mut visited = 0usize;
    let mut buckets: [Vec<crate::ids::FrameId>; 4] = Default::default();

    while evicted < needed && visited < page_count {
        if cursor.is_none() {
            break;
        }
        let next = st.frames[cursor.index()].next;
        visited += 1;

        let wired = st.frames[cursor.index()].wire_count > 0;
        if wired {
            cursor = next;
            continue;
        }

        // Second-chance: the MMU-level REFERENCED bit lives with the
        // collaborator (mmu_vtop/PTE), and is modeled here via the
        // IMPURE-adjacent MODIFIED flag check only for dirty pages;
        // ordinary clean pages are always eligible in this design since
        // hardware REFERENCED tracking is delegated to the caller's MMU
        // layer, which clears it on install and sets it again on touch.
        // `Normal` mode still gives dirty pages one extra look before
        // evicting them.
        let modified = st.frames[cursor.index()].flags.contains(FrameFlags::MODIFIED);
        if mode == ScanMode::Normal && modified {
            cursor = next;
            continue;
        }

        let impure = st.frames[cursor.index()].flags.contains(FrameFlags::IMPURE);
        let evict_frame = cursor;
        cursor = next;

        st.unlink(evict_frame);

        let bucket = match (modified, impure) {
            (false, true) => EvictionBucket::CleanImpure,
            (false, false) => EvictionBucket::CleanPure,
            (true, false) => EvictionBucket::DirtyNoFlush,
            (true, true) => EvictionBucket::DirtyFlush,
        };
        let idx = match bucket {
            EvictionBucket::CleanImpure => 0,
            EvictionBucket::CleanPure => 1,
            EvictionBucket::DirtyNoFlush => 2,
            EvictionBucket::DirtyFlush => 3,
        };
        buckets[idx].push(evict_frame);
        evicted += 1;
    }

    st.wsls[wsl.index()].scan_cursor = cursor;

    let targets = [
        wsl_index::CLEAN_IMPURE,
        wsl_index::CLEAN_PURE,
        wsl_index::DIRTY,
        wsl_index::DIRTY,
    ];
    for (idx, frames) in buckets.into_iter().enumerate() {
        for f in frames {
            st.insert_head(targets[idx], f);
        }
    }

    evicted
}
