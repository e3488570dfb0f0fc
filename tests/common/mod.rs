//! Shared integration-test helpers: a `Collaborators` mock built purely
//! against paging_core's public API, plus a couple of scenario-setup
//! shortcuts used by more than one test file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use paging_core::external::{
    AbortReason, AttrBuffer, Collaborators, DiskAddress, NetInfo, NetworkReadResult, ReadOutcome,
    VtocHandle, ATTR_BUFFER_LEN,
};
use paging_core::ids::Uid;
use paging_core::PagingResult;
use paging_core::error::PagingError;

/// An in-memory `Collaborators` implementation standing in for disk,
/// network, MMU, BAT, and VTOC. Every method succeeds by default; call the
/// `fail_*`/`mark_*` setters beforehand to steer a specific scenario (e.g.
/// a write-protected volume, or an object VTOC lookup can't resolve).
pub struct TestCollaborators {
    next_addr: AtomicU32,
    vtoc_handles: Mutex<HashMap<u64, VtocHandle>>,
    attrs: Mutex<HashMap<u64, AttrBuffer>>,
    not_found: Mutex<Vec<u64>>,
    write_protected: Mutex<bool>,
    mmu_installs: Mutex<Vec<(u32, u64, bool)>>,
    fm_images: Mutex<HashMap<(u64, u32), [u32; 32]>>,
}

impl TestCollaborators {
    pub fn new() -> Self {
        Self {
            next_addr: AtomicU32::new(1000),
            vtoc_handles: Mutex::new(HashMap::new()),
            attrs: Mutex::new(HashMap::new()),
            not_found: Mutex::new(Vec::new()),
            write_protected: Mutex::new(false),
            mmu_installs: Mutex::new(Vec::new()),
            fm_images: Mutex::new(HashMap::new()),
        }
    }

    pub fn mark_not_found(&self, uid: Uid) {
        self.not_found.lock().unwrap().push(uid.0);
    }

    /// Seed the on-disk file-map image `fm_read` returns for `uid`'s
    /// segment `seg`, so a scenario can drive a cold fault against
    /// pre-existing disk addresses instead of an empty (all-zero) file.
    pub fn seed_fm(&self, uid: Uid, seg: u32, image: [u32; 32]) {
        let handle = self.vtoc_lookup(uid).expect("seed_fm: vtoc_lookup");
        self.fm_images.lock().unwrap().insert((handle.0, seg), image);
    }

    pub fn set_write_protected(&self, protected: bool) {
        *self.write_protected.lock().unwrap() = protected;
    }

    pub fn mmu_install_count(&self) -> usize {
        self.mmu_installs.lock().unwrap().len()
    }
}

impl Default for TestCollaborators {
    fn default() -> Self {
        Self::new()
    }
}

impl Collaborators for TestCollaborators {
    fn mmu_install(&self, frame: u32, va: u64, writable: bool) -> PagingResult<()> {
        self.mmu_installs.lock().unwrap().push((frame, va, writable));
        Ok(())
    }

    fn mmu_remove(&self, _frame: u32) {}

    fn mmu_vtop(&self, _va: u64) -> Option<u32> {
        None
    }

    fn frame_zero(&self, _frame: u32) {}

    fn bat_reserve(&self, _volume: u32, _count: usize) -> PagingResult<()> {
        Ok(())
    }

    fn bat_allocate(
        &self,
        _volume: u32,
        _hint: DiskAddress,
        count: usize,
    ) -> PagingResult<Vec<DiskAddress>> {
        let base = self.next_addr.fetch_add(count as u32, Ordering::Relaxed);
        Ok((0..count as u32).map(|i| base + i).collect())
    }

    fn bat_free(&self, _addrs: &[DiskAddress], _flags: u32) -> PagingResult<()> {
        Ok(())
    }

    fn vtoc_lookup(&self, uid: Uid) -> PagingResult<VtocHandle> {
        if self.not_found.lock().unwrap().contains(&uid.0) {
            return Err(PagingError::FileObjectNotFound { uid: uid.0 });
        }
        let mut handles = self.vtoc_handles.lock().unwrap();
        let next = handles.len() as u64 + 1;
        let handle = *handles.entry(uid.0).or_insert(VtocHandle(next));
        Ok(handle)
    }

    fn vtoce_read(&self, handle: VtocHandle) -> PagingResult<AttrBuffer> {
        Ok(self
            .attrs
            .lock()
            .unwrap()
            .get(&handle.0)
            .copied()
            .unwrap_or([0u8; ATTR_BUFFER_LEN]))
    }

    fn vtoce_write(&self, handle: VtocHandle, attrs: &AttrBuffer) -> PagingResult<()> {
        if *self.write_protected.lock().unwrap() {
            return Err(PagingError::DiskWriteProtected);
        }
        self.attrs.lock().unwrap().insert(handle.0, *attrs);
        Ok(())
    }

    fn vtoce_lookup_fm(&self, handle: VtocHandle, seg: u32) -> PagingResult<(u64, u32)> {
        Ok((handle.0 * 1000 + seg as u64, 0))
    }

    fn fm_read(&self, handle: VtocHandle, _fm_ptr: u64, seg: u32) -> PagingResult<[u32; 32]> {
        Ok(self
            .fm_images
            .lock()
            .unwrap()
            .get(&(handle.0, seg))
            .copied()
            .unwrap_or([0u32; 32]))
    }

    fn fm_write(
        &self,
        _handle: VtocHandle,
        _fm_ptr: u64,
        _seg: u32,
        _image: &[u32; 32],
    ) -> PagingResult<()> {
        if *self.write_protected.lock().unwrap() {
            return Err(PagingError::DiskWriteProtected);
        }
        Ok(())
    }

    fn disk_read_multi(
        &self,
        _volume: u32,
        disk_addrs: &[DiskAddress],
        _frames: &[u32],
    ) -> PagingResult<ReadOutcome> {
        Ok(ReadOutcome {
            pages_read: disk_addrs.len(),
        })
    }

    fn network_get_net(&self, node: u32) -> PagingResult<NetInfo> {
        Ok(NetInfo(node as u64))
    }

    fn network_ast_get_info(&self, _net: NetInfo, _uid: Uid) -> PagingResult<AttrBuffer> {
        Ok([0u8; ATTR_BUFFER_LEN])
    }

    fn network_read_ahead(
        &self,
        _net: NetInfo,
        _uid: Uid,
        _frames: &[u32],
        count: usize,
        _no_read_ahead: bool,
    ) -> PagingResult<NetworkReadResult> {
        Ok(NetworkReadResult {
            pages_read: count,
            first_page_nul: false,
            dtm: None,
            clock: 0,
            acl: 0,
            extended_eof_to: None,
        })
    }

    fn abort(&self, reason: AbortReason) -> ! {
        panic!("paging core aborted: {:?}", reason);
    }
}

/// A small config good enough to drive scenario tests without allocating
/// the production-sized defaults.
pub fn small_config() -> paging_core::config::PagingConfig {
    paging_core::config::PagingConfig {
        aste_scan_candidates: 4,
        aote_scan_candidates: 4,
        max_aste: 16,
        max_aote: 16,
        max_frames: 32,
        grow_read_ahead_pages: 4,
        update_aste_cap: 8,
        update_aote_cap: 8,
        free_pages_batch: 8,
        process_wsl_hint: 4,
        ws_scan_batch: 8,
    }
}
