//! A minimal in-memory [`Collaborators`] stub for this crate's own unit
//! tests. Not exported: integration tests in `tests/` build their own copy
//! (`tests/common/mod.rs`) against the public API surface only, since this
//! module is `#[cfg(test)]`-gated and invisible outside the crate.

#![cfg(test)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::{PagingError, PagingResult};
use crate::external::{
    AbortReason, AttrBuffer, Collaborators, DiskAddress, NetInfo, NetworkReadResult, ReadOutcome,
    VtocHandle, ATTR_BUFFER_LEN,
};
use crate::ids::Uid;

/// A `Collaborators` stub that always succeeds, backed by plain `HashMap`s
/// instead of real disk/network/MMU state. Good enough to drive the core's
/// own control flow in unit tests; scenario-specific failure injection is
/// done by constructing one and then calling the `fail_*` setters before
/// exercising the core.
pub(crate) struct StubCollaborators {
    next_addr: AtomicU32,
    vtoc_handles: Mutex<HashMap<u64, VtocHandle>>,
    attrs: Mutex<HashMap<u64, AttrBuffer>>,
    fm_images: Mutex<HashMap<(u64, u32), [u32; 32]>>,
    not_found: Mutex<Vec<u64>>,
    write_protected: Mutex<bool>,
    network_zero_fill: Mutex<bool>,
    network_pages_read: Mutex<Option<usize>>,
    network_dtm: Mutex<Option<u64>>,
    network_clock: Mutex<u64>,
    network_extended_eof: Mutex<Option<u64>>,
}

impl StubCollaborators {
    pub(crate) fn new() -> Self {
        Self {
            next_addr: AtomicU32::new(100),
            vtoc_handles: Mutex::new(HashMap::new()),
            attrs: Mutex::new(HashMap::new()),
            fm_images: Mutex::new(HashMap::new()),
            not_found: Mutex::new(Vec::new()),
            write_protected: Mutex::new(false),
            network_zero_fill: Mutex::new(false),
            network_pages_read: Mutex::new(None),
            network_dtm: Mutex::new(None),
            network_clock: Mutex::new(0),
            network_extended_eof: Mutex::new(None),
        }
    }

    pub(crate) fn mark_not_found(&self, uid: Uid) {
        self.not_found.lock().unwrap().push(uid.0);
    }

    pub(crate) fn set_write_protected(&self, protected: bool) {
        *self.write_protected.lock().unwrap() = protected;
    }

    /// Make the next `network_read_ahead` calls report a NUL first page
    /// (§4.5, §9 Open Question 4: zero-fill + COW the whole requested run).
    pub(crate) fn set_network_zero_fill(&self, zero_fill: bool) {
        *self.network_zero_fill.lock().unwrap() = zero_fill;
    }

    /// Cap how many pages `network_read_ahead` reports as transferred,
    /// regardless of how many were requested (simulates a short/EOF read).
    pub(crate) fn set_network_pages_read(&self, pages: Option<usize>) {
        *self.network_pages_read.lock().unwrap() = pages;
    }

    pub(crate) fn set_network_dtm(&self, dtm: Option<u64>) {
        *self.network_dtm.lock().unwrap() = dtm;
    }

    pub(crate) fn set_network_clock(&self, clock: u64) {
        *self.network_clock.lock().unwrap() = clock;
    }

    pub(crate) fn set_network_extended_eof(&self, extended_to: Option<u64>) {
        *self.network_extended_eof.lock().unwrap() = extended_to;
    }
}

impl Collaborators for StubCollaborators {
    fn mmu_install(&self, _frame: u32, _va: u64, _writable: bool) -> PagingResult<()> {
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

    fn fm_read(&self, handle: VtocHandle, fm_ptr: u64, seg: u32) -> PagingResult<[u32; 32]> {
        let _ = fm_ptr;
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
        handle: VtocHandle,
        _fm_ptr: u64,
        seg: u32,
        image: &[u32; 32],
    ) -> PagingResult<()> {
        if *self.write_protected.lock().unwrap() {
            return Err(PagingError::DiskWriteProtected);
        }
        self.fm_images.lock().unwrap().insert((handle.0, seg), *image);
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
        let pages_read = self
            .network_pages_read
            .lock()
            .unwrap()
            .unwrap_or(count)
            .min(count);
        Ok(NetworkReadResult {
            pages_read,
            first_page_nul: *self.network_zero_fill.lock().unwrap(),
            dtm: *self.network_dtm.lock().unwrap(),
            clock: *self.network_clock.lock().unwrap(),
            acl: 0,
            extended_eof_to: *self.network_extended_eof.lock().unwrap(),
        })
    }

    fn abort(&self, reason: AbortReason) -> ! {
        panic!("paging core aborted: {:?}", reason);
    }
}
