//! Collaborator contracts (§6).
//!
//! Everything in this module is a *boundary*: VTOC/FM/BAT access, disk
//! queue-block IO, the remote-object network path, MMU installation, and
//! lock/event-count primitives are explicitly out of scope (§1) and treated
//! as foreign. The paging core only depends on the trait in this module;
//! a host crate supplies a concrete [`Collaborators`] implementation backed
//! by whatever disk/network/MMU stack it actually has.
//!
//! The event-count half of the old `ec_init`/`ec_advance`/`ec_wait`
//! contract is *not* modeled here: [`crate::event_count::EventCount`] is
//! owned directly by the core (see that module's docs for why). Likewise
//! `ml_lock`/`ml_unlock` become ordinary [`std::sync::Mutex`] guards taken
//! by the core itself (§9, "shared mutable table with short critical
//! sections"); only genuinely external state crosses this trait.

use crate::error::PagingResult;
use crate::ids::Uid;

/// Length in bytes of the cached VTOCE attribute payload carried by an
/// AOTE (§3) and round-tripped by `purify_aote` (§4.4).
pub const ATTR_BUFFER_LEN: usize = 144;

/// A copy of an object's VTOCE-shaped attribute payload.
pub type AttrBuffer = [u8; ATTR_BUFFER_LEN];

/// Local volume index or remote node identifier, as stored on an AOTE
/// (§3, "a volume descriptor (local volume index *or* remote node
/// identifier + network-state handle)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectLocation {
    Local { volume: u32 },
    Remote { node: u32 },
}

/// Opaque handle to established network state for a remote object, as
/// returned by `network_get_net`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetInfo(pub u64);

/// A disk address as stored in a segment-map slot or on-disk FM record
/// (21..0 bits per §4.2; we keep the full 32 bits as the in-memory type
/// and mask at the serialization boundary).
pub type DiskAddress = u32;

/// Outcome of `disk_read_multi` / `network_read_ahead`: how many of the
/// requested pages were actually transferred, in prefix order starting at
/// the first requested page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOutcome {
    pub pages_read: usize,
}

/// Result of a `network_read_ahead` call (§4.5): pages transferred plus the
/// metadata the remote side piggybacks on a successful read.
#[derive(Debug, Clone)]
pub struct NetworkReadResult {
    pub pages_read: usize,
    /// `true` if the first returned buffer was NUL, signaling the fault
    /// engine should zero-fill and mark the pages COW instead of
    /// installing transferred content.
    pub first_page_nul: bool,
    pub dtm: Option<u64>,
    pub clock: u64,
    pub acl: u32,
    /// Set if the read extended the object past its previously cached
    /// size, so the fault engine can update the cached size and DTU stamp.
    pub extended_eof_to: Option<u64>,
}

/// VTOC lookup result: enough to drive `vtoce_read`/`vtoce_write`.
#[derive(Debug, Clone, Copy)]
pub struct VtocHandle(pub u64);

/// A reason the system must crash (§7 tier 3/4): resource exhaustion or an
/// invariant violation. The core never attempts recovery from these; it
/// calls [`Collaborators::abort`], which does not return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    AsteTableExhausted,
    AoteTableExhausted,
    FrameTableExhausted,
    PmapInvariantViolation,
    DoubleInstall,
    CorruptedWsl,
    IllegalWslIndex,
}

/// The full set of external collaborators the paging core depends on.
///
/// All methods that can fail return a [`PagingResult`]; the variant
/// [`crate::error::PagingError::Collaborator`] is the generic escape hatch
/// for failures that don't map to one of the core's own named error
/// conditions (matching §7 tier 5's "OR the high status byte").
pub trait Collaborators: Send + Sync {
    // -- MMU -----------------------------------------------------------
    fn mmu_install(&self, frame: u32, va: u64, writable: bool) -> PagingResult<()>;
    fn mmu_remove(&self, frame: u32);
    fn mmu_vtop(&self, va: u64) -> Option<u32>;
    /// Zero-fill a frame's backing storage. Used by the `page_zero` public
    /// entry point (§6) and by COW faults that need a clean page with no
    /// disk content to read (§4.3 step 6). The core tracks *that* a frame
    /// needs zeroing; actually touching physical memory is the MMU
    /// collaborator's concern.
    fn frame_zero(&self, frame: u32);

    // -- BAT (block allocation table) -----------------------------------
    fn bat_reserve(&self, volume: u32, count: usize) -> PagingResult<()>;
    fn bat_allocate(
        &self,
        volume: u32,
        hint: DiskAddress,
        count: usize,
    ) -> PagingResult<Vec<DiskAddress>>;
    fn bat_free(&self, addrs: &[DiskAddress], flags: u32) -> PagingResult<()>;

    // -- VTOC / VTOCE ----------------------------------------------------
    fn vtoc_lookup(&self, uid: Uid) -> PagingResult<VtocHandle>;
    fn vtoce_read(&self, handle: VtocHandle) -> PagingResult<AttrBuffer>;
    fn vtoce_write(&self, handle: VtocHandle, attrs: &AttrBuffer) -> PagingResult<()>;
    fn vtoce_lookup_fm(&self, handle: VtocHandle, seg: u32) -> PagingResult<(u64, u32)>;

    // -- File map ---------------------------------------------------------
    fn fm_read(&self, handle: VtocHandle, fm_ptr: u64, seg: u32) -> PagingResult<[u32; 32]>;
    fn fm_write(
        &self,
        handle: VtocHandle,
        fm_ptr: u64,
        seg: u32,
        image: &[u32; 32],
    ) -> PagingResult<()>;

    // -- Disk queue-block IO ----------------------------------------------
    /// Read `count` pages starting at `disk_addrs[0]` into `frames[0..]`
    /// (parallel arrays), returning how many were actually read. The
    /// queue-block chain itself (`disk_get_qblks`/`disk_rtn_qblks`) is an
    /// implementation detail of the collaborator; the core only needs the
    /// request/response shape.
    fn disk_read_multi(
        &self,
        volume: u32,
        disk_addrs: &[DiskAddress],
        frames: &[u32],
    ) -> PagingResult<ReadOutcome>;

    // -- Network object path ----------------------------------------------
    fn network_get_net(&self, node: u32) -> PagingResult<NetInfo>;
    fn network_ast_get_info(&self, net: NetInfo, uid: Uid) -> PagingResult<AttrBuffer>;
    #[allow(clippy::too_many_arguments)]
    fn network_read_ahead(
        &self,
        net: NetInfo,
        uid: Uid,
        frames: &[u32],
        count: usize,
        no_read_ahead: bool,
    ) -> PagingResult<NetworkReadResult>;

    // -- Fatal sink --------------------------------------------------------
    /// Abort the system. Never returns. Production implementations panic
    /// or halt; tests substitute a panicking stub per §9.
    fn abort(&self, reason: AbortReason) -> !;
}
