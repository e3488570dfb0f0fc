//! Tunable parameters.
//!
//! The original source hardcodes several scan-bound heuristics
//! (`allocate_aste`'s 12-candidate scan, `allocate_aote`'s 6-candidate scan)
//! without documenting their derivation. Open Question 1 (§9) asks that a
//! reimplementation keep them tunable rather than guess at "the right"
//! constants; [`PagingConfig`] is that knob set. Defaults match the values
//! named in §4.3/§4.4.

/// Tunable parameters for the paging core. Constructed once at
/// [`crate::PagingCore::new`] and treated as immutable afterward.
#[derive(Debug, Clone, Copy)]
pub struct PagingConfig {
    /// Number of candidates scanned from the persistent cursor in
    /// `allocate_aste`'s second pass before falling back to a full scan.
    pub aste_scan_candidates: usize,
    /// Number of candidates scanned from the persistent cursor in
    /// `allocate_aote`'s second pass before falling back to a full scan.
    pub aote_scan_candidates: usize,
    /// Maximum ASTEs in the global table.
    pub max_aste: usize,
    /// Maximum AOTEs in the global table.
    pub max_aote: usize,
    /// Maximum physical frames managed by MMAP.
    pub max_frames: usize,
    /// Read-ahead cap (in pages) applied when growing a file on a GROW
    /// fault (§4.3 step 6).
    pub grow_read_ahead_pages: usize,
    /// Per-invocation cap on ASTEs flushed by the periodic `update` sweep
    /// (§4.4).
    pub update_aste_cap: usize,
    /// Per-invocation cap on AOTEs visited by the periodic `update` sweep
    /// (§4.4).
    pub update_aote_cap: usize,
    /// Maximum batch size for frame/BAT-address collection in
    /// `free_pages` (§4.6) before the PMAP lock must be dropped to call
    /// out to the collaborator.
    pub free_pages_batch: usize,
    /// Extra per-process WSL slots pre-allocated beyond the six reserved
    /// indices (free/clean-impure/clean-pure/dirty/wired + index 1,
    /// currently unused) at [`crate::PagingCore::new`] (§3).
    pub process_wsl_hint: usize,
    /// Number of frames `ws_scan_callback`'s periodic tick asks
    /// `ws_scan` to reclaim from a single WSL per invocation (§4.1).
    pub ws_scan_batch: usize,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            aste_scan_candidates: 12,
            aote_scan_candidates: 6,
            max_aste: 4096,
            max_aote: 1024,
            max_frames: 65536,
            grow_read_ahead_pages: 4,
            update_aste_cap: 32,
            update_aote_cap: 75,
            free_pages_batch: 32,
            process_wsl_hint: 256,
            ws_scan_batch: 64,
        }
    }
}
