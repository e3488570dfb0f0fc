//! Error types for the paging core.
//!
//! The original design returns a flat 32-bit status code, with 0 meaning
//! success and the high bit (0x80) OR'd onto collaborator failures to mark
//! "error occurred below; cleanup in progress" (§7). We keep the status-code
//! surface for interop with [`StatusCode`] but express it as a proper Rust
//! error enum everywhere in the core's own API, matching how collaborator
//! failures actually get handled (unwind in-transition flags, then
//! propagate).

use core::fmt;

/// Result type alias used throughout the paging core.
pub type PagingResult<T> = Result<T, PagingError>;

/// Canonical 32-bit status codes, named to match the external interface
/// (§6). `OK` is always zero; everything else is a distinct nonzero value.
/// These exist so the core can hand a status back across the collaborator
/// boundary (e.g. to a caller that only understands the legacy status
/// convention) without losing the original taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    AstIncompatibleRequest = 0x1001,
    AstSegmentNotDeactivatable = 0x1002,
    AstReadConcurrencyViolation = 0x1003,
    AstWriteConcurrencyViolation = 0x1004,
    AstEof = 0x1005,
    PmapReadConcurrencyViolation = 0x2001,
    PmapWriteConcurrencyViolation = 0x2002,
    PmapHasRefs = 0x2003,
    PmapBadAssoc = 0x2004,
    PmapPageNull = 0x2005,
    FileObjectNotFound = 0x20006,
    FileObjectIsRemote = 0x20007,
    FileReadOnly = 0x20008,
    DiskWriteProtected = 0x20009,
    MmapIllegalPid = 0x3001,
    MmapIllegalWslIndex = 0x3002,
    MmapContigPagesUnavailable = 0x3003,
    OsOnlyLocalAccessAllowed = 0x4001,
}

impl StatusCode {
    /// OR the high byte (bit 31) onto a status, matching the collaborator-
    /// failure convention in §7 taxonomy tier 5.
    pub const fn with_collaborator_flag(self) -> u32 {
        (self as u32) | 0x8000_0000
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:x})", self, *self as u32)
    }
}

/// Errors returned by the paging core's public entry points.
///
/// Variants correspond 1:1 to the "expected negative result" and
/// "resource exhaustion" tiers of the error taxonomy (§7 tiers 1 and 3).
/// Tier 2 (wait-and-retry) never surfaces: it is handled internally by
/// blocking on an event count. Tier 4 (invariant violations) is handled by
/// [`crate::external::Collaborators::abort`], which never returns. Tier 5
/// (collaborator failure) is folded into [`PagingError::Collaborator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "paging errors must be handled, not silently discarded"]
pub enum PagingError {
    /// The request conflicts with the ASTE's current mode/flags (e.g. a
    /// remote-only or OS-process-only operation attempted by the wrong
    /// caller).
    AstIncompatibleRequest,
    /// `deactivate_segment` preconditions failed: nonzero refcount, or
    /// WIRED+DIRTY with a non-OS caller.
    AstSegmentNotDeactivatable,
    /// `touch`'s step-1 check (§4.3) found the AOTE's concurrency token
    /// held by an incompatible mode. Constructed by
    /// [`crate::ast::AstTable::touch`].
    ReadConcurrencyViolation,
    /// `assoc`'s own equality-based concurrency check
    /// (`examples/original_source/domain_os/ast/assoc.c`: `concurrency ==
    /// mode || concurrency == 1`) found an incompatible token. Not
    /// constructed by this crate: `assoc` (src/ast/touch.rs) has no `mode`
    /// parameter of its own and performs no concurrency check distinct
    /// from the one `touch` already ran on its behalf when called through
    /// `PagingCore::assoc`/`assoc_area`. Left unconstructed rather than
    /// modeled, since giving `assoc` its own token parameter and check
    /// would be a separate, larger change than the step-1 fix this variant
    /// was added alongside — see DESIGN.md.
    WriteConcurrencyViolation,
    /// `touch` addressed a page beyond EOF without the GROW flag.
    Eof,
    /// `pmap_assoc` found the existing frame still referenced
    /// (nonzero PMAP refcount).
    PmapHasRefs,
    /// `invalidate` found an installed slot with outstanding PMAP refs.
    PageHasRefs,
    /// `pmap_assoc` was attempted on a slot with no disk backing.
    PmapBadAssoc,
    /// A frame argument to `pmap_assoc` was zero (the null frame).
    PmapPageNull,
    /// `vtoc_lookup`/`vtoce_read` could not resolve the UID.
    FileObjectNotFound { uid: u64 },
    /// The object is remote and the caller required local access.
    FileObjectIsRemote,
    /// A COW fault landed on a per-boot, read-only object.
    FileReadOnly,
    /// `vtoce_write`/`fm_write` reported the backing disk as write
    /// protected. Not surfaced to callers of `purify_aote` /
    /// `update_aste` — handled internally — but exposed here for callers
    /// that invoke the collaborator contract directly.
    DiskWriteProtected,
    /// A PID does not map to any WSL.
    IllegalPid { pid: u64 },
    /// A WSL index outside the valid table range was requested.
    IllegalWslIndex { index: u32 },
    /// `alloc_contig` is not supported by this design.
    ContigPagesUnavailable,
    /// An operation reserved for OS processes was attempted by a user
    /// process on a local-only path. `touch.c`'s companion check to the
    /// concurrency-token one (gated on the caller's `PROC1_$CURRENT`
    /// process type): this crate's `Collaborators` boundary carries no
    /// caller-identity/process-type concept, so there is nothing for this
    /// check to read. Left unconstructed rather than modeled with a fake
    /// identity input — see DESIGN.md.
    OsOnlyLocalAccessAllowed,
    /// A collaborator (disk, network, VTOC, BAT) returned a failure
    /// status. The high bit is conceptually set per §7 tier 5; callers
    /// must unwind IN_TRANSITION flags before propagating further, which
    /// the core's own entry points already do before returning this.
    Collaborator { status: u32 },
}

impl fmt::Display for PagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AstIncompatibleRequest => write!(f, "incompatible request for ASTE state"),
            Self::AstSegmentNotDeactivatable => {
                write!(f, "segment cannot be deactivated in its current state")
            }
            Self::ReadConcurrencyViolation => write!(f, "read concurrency violation"),
            Self::WriteConcurrencyViolation => write!(f, "write concurrency violation"),
            Self::Eof => write!(f, "fault address beyond end of file"),
            Self::PmapHasRefs => write!(f, "existing frame association still referenced"),
            Self::PageHasRefs => write!(f, "page has outstanding PMAP references"),
            Self::PmapBadAssoc => write!(f, "no disk backing for requested association"),
            Self::PmapPageNull => write!(f, "null frame passed to pmap_assoc"),
            Self::FileObjectNotFound { uid } => write!(f, "object {:#018x} not found", uid),
            Self::FileObjectIsRemote => write!(f, "object is remote"),
            Self::FileReadOnly => write!(f, "object is read-only (per-boot)"),
            Self::DiskWriteProtected => write!(f, "backing disk is write protected"),
            Self::IllegalPid { pid } => write!(f, "pid {} has no working-set list", pid),
            Self::IllegalWslIndex { index } => write!(f, "illegal WSL index {}", index),
            Self::ContigPagesUnavailable => write!(f, "contiguous frame allocation unsupported"),
            Self::OsOnlyLocalAccessAllowed => {
                write!(f, "operation restricted to local OS processes")
            }
            Self::Collaborator { status } => {
                write!(f, "collaborator failure, status=0x{:x}", status)
            }
        }
    }
}

impl PagingError {
    /// Map to the canonical status code used at the external boundary.
    pub const fn status_code(&self) -> u32 {
        match self {
            Self::AstIncompatibleRequest => StatusCode::AstIncompatibleRequest as u32,
            Self::AstSegmentNotDeactivatable => StatusCode::AstSegmentNotDeactivatable as u32,
            Self::ReadConcurrencyViolation => StatusCode::PmapReadConcurrencyViolation as u32,
            Self::WriteConcurrencyViolation => StatusCode::PmapWriteConcurrencyViolation as u32,
            Self::Eof => StatusCode::AstEof as u32,
            Self::PmapHasRefs | Self::PageHasRefs => StatusCode::PmapHasRefs as u32,
            Self::PmapBadAssoc => StatusCode::PmapBadAssoc as u32,
            Self::PmapPageNull => StatusCode::PmapPageNull as u32,
            Self::FileObjectNotFound { .. } => StatusCode::FileObjectNotFound as u32,
            Self::FileObjectIsRemote => StatusCode::FileObjectIsRemote as u32,
            Self::FileReadOnly => StatusCode::FileReadOnly as u32,
            Self::DiskWriteProtected => StatusCode::DiskWriteProtected as u32,
            Self::IllegalPid { .. } => StatusCode::MmapIllegalPid as u32,
            Self::IllegalWslIndex { .. } => StatusCode::MmapIllegalWslIndex as u32,
            Self::ContigPagesUnavailable => StatusCode::MmapContigPagesUnavailable as u32,
            Self::OsOnlyLocalAccessAllowed => StatusCode::OsOnlyLocalAccessAllowed as u32,
            Self::Collaborator { status } => *status,
        }
    }
}
