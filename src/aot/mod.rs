//! AOT: Active Object Table entries (§3, §4.4).
//!
//! The AOTE data type lives here; the operations that create, look up, and
//! destroy AOTEs (`allocate_aote`, `force_activate_segment`, `purify_aote`,
//! `process_aote`, the periodic `update` sweep) are implemented as
//! inherent methods on [`crate::ast::AstTable`] instead, because the AST
//! lock governs both tables (§5) — splitting them across two independently
//! locked structs would reintroduce exactly the lock-ordering hazard the
//! spec calls out.

mod aote;

pub use aote::{Aote, AoteFlags};
pub use crate::ast::UpdateReport;
