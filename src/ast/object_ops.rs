//! AOT operations: `allocate_aote`, `release_aote`, `force_activate_segment`,
//! `lookup_aote_by_uid`, `load_aote`, `purify_aote`, `process_aote`, the
//! periodic `update` sweep, and table growth (`add_aotes`/`add_astes`)
//! (§4.4). These live on [`AstTable`] rather than a separate `AotTable`
//! because the AST lock governs both tables (§5) — see the module doc on
//! `ast::mod`.

use crate::aot::{Aote, AoteFlags};
use crate::ast::{AsteFlags, DeactivateFlags};
use crate::error::{PagingError, PagingResult, StatusCode};
use crate::external::{AbortReason, AttrBuffer, Collaborators, ObjectLocation};
use crate::ids::{AoteId, AsteId, Uid};
use crate::pmap::Pmap;

use super::{AstState, AstTable};

/// Outcome of one `update` sweep invocation (§4.4), surfaced so tests and
/// the host's timer tick can observe how much work was actually done.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpdateReport {
    pub astes_flushed: usize,
    pub aotes_visited: usize,
    /// `true` if this call walked all the way back to the start of the
    /// AOTE table (one full revolution of `update_cursor`).
    pub wrapped: bool,
}

impl AstTable {
    // -- AOTE allocation ---------------------------------------------------

    /// `allocate_aote` (§4.4). Never fails: exhaustion is fatal (§7 tier 3)
    /// and routes through [`Collaborators::abort`].
    pub fn allocate_aote(&self, collab: &dyn Collaborators) -> AoteId {
        if let Some(id) = self.pop_free_aote() {
            return id;
        }
        if let Some(id) = self.scan_and_evict_aote(collab, self.config.aote_scan_candidates) {
            return id;
        }
        let total = self.with_state(|st| st.aotes.len());
        if let Some(id) = self.scan_and_evict_aote(collab, total) {
            return id;
        }
        collab.abort(AbortReason::AoteTableExhausted)
    }

    fn pop_free_aote(&self) -> Option<AoteId> {
        let mut st = self.state.lock().unwrap();
        let id = st.free_aote_head;
        if id.is_none() {
            return None;
        }
        st.free_aote_head = st.aotes[id.index()].hash_next;
        st.aotes[id.index()] = Aote::vacant();
        Some(id)
    }

    fn scan_and_evict_aote(&self, collab: &dyn Collaborators, limit: usize) -> Option<AoteId> {
        let total = self.with_state(|st| st.aotes.len());
        if total == 0 {
            return None;
        }
        let mut candidates: Vec<(AoteId, usize, u32)> = Vec::new();
        for _ in 0..limit.min(total) {
            let id = self.with_state(|st| {
                let id = st.aote_scan_cursor;
                st.aote_scan_cursor = AoteId::new(((id.0 as usize + 1) % total) as u32);
                id
            });
            let skip = self.with_state(|st| {
                let a = &st.aotes[id.index()];
                a.is_free()
                    || a.flags.contains(AoteFlags::BUSY)
                    || a.flags.contains(AoteFlags::IN_TRANSITION)
                    || a.refcount != 0
            });
            if skip {
                continue;
            }

            let (aste_count, pages) = self.with_state(|st| {
                let count = st.aotes[id.index()].aste_count;
                (count, Self::aote_total_pages(st, &self.pmap, id))
            });

            // Best case: an AOTE with no resident segments can be
            // processed immediately without competing against candidates
            // found later in the scan (mirrors `allocate_aste`'s
            // zero-page-count fast path).
            if aste_count == 0 {
                if self.try_evict_aote(collab, id) {
                    return Some(id);
                }
                continue;
            }

            candidates.push((id, aste_count, pages));
            candidates.sort_by_key(|&(_, ac, pg)| (ac, pg));
            candidates.truncate(2);
        }
        for (id, _, _) in candidates {
            if self.try_evict_aote(collab, id) {
                return Some(id);
            }
        }
        None
    }

    fn aote_total_pages(st: &AstState, pmap: &Pmap, aote: AoteId) -> u32 {
        let mut total = 0;
        let mut cur = st.aotes[aote.index()].aste_head;
        while !cur.is_none() {
            total += pmap.page_count(cur);
            cur = st.astes[cur.index()].next;
        }
        total
    }

    fn try_evict_aote(&self, collab: &dyn Collaborators, id: AoteId) -> bool {
        if self.process_aote(collab, id, false, false, false).is_ok() {
            self.with_state(|st| st.aotes[id.index()] = Aote::vacant());
            true
        } else {
            false
        }
    }

    /// `release_aote(aote)` (§6): drop a caller's pin taken while an AOTE
    /// was held across `lookup_or_create_aste`/I/O.
    pub fn release_aote(&self, id: AoteId) {
        self.with_state(|st| {
            st.aotes[id.index()].refcount = st.aotes[id.index()].refcount.saturating_sub(1);
        });
    }

    // -- Hash table ----------------------------------------------------------

    /// `lookup_aote_by_uid(uid)` (§4.4).
    pub fn lookup_aote_by_uid(&self, uid: Uid) -> Option<AoteId> {
        self.with_state(|st| Self::find_in_hash(st, uid))
    }

    fn find_in_hash(st: &AstState, uid: Uid) -> Option<AoteId> {
        let mut cur = st.hash_buckets[Self::hash(uid)];
        while !cur.is_none() {
            if st.aotes[cur.index()].uid == uid {
                return Some(cur);
            }
            cur = st.aotes[cur.index()].hash_next;
        }
        None
    }

    fn unlink_hash(st: &mut AstState, bucket: usize, id: AoteId) {
        let head = st.hash_buckets[bucket];
        if head == id {
            st.hash_buckets[bucket] = st.aotes[id.index()].hash_next;
            return;
        }
        let mut cur = head;
        while !cur.is_none() {
            let next = st.aotes[cur.index()].hash_next;
            if next == id {
                st.aotes[cur.index()].hash_next = st.aotes[id.index()].hash_next;
                return;
            }
            cur = next;
        }
    }

    /// Rewrite a collaborator's "object not found" failure through the
    /// canonical `FileObjectNotFound` variant, recording the failing UID
    /// for debugging (§4.4, "records the failing UID in global 'last
    /// failed UID' cells").
    fn validate_uid(&self, uid: Uid, err: PagingError) -> PagingError {
        let is_not_found = matches!(err, PagingError::FileObjectNotFound { .. })
            || matches!(
                err,
                PagingError::Collaborator { status } if status == StatusCode::FileObjectNotFound as u32
            );
        if is_not_found {
            self.with_state(|st| st.last_failed_uid = uid);
            return PagingError::FileObjectNotFound { uid: uid.0 };
        }
        err
    }

    // -- Activation ----------------------------------------------------------

    /// `force_activate_segment(uid, vol_or_node)` (§4.4). Returns the AOTE
    /// already resident, or activates a fresh one via `vtoc_lookup` +
    /// `vtoce_read` (local) or `network_ast_get_info` (remote).
    pub fn force_activate_segment(
        &self,
        collab: &dyn Collaborators,
        uid: Uid,
        location: ObjectLocation,
    ) -> PagingResult<AoteId> {
        loop {
            if let Some(id) = self.lookup_aote_by_uid(uid) {
                return Ok(id);
            }

            // Step 1: snapshot the sequence number before the (possibly
            // blocking) allocation.
            let seqn_snapshot = self.with_state(|st| st.aote_seqn);
            let candidate = self.allocate_aote(collab);

            // Step 2: rehash and re-scan; a sibling may have beaten us to
            // it while `allocate_aote` was running.
            let mut st = self.state.lock().unwrap();
            if st.aote_seqn != seqn_snapshot {
                if let Some(existing) = Self::find_in_hash(&st, uid) {
                    let in_transition =
                        st.aotes[existing.index()].flags.contains(AoteFlags::IN_TRANSITION);
                    if in_transition {
                        st.aotes[existing.index()].refcount += 1;
                    }
                    drop(st);
                    self.push_free_aote(candidate);
                    if in_transition {
                        self.ast_trans.wait_for_next();
                        self.with_state(|st| {
                            st.aotes[existing.index()].refcount =
                                st.aotes[existing.index()].refcount.saturating_sub(1);
                        });
                    }
                    return Ok(existing);
                }
            }

            // Step 3: initialize and publish the winning candidate.
            let bucket = Self::hash(uid);
            st.aotes[candidate.index()] = Aote {
                uid,
                location,
                flags: AoteFlags::IN_TRANSITION,
                hash_next: st.hash_buckets[bucket],
                seqn: st.aote_seqn,
                ..Aote::vacant()
            };
            st.aote_seqn = st.aote_seqn.wrapping_add(1);
            st.hash_buckets[bucket] = candidate;
            drop(st);

            // Step 4: long-latency load, AST lock released.
            let load_result = match location {
                ObjectLocation::Remote { node } => {
                    let net = collab.network_get_net(node)?;
                    collab
                        .network_ast_get_info(net, uid)
                        .map(|attrs| (attrs, None))
                }
                ObjectLocation::Local { .. } => match collab.vtoc_lookup(uid) {
                    Ok(handle) => collab.vtoce_read(handle).map(|attrs| (attrs, Some(handle))),
                    Err(e) => Err(e),
                },
            };

            // Step 5: reacquire, finalize or roll back.
            let mut st = self.state.lock().unwrap();
            return match load_result {
                Ok((attrs, vtoc)) => {
                    let a = &mut st.aotes[candidate.index()];
                    a.attrs = attrs;
                    a.vtoc = vtoc;
                    a.flags.remove(AoteFlags::IN_TRANSITION);
                    if matches!(location, ObjectLocation::Remote { .. }) {
                        a.flags.insert(AoteFlags::REMOTE);
                    }
                    drop(st);
                    self.ast_trans.advance();
                    Ok(candidate)
                }
                Err(e) => {
                    Self::unlink_hash(&mut st, bucket, candidate);
                    st.aotes[candidate.index()] = Aote::vacant();
                    st.aotes[candidate.index()].hash_next = st.free_aote_head;
                    st.free_aote_head = candidate;
                    drop(st);
                    self.ast_trans.advance();
                    Err(self.validate_uid(uid, e))
                }
            };
        }
    }

    fn push_free_aote(&self, id: AoteId) {
        let mut st = self.state.lock().unwrap();
        st.aotes[id.index()] = Aote::vacant();
        st.aotes[id.index()].hash_next = st.free_aote_head;
        st.free_aote_head = id;
    }

    /// `load_aote(attrs, obj_info)` (§4.4): publish an AOTE from
    /// caller-supplied attributes instead of driving the `vtoc_lookup` /
    /// `vtoce_read` / `network_ast_get_info` IO itself (used by bootstrap
    /// and recovery paths that already hold the attribute payload).
    pub fn load_aote(
        &self,
        collab: &dyn Collaborators,
        uid: Uid,
        location: ObjectLocation,
        attrs: AttrBuffer,
    ) -> AoteId {
        if let Some(id) = self.lookup_aote_by_uid(uid) {
            return id;
        }
        let id = self.allocate_aote(collab);
        let mut st = self.state.lock().unwrap();
        let bucket = Self::hash(uid);
        st.aotes[id.index()] = Aote {
            uid,
            location,
            attrs,
            flags: if matches!(location, ObjectLocation::Remote { .. }) {
                AoteFlags::REMOTE
            } else {
                AoteFlags::empty()
            },
            hash_next: st.hash_buckets[bucket],
            seqn: st.aote_seqn,
            ..Aote::vacant()
        };
        st.aote_seqn = st.aote_seqn.wrapping_add(1);
        st.hash_buckets[bucket] = id;
        id
    }

    // -- Purify / process ----------------------------------------------------

    /// `purify_aote(aote, flags)` (§4.4): write back cached attributes.
    pub fn purify_aote(&self, collab: &dyn Collaborators, id: AoteId) -> PagingResult<()> {
        let remote = self.with_state(|st| st.aotes[id.index()].flags.contains(AoteFlags::REMOTE));

        if remote {
            let touched = self.with_state(|st| st.aotes[id.index()].flags.contains(AoteFlags::TOUCHED));
            let read_only = self.with_state(|st| st.aotes[id.index()].flags.contains(AoteFlags::PER_BOOT));
            if touched && !read_only {
                let (node, uid) = self.with_state(|st| {
                    let a = &st.aotes[id.index()];
                    match a.location {
                        ObjectLocation::Remote { node } => (node, a.uid),
                        ObjectLocation::Local { .. } => unreachable!("REMOTE flag without a remote location"),
                    }
                });
                let net = collab.network_get_net(node)?;
                collab.network_ast_get_info(net, uid)?;
                let now = self.tick();
                self.with_state(|st| st.aotes[id.index()].dts = now);
            }
            return Ok(());
        }

        let touched = self.with_state(|st| st.aotes[id.index()].flags.contains(AoteFlags::TOUCHED));
        if touched {
            let now = self.tick();
            self.with_state(|st| {
                let a = &mut st.aotes[id.index()];
                a.dts = now;
                a.flags.insert(AoteFlags::DIRTY);
                a.flags.remove(AoteFlags::TOUCHED);
            });
        }

        let dirty = self.with_state(|st| st.aotes[id.index()].flags.contains(AoteFlags::DIRTY));
        if !dirty {
            return Ok(());
        }

        let handle = self.with_state(|st| st.aotes[id.index()].vtoc);
        let handle = match handle {
            Some(h) => h,
            None => return Ok(()),
        };
        let attrs = self.with_state(|st| st.aotes[id.index()].attrs);

        self.with_state(|st| st.aotes[id.index()].flags.remove(AoteFlags::DIRTY));
        match collab.vtoce_write(handle, &attrs) {
            Ok(()) => Ok(()),
            Err(PagingError::DiskWriteProtected) => Ok(()),
            Err(e) => {
                self.with_state(|st| st.aotes[id.index()].flags.insert(AoteFlags::DIRTY));
                Err(e)
            }
        }
    }

    /// `process_aote(aote, flags1, flags2, wait?)` (§4.4). `skip_purify`
    /// corresponds to `flags1 >= 0`'s complement; `override_system`
    /// corresponds to `flags2 < 0` ("caller signals override").
    pub fn process_aote(
        &self,
        collab: &dyn Collaborators,
        id: AoteId,
        skip_purify: bool,
        override_system: bool,
        wait: bool,
    ) -> PagingResult<()> {
        {
            let mut st = self.state.lock().unwrap();
            let a = &st.aotes[id.index()];
            if a.flags.contains(AoteFlags::BUSY) || a.flags.contains(AoteFlags::IN_TRANSITION) {
                return Err(PagingError::AstIncompatibleRequest);
            }
            if a.flags.contains(AoteFlags::PER_BOOT) && !override_system {
                return Err(PagingError::AstIncompatibleRequest);
            }
            st.aotes[id.index()].flags.insert(AoteFlags::IN_TRANSITION);
        }

        loop {
            let head = self.with_state(|st| st.aotes[id.index()].aste_head);
            if head.is_none() {
                break;
            }
            let in_transition =
                self.with_state(|st| st.astes[head.index()].flags.contains(AsteFlags::IN_TRANSITION));
            if in_transition {
                if wait {
                    self.ast_trans.wait_for_next();
                    continue;
                }
                self.with_state(|st| st.aotes[id.index()].flags.remove(AoteFlags::IN_TRANSITION));
                self.ast_trans.advance();
                return Err(PagingError::AstSegmentNotDeactivatable);
            }
            if let Err(e) = self.deactivate_segment(collab, head, DeactivateFlags::NORMAL) {
                self.with_state(|st| st.aotes[id.index()].flags.remove(AoteFlags::IN_TRANSITION));
                self.ast_trans.advance();
                return Err(e);
            }
        }

        let purify_result = if skip_purify {
            Ok(())
        } else {
            self.purify_aote(collab, id)
        };

        let mut st = self.state.lock().unwrap();
        let uid = st.aotes[id.index()].uid;
        let bucket = Self::hash(uid);
        Self::unlink_hash(&mut st, bucket, id);
        st.aotes[id.index()].flags.remove(AoteFlags::IN_TRANSITION);
        drop(st);
        self.ast_trans.advance();

        purify_result
    }

    // -- Periodic sweep -------------------------------------------------------

    /// `update()` (§4.4): the periodic timer sweep that flushes DIRTY area
    /// segments and purifies clean AOTEs, bounded by
    /// `config.update_aste_cap` / `config.update_aote_cap` per invocation.
    pub fn update(&self, collab: &dyn Collaborators) -> UpdateReport {
        let mut report = UpdateReport::default();
        let total = self.with_state(|st| st.aotes.len());
        if total == 0 {
            return report;
        }

        loop {
            if report.aotes_visited >= self.config.update_aote_cap
                || report.astes_flushed >= self.config.update_aste_cap
            {
                break;
            }

            let (id, wrapped_now) = self.with_state(|st| {
                let id = st.update_cursor;
                let next = AoteId::new(((id.0 as usize + 1) % total) as u32);
                st.update_cursor = next;
                (id, next.0 == 0)
            });

            let eligible = self.with_state(|st| {
                let a = &st.aotes[id.index()];
                !a.is_free()
                    && a.refcount == 0
                    && !a.flags.contains(AoteFlags::BUSY)
                    && !a.flags.contains(AoteFlags::IN_TRANSITION)
            });

            if eligible {
                report.aotes_visited += 1;

                let mut cur = self.with_state(|st| st.aotes[id.index()].aste_head);
                while !cur.is_none() && report.astes_flushed < self.config.update_aste_cap {
                    let next_aste = self.with_state(|st| st.astes[cur.index()].next);
                    let flushable = self.with_state(|st| {
                        let a = &st.astes[cur.index()];
                        a.flags.contains(AsteFlags::DIRTY)
                            && a.flags.contains(AsteFlags::AREA)
                            && !a.flags.contains(AsteFlags::IN_TRANSITION)
                            && a.wire_count == 0
                    });
                    if flushable {
                        self.with_state(|st| st.astes[cur.index()].flags.insert(AsteFlags::IN_TRANSITION));
                        if self.update_aste(collab, cur).is_ok() {
                            report.astes_flushed += 1;
                        }
                        self.with_state(|st| st.astes[cur.index()].flags.remove(AsteFlags::IN_TRANSITION));
                        self.ast_trans.advance();
                    }
                    cur = next_aste;
                }

                let _ = self.purify_aote(collab, id);
            }

            if wrapped_now {
                report.wrapped = true;
                break;
            }
        }

        report
    }

    // -- Table growth ---------------------------------------------------------

    /// `add_astes(count)` (§6). Refuses to exceed `config.max_aste` (§8,
    /// boundary behaviors).
    pub fn add_astes(&self, count: usize) -> PagingResult<()> {
        let base = {
            let mut st = self.state.lock().unwrap();
            if st.astes.len() + count > self.config.max_aste {
                return Err(PagingError::Collaborator {
                    status: StatusCode::AstIncompatibleRequest as u32,
                });
            }
            let base = st.astes.len();
            for i in 0..count {
                let id = AsteId::new((base + i) as u32);
                let mut a = crate::ast::Aste::vacant();
                a.next = st.free_aste_head;
                st.free_aste_head = id;
                st.astes.push(a);
            }
            base
        };
        for i in 0..count {
            self.pmap.init_segment(AsteId::new((base + i) as u32));
        }
        Ok(())
    }

    /// `add_aotes(count)` (§6). Refuses to exceed `config.max_aote`.
    pub fn add_aotes(&self, count: usize) -> PagingResult<()> {
        let mut st = self.state.lock().unwrap();
        if st.aotes.len() + count > self.config.max_aote {
            return Err(PagingError::Collaborator {
                status: StatusCode::AstIncompatibleRequest as u32,
            });
        }
        let base = st.aotes.len();
        for i in 0..count {
            let id = AoteId::new((base + i) as u32);
            let mut a = Aote::vacant();
            a.hash_next = st.free_aote_head;
            st.free_aote_head = id;
            st.aotes.push(a);
        }
        Ok(())
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

    fn small_table(max_aste: usize, max_aote: usize) -> AstTable {
        let config = PagingConfig {
            max_aste,
            max_aote,
            max_frames: 64,
            ..PagingConfig::default()
        };
        let pmap = Arc::new(Pmap::new(max_aste));
        let mmap = Arc::new(Mmap::new(64, 0));
        AstTable::new(config, pmap, mmap)
    }

    #[test]
    fn force_activate_segment_is_idempotent_for_same_uid() {
        let table = small_table(4, 4);
        let collab = StubCollaborators::new();
        let uid = Uid(42);
        let first = table
            .force_activate_segment(&collab, uid, ObjectLocation::Local { volume: 0 })
            .unwrap();
        let second = table
            .force_activate_segment(&collab, uid, ObjectLocation::Local { volume: 0 })
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(table.lookup_aote_by_uid(uid), Some(first));
    }

    #[test]
    fn force_activate_segment_propagates_not_found_and_frees_candidate() {
        let table = small_table(2, 2);
        let collab = StubCollaborators::new();
        let uid = Uid(7);
        collab.mark_not_found(uid);

        let err = table
            .force_activate_segment(&collab, uid, ObjectLocation::Local { volume: 0 })
            .unwrap_err();
        assert!(matches!(err, PagingError::FileObjectNotFound { uid: 7 }));
        assert_eq!(table.lookup_aote_by_uid(uid), None);

        // The candidate AOTE must have been returned to the free list, not
        // leaked — a second activation (for a different, resolvable uid)
        // should still succeed.
        let other = Uid(8);
        let id = table
            .force_activate_segment(&collab, other, ObjectLocation::Local { volume: 0 })
            .unwrap();
        assert_eq!(table.lookup_aote_by_uid(other), Some(id));
    }

    #[test]
    fn process_aote_rejects_busy_and_succeeds_when_idle() {
        let table = small_table(4, 4);
        let collab = StubCollaborators::new();
        let uid = Uid(9);
        let id = table
            .force_activate_segment(&collab, uid, ObjectLocation::Local { volume: 0 })
            .unwrap();

        table.with_state(|st| st.aotes[id.index()].flags.insert(AoteFlags::BUSY));
        assert!(matches!(
            table.process_aote(&collab, id, false, false, false),
            Err(PagingError::AstIncompatibleRequest)
        ));
        table.with_state(|st| st.aotes[id.index()].flags.remove(AoteFlags::BUSY));

        table.process_aote(&collab, id, false, false, false).unwrap();
        assert_eq!(table.lookup_aote_by_uid(uid), None);
    }

    #[test]
    fn update_sweep_reports_visited_count_without_panicking() {
        let table = small_table(4, 4);
        let collab = StubCollaborators::new();
        table
            .force_activate_segment(&collab, Uid(1), ObjectLocation::Local { volume: 0 })
            .unwrap();
        table
            .force_activate_segment(&collab, Uid(2), ObjectLocation::Local { volume: 0 })
            .unwrap();
        let report = table.update(&collab);
        assert!(report.aotes_visited >= 2);
    }
}
