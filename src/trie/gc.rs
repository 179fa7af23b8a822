//! Compaction, recycling and deferred reclamation.
//!
//! The allocator never reuses a freed cell directly; fragmented chunks are
//! emptied by evacuating their live twig vectors into the bump chunk.
//! Mutable chunks can then be freed on the spot, immutable ones are queued
//! on an SMR phase and freed once every reader has passed a quiescent
//! state, and chunks pinned by snapshots wait for mark-sweep.

use std::time::Instant;

use crate::node::{Node, QpRef};
use crate::trie::Qp;

/// Cells per chunk below which a non-bump chunk is worth evacuating.
pub(crate) const QP_MIN_USED: u32 = crate::node::QP_CHUNK_SIZE / 4;
/// Freed cells in the bump chunk above which compaction starts afresh.
pub(crate) const QP_MAX_FREE: u32 = crate::node::QP_CHUNK_SIZE / 4;
/// Free-space slack below which automatic compaction never triggers.
const QP_MIN_SLACK: u64 = crate::node::QP_CHUNK_SIZE as u64;

/// How much of the trie [`Qp::compact`] should rewrite.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompactMode {
    /// Evacuate only chunks below the occupancy threshold.
    Maybe,
    /// Evacuate everything into fresh chunks.
    All,
}

impl Qp {
    fn chunk_evacuatable(&self, chunk: u32) -> bool {
        chunk != self.bump && self.usage[chunk as usize].live() < QP_MIN_USED
    }

    /// Space freed during the current transaction, the only space the
    /// auto-GC heuristic is allowed to chase.
    fn autogc_wanted(&self) -> bool {
        let slack = self.free_count.saturating_sub(self.hold_count);
        slack > std::cmp::max(self.used_count / 8, QP_MIN_SLACK)
    }

    pub(crate) fn needgc(&self) -> bool {
        self.free_count > QP_MAX_FREE as u64
    }

    /// Runs a compaction cycle when a destructive free left enough slack
    /// behind. If one cycle does not get back under the threshold, the
    /// next cycle compacts everything.
    pub(crate) fn auto_gc(&mut self) {
        if !self.autogc_wanted() {
            return;
        }
        self.compact_pass(CompactMode::Maybe);
        self.recycle();
        if self.autogc_wanted() {
            self.compact_all = true;
            tracing::info!(
                trie = self.methods.tree_name(),
                used = self.used_count,
                free = self.free_count,
                hold = self.hold_count,
                "compaction fell behind, scheduling a full pass"
            );
        }
    }

    /// Defragments the trie and returns recovered chunks to the allocator.
    pub fn compact(&mut self, mode: CompactMode) {
        self.compact_pass(mode);
        self.recycle();
    }

    /// Rewrites fragmented parts of the trie into the bump chunk.
    pub(crate) fn compact_pass(&mut self, mode: CompactMode) {
        let start = Instant::now();
        if mode == CompactMode::All {
            self.compact_all = true;
        }
        tracing::trace!(
            trie = self.methods.tree_name(),
            all = self.compact_all,
            used = self.used_count,
            free = self.free_count,
            "compacting"
        );
        if self.usage[self.bump as usize].free > QP_MAX_FREE {
            self.new_bump();
        }
        if self.root.is_valid() {
            // The root cell behaves like a one-twig vector.
            if self.compact_all || self.chunk_evacuatable(self.root.chunk()) {
                self.root = self.evacuate_cells(self.root, 1);
            }
            let rn = self.read_node(self.root);
            if rn.is_branch() {
                let old = rn.branch_twigs();
                let new = unsafe { self.compact_recursive(self.node_ptr(self.root)) };
                if new != old {
                    if self.cells_immutable(self.root) {
                        self.root = self.evacuate_cells(self.root, 1);
                    }
                    let rp = self.node_ptr(self.root);
                    unsafe { *rp = (*rp).with_twigs(new) };
                }
            }
        }
        self.compact_all = false;
        self.stats
            .compact_ns
            .fetch_add(start.elapsed().as_nanos() as u64, std::sync::atomic::Ordering::Relaxed);
    }

    /// Post-order compaction of the subtree below the branch at `parent`.
    /// Returns the branch's twig vector reference after any evacuation;
    /// the caller patches its own copy of the branch word. Nothing bubbles
    /// up unless the occupancy test (or `compact_all`) introduced a move.
    ///
    /// # Safety
    /// `parent` must point at a live branch cell of this trie.
    unsafe fn compact_recursive(&mut self, parent: *mut Node) -> QpRef {
        let p = *parent;
        let size = p.branch_twig_count();
        let mut twigs = p.branch_twigs();
        if self.compact_all || self.chunk_evacuatable(twigs.chunk()) {
            twigs = self.evacuate_cells(twigs, size);
        }
        for pos in 0..size {
            let child = *self.node_at(twigs, pos);
            if !child.is_branch() {
                continue;
            }
            let old = child.branch_twigs();
            let new = self.compact_recursive(self.node_at(twigs, pos));
            if new == old {
                continue;
            }
            // The child moved its vector; this level must be writable to
            // record that. Deep evacuation can reseal this vector (a bump
            // rotation freezes the old bump), so re-check every time.
            if self.cells_immutable(twigs) {
                twigs = self.evacuate_cells(twigs, size);
            }
            let cp = self.node_at(twigs, pos);
            *cp = (*cp).with_twigs(new);
        }
        twigs
    }

    /// Frees every mutable chunk with no live cells. Immutable chunks
    /// wait for [`Qp::defer_chunk_reclamation`].
    pub(crate) fn recycle(&mut self) {
        let start = Instant::now();
        let mut freed = 0usize;
        for chunk in 0..self.usage.len() as u32 {
            let u = self.usage[chunk as usize];
            if u.exists
                && chunk != self.bump
                && !u.immutable
                && u.phase == 0
                && u.live() == 0
            {
                self.used_count -= u.used as u64;
                self.free_count -= u.free as u64;
                self.hold_count = self.hold_count.min(self.free_count);
                self.chunk_destroy(chunk);
                freed += 1;
            }
        }
        if freed > 0 {
            tracing::trace!(trie = self.methods.tree_name(), freed, "recycled chunks");
        }
        self.stats
            .recycle_ns
            .fetch_add(start.elapsed().as_nanos() as u64, std::sync::atomic::Ordering::Relaxed);
    }

    /// Queues every empty immutable chunk for reclamation in `phase`,
    /// dropping it from the live counters. Returns whether anything was
    /// queued.
    pub(crate) fn defer_chunk_reclamation(&mut self, phase: u32) -> bool {
        debug_assert!(phase != 0);
        let mut any = false;
        for chunk in 0..self.usage.len() as u32 {
            let u = self.usage[chunk as usize];
            // A chunk with `snapfree` set already went through a cycle and
            // now belongs to mark-sweep; queueing it again would double
            // count it out of the totals.
            if u.exists
                && chunk != self.bump
                && u.immutable
                && u.phase == 0
                && !u.snapfree
                && u.live() == 0
            {
                self.usage[chunk as usize].phase = phase;
                self.used_count -= u.used as u64;
                self.free_count -= u.free as u64;
                self.hold_count = self.hold_count.min(self.free_count);
                any = true;
            }
        }
        any
    }

    /// Frees queued chunks whose phase has drained. A chunk still pinned
    /// by a snapshot is handed over to mark-sweep instead. Returns whether
    /// chunks of a later phase remain queued, so the caller can re-arm.
    pub(crate) fn reclaim_chunks(&mut self, upto: u32) -> bool {
        let mut later = false;
        for chunk in 0..self.usage.len() as u32 {
            let u = self.usage[chunk as usize];
            if !u.exists || u.phase == 0 {
                continue;
            }
            if u.phase > upto {
                later = true;
            } else if u.snapshot {
                self.usage[chunk as usize].phase = 0;
                self.usage[chunk as usize].snapfree = true;
            } else {
                self.chunk_destroy(chunk);
            }
        }
        later
    }

    /// Recomputes the snapshot flags from the surviving snapshots' pinned
    /// chunk arrays and frees every chunk whose reclamation was blocked
    /// only by snapshots that are now gone.
    pub(crate) fn marksweep_chunks<'a, I>(&mut self, snapshots: I)
    where
        I: IntoIterator<Item = &'a [*mut Node]>,
    {
        for chunks in snapshots {
            for (chunk, ptr) in chunks.iter().enumerate() {
                if !ptr.is_null() {
                    debug_assert!(self.usage[chunk].exists);
                    self.usage[chunk].snapmark = true;
                }
            }
        }
        for chunk in 0..self.usage.len() as u32 {
            let idx = chunk as usize;
            self.usage[idx].snapshot = self.usage[idx].snapmark;
            self.usage[idx].snapmark = false;
            if self.usage[idx].exists && self.usage[idx].snapfree && !self.usage[idx].snapshot {
                self.usage[idx].snapfree = false;
                self.chunk_destroy(chunk);
            }
        }
    }
}
