//! Chunk storage: the bump allocator, the refcounted chunk directory and
//! cell mutability.
//!
//! Cells live in fixed-size chunks of raw storage. The writer allocates by
//! bumping a high-water mark in the current "bump" chunk; everything else
//! is bookkeeping in the parallel `usage[]` table. Freeing is lazy: a
//! mutable cell is zeroed on free, an immutable one is merely counted
//! ("held") because readers may still traverse it, and the compactor and
//! the reclamation machinery turn held cells back into memory later.

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, realloc, Layout};
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicPtr, AtomicU32};

use crate::node::{Node, QpRef, QP_CHUNK_SIZE};
use crate::trie::Qp;

/// The chunk directory grows by this factor when it runs out of slots.
const GROWTH_FACTOR: u32 = 2;
/// Directory slots to start with.
pub(crate) const INITIAL_CHUNKS: u32 = 8;

/// Per-chunk bookkeeping, kept apart from the chunk storage itself.
#[derive(Clone, Copy, Default, Debug)]
pub(crate) struct ChunkUsage {
    /// Chunk storage is allocated.
    pub exists: bool,
    /// Sealed by a commit; cells must not be written or zeroed.
    pub immutable: bool,
    /// Referenced by at least one live snapshot.
    pub snapshot: bool,
    /// Mark-sweep scratch flag.
    pub snapmark: bool,
    /// Reclamation ran while a snapshot held the chunk; free it when the
    /// last such snapshot goes away.
    pub snapfree: bool,
    /// High-water mark of allocated cells.
    pub used: u32,
    /// Cells freed within `used`.
    pub free: u32,
    /// Cells of storage actually allocated (the bump chunk shrinks to
    /// `used` when a heavy transaction commits).
    pub cap: u32,
    /// SMR phase this chunk was queued for reclamation in; 0 when live.
    pub phase: u32,
}

impl ChunkUsage {
    pub(crate) fn live(&self) -> u32 {
        self.used - self.free
    }
}

/// The chunk directory: a refcount, a capacity, and that many chunk
/// pointer slots in the same allocation. Committed readers resolve
/// `(chunk, cell)` references through the directory the writer published
/// with their root, so slots are atomics; the writer only ever installs
/// chunks that no published root can reach yet, and replaces the whole
/// directory instead of growing it while readers share it.
#[repr(C, align(8))]
pub(crate) struct QpBase {
    rc: AtomicU32,
    cap: u32,
}

impl QpBase {
    fn layout(cap: u32) -> Layout {
        let (layout, _) = Layout::new::<QpBase>()
            .extend(Layout::array::<AtomicPtr<Node>>(cap as usize).unwrap())
            .unwrap();
        layout.pad_to_align()
    }

    pub(crate) fn create(cap: u32) -> *mut QpBase {
        let layout = QpBase::layout(cap);
        // SAFETY: the layout has non-zero size; zeroed slots are null
        // chunk pointers and a zero refcount is overwritten below.
        unsafe {
            let base = alloc_zeroed(layout) as *mut QpBase;
            if base.is_null() {
                handle_alloc_error(layout);
            }
            (*base).rc = AtomicU32::new(1);
            (*base).cap = cap;
            base
        }
    }

    pub(crate) unsafe fn cap(base: *const QpBase) -> u32 {
        (*base).cap
    }

    unsafe fn slots_ptr(base: *const QpBase) -> *const AtomicPtr<Node> {
        base.add(1) as *const AtomicPtr<Node>
    }

    pub(crate) unsafe fn slot<'a>(base: *const QpBase, chunk: u32) -> &'a AtomicPtr<Node> {
        debug_assert!(chunk < (*base).cap);
        &*QpBase::slots_ptr(base).add(chunk as usize)
    }

    /// Resolves a chunk number for a reader. Slot loads are relaxed: the
    /// release store publishing the reader anchor ordered every slot a
    /// committed root can reach.
    pub(crate) unsafe fn chunk(base: *const QpBase, chunk: u32) -> *mut Node {
        QpBase::slot(base, chunk).load(Relaxed)
    }

    pub(crate) unsafe fn rc_inc(base: *mut QpBase) {
        let mut current = (*base).rc.load(Relaxed);
        loop {
            if current == u32::MAX {
                panic!("max refcount exceeded");
            }
            match (*base)
                .rc
                .compare_exchange(current, current + 1, Relaxed, Relaxed)
            {
                Ok(_) => return,
                Err(v) => current = v,
            }
        }
    }

    pub(crate) unsafe fn rc_dec(base: *mut QpBase) {
        if (*base).rc.fetch_sub(1, Release) != 1 {
            return;
        }
        (*base).rc.load(Acquire);
        dealloc(base as *mut u8, QpBase::layout((*base).cap));
    }

    unsafe fn shared(base: *const QpBase) -> bool {
        (*base).rc.load(Acquire) > 1
    }
}

fn chunk_layout(cap: u32) -> Layout {
    Layout::array::<Node>(cap as usize).unwrap()
}

impl Qp {
    pub(crate) fn chunk_ptr(&self, chunk: u32) -> *mut Node {
        let ptr = unsafe { QpBase::chunk(self.base, chunk) };
        debug_assert!(!ptr.is_null());
        ptr
    }

    pub(crate) fn node_ptr(&self, r: QpRef) -> *mut Node {
        debug_assert!(self.usage[r.chunk() as usize].exists);
        unsafe { self.chunk_ptr(r.chunk()).add(r.cell() as usize) }
    }

    pub(crate) fn node_at(&self, twigs: QpRef, pos: u32) -> *mut Node {
        self.node_ptr(twigs.advance(pos))
    }

    pub(crate) fn read_node(&self, r: QpRef) -> Node {
        unsafe { *self.node_ptr(r) }
    }

    /// A cell is immutable when its chunk was sealed by a commit, or when
    /// it sits below the fender in the bump chunk (frozen carryover from
    /// the previous write transaction).
    pub(crate) fn cells_immutable(&self, r: QpRef) -> bool {
        let chunk = r.chunk();
        if chunk == self.bump {
            self.usage[chunk as usize].immutable || r.cell() < self.fender
        } else {
            self.usage[chunk as usize].immutable
        }
    }

    fn chunk_create(&mut self, chunk: u32) {
        let layout = chunk_layout(QP_CHUNK_SIZE);
        // SAFETY: zeroed storage is valid empty cells (`Node: FromBytes`).
        let ptr = unsafe { alloc_zeroed(layout) as *mut Node };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        unsafe { QpBase::slot(self.base, chunk).store(ptr, Relaxed) };
        self.usage[chunk as usize] = ChunkUsage {
            exists: true,
            cap: QP_CHUNK_SIZE,
            ..ChunkUsage::default()
        };
        tracing::debug!(trie = self.methods.tree_name(), chunk, "chunk allocated");
    }

    fn alloc_chunk_slot(&mut self) -> u32 {
        if let Some(chunk) = self.usage.iter().position(|u| !u.exists) {
            return chunk as u32;
        }
        let chunk = self.usage.len() as u32;
        self.grow_base();
        chunk
    }

    /// Doubles the chunk directory. Grown in place while the writer is
    /// the sole owner; replaced wholesale once readers, a rollback, or a
    /// published anchor share it.
    fn grow_base(&mut self) {
        let old = self.base;
        unsafe {
            let old_cap = QpBase::cap(old);
            let new_cap = old_cap * GROWTH_FACTOR;
            if QpBase::shared(old) {
                let base = QpBase::create(new_cap);
                for chunk in 0..old_cap {
                    let ptr = QpBase::slot(old, chunk).load(Relaxed);
                    QpBase::slot(base, chunk).store(ptr, Relaxed);
                }
                QpBase::rc_dec(old);
                self.base = base;
            } else {
                let new_layout = QpBase::layout(new_cap);
                let base = realloc(old as *mut u8, QpBase::layout(old_cap), new_layout.size())
                    as *mut QpBase;
                if base.is_null() {
                    handle_alloc_error(new_layout);
                }
                let fresh = (QpBase::slots_ptr(base) as *mut AtomicPtr<Node>).add(old_cap as usize);
                ptr::write_bytes(fresh, 0, (new_cap - old_cap) as usize);
                (*base).cap = new_cap;
                self.base = base;
            }
            self.usage.resize(new_cap as usize, ChunkUsage::default());
        }
    }

    /// Starts a fresh bump chunk. If the old bump chunk carries committed
    /// cells below the fender it is sealed outright; the fender cannot
    /// protect a chunk that is no longer the bump chunk.
    pub(crate) fn new_bump(&mut self) {
        let old = self.bump as usize;
        if self.usage[old].exists && !self.usage[old].immutable && self.fender > 0 {
            self.usage[old].immutable = true;
        }
        let chunk = self.alloc_chunk_slot();
        self.chunk_create(chunk);
        self.bump = chunk;
        self.fender = 0;
    }

    /// Hands out `size` contiguous cells in the bump chunk, rotating to a
    /// fresh chunk when the current one cannot fit them.
    pub(crate) fn alloc_twigs(&mut self, size: u32) -> QpRef {
        debug_assert!(size > 0 && size <= QP_CHUNK_SIZE);
        let u = &self.usage[self.bump as usize];
        if u.used + size > u.cap {
            self.new_bump();
        }
        let bump = self.bump;
        let u = &mut self.usage[bump as usize];
        let cell = u.used;
        u.used += size;
        self.used_count += size as u64;
        QpRef::new(bump, cell)
    }

    /// Marks `size` cells free. Mutable cells are zeroed and the call
    /// returns true (the contents are destroyed); immutable cells stay
    /// intact for concurrent readers, are counted as held, and the call
    /// returns false (the contents were duplicated elsewhere).
    pub(crate) fn free_twigs(&mut self, twigs: QpRef, size: u32) -> bool {
        let chunk = twigs.chunk() as usize;
        debug_assert!(self.usage[chunk].exists);
        self.usage[chunk].free += size;
        debug_assert!(self.usage[chunk].free <= self.usage[chunk].used);
        self.free_count += size as u64;
        if self.cells_immutable(twigs) {
            self.hold_count += size as u64;
            false
        } else {
            unsafe { ptr::write_bytes(self.node_ptr(twigs), 0, size as usize) };
            true
        }
    }

    /// Copies a twig vector into fresh bump cells and frees the original.
    /// When the original was immutable the copy duplicates each direct
    /// leaf reference, so the external refcounts are bumped to match; the
    /// stale copies are detached when their chunk is finally torn down.
    pub(crate) fn evacuate_cells(&mut self, old: QpRef, size: u32) -> QpRef {
        let new = self.alloc_twigs(size);
        unsafe {
            ptr::copy_nonoverlapping(self.node_ptr(old), self.node_ptr(new), size as usize);
        }
        if !self.free_twigs(old, size) {
            for pos in 0..size {
                let n = unsafe { *self.node_at(new, pos) };
                if n.is_leaf() {
                    self.methods.attach(n.leaf_pval());
                }
            }
        }
        new
    }

    pub(crate) fn make_root_mutable(&mut self) {
        debug_assert!(self.root.is_valid());
        if self.cells_immutable(self.root) {
            self.root = self.evacuate_cells(self.root, 1);
        }
    }

    /// Evacuates the twig vector of the branch at `np` if it is frozen.
    /// The cell holding `np` itself must already be mutable.
    ///
    /// # Safety
    /// `np` must point at a live branch cell in this trie's chunks.
    pub(crate) unsafe fn make_twigs_mutable(&mut self, np: *mut Node) {
        let n = *np;
        let twigs = n.branch_twigs();
        if self.cells_immutable(twigs) {
            let new = self.evacuate_cells(twigs, n.branch_twig_count());
            *np = n.with_twigs(new);
        }
    }

    /// Gives back the unused tail of the bump chunk's raw storage after a
    /// heavy transaction settled its final size.
    pub(crate) fn shrink_bump(&mut self) {
        let chunk = self.bump;
        let u = self.usage[chunk as usize];
        if u.used == 0 || u.used >= u.cap {
            return;
        }
        unsafe {
            let old = self.chunk_ptr(chunk) as *mut u8;
            let new_size = u.used as usize * size_of::<Node>();
            let ptr = realloc(old, chunk_layout(u.cap), new_size) as *mut Node;
            if ptr.is_null() {
                handle_alloc_error(Layout::array::<Node>(u.used as usize).unwrap());
            }
            QpBase::slot(self.base, chunk).store(ptr, Relaxed);
        }
        self.usage[chunk as usize].cap = u.used;
    }

    /// Returns a chunk's storage, detaching any leaf still recorded in a
    /// cell. Zeroed cells carry no reference, so exactly the outstanding
    /// attaches are undone, whether the cells were live or were stale
    /// immutable copies.
    pub(crate) fn chunk_destroy(&mut self, chunk: u32) {
        let u = self.usage[chunk as usize];
        debug_assert!(u.exists);
        let ptr = self.chunk_ptr(chunk);
        for cell in 0..u.used {
            let n = unsafe { *ptr.add(cell as usize) };
            if n.is_leaf() {
                self.methods.detach(n.leaf_pval());
            }
        }
        unsafe {
            QpBase::slot(self.base, chunk).store(ptr::null_mut(), Relaxed);
            dealloc(ptr as *mut u8, chunk_layout(u.cap));
        }
        self.usage[chunk as usize] = ChunkUsage::default();
        tracing::debug!(trie = self.methods.tree_name(), chunk, "chunk freed");
    }
}
