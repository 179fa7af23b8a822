//! The qp-trie proper: a single-writer trie over chunk storage.
//!
//! `Qp` is used on its own as a standalone trie and doubles as the writer
//! half of [`crate::multi::QpMulti`]. Mutation is copy-on-write at the
//! granularity of twig vectors: a descent that intends to modify a node
//! first evacuates any frozen vector on its path into the bump chunk, so
//! committed cells are never written in place.

mod alloc;
mod gc;

use std::ptr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

pub(crate) use self::alloc::{ChunkUsage, QpBase, INITIAL_CHUNKS};
pub use self::gc::CompactMode;

use crate::key::{key_compare, QpKey};
use crate::name::DnsName;
use crate::node::{prefetch, shift_bit, Node, QpRef};
use crate::QpError;

/// The leaf method vtable. A leaf stores an opaque pointer and a 32-bit
/// integer; everything the trie needs to know about the object behind
/// them comes through these methods. `attach`/`detach` follow every copy
/// the trie creates or destroys, including duplicates made for concurrent
/// readers, so the user object must stay alive until the count drains.
pub trait LeafMethods: Send + Sync {
    /// Takes a reference to the object behind `pval`.
    fn attach(&self, pval: *mut ());
    /// Releases a reference to the object behind `pval`.
    fn detach(&self, pval: *mut ());
    /// Recovers the canonical key of an existing leaf.
    fn leaf_key(&self, pval: *mut (), ival: u32) -> QpKey;
    /// A name for diagnostic logs.
    fn tree_name(&self) -> &str {
        "qp"
    }
}

/// Which kind of transaction last ran; drives how the allocator treats
/// the bump chunk when the next one opens.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TxMode {
    Write,
    Update,
}

/// Running totals for the maintenance passes, in nanoseconds. Relaxed
/// atomics: these are statistics, not synchronization.
#[derive(Default)]
pub(crate) struct QpStats {
    pub compact_ns: AtomicU64,
    pub recycle_ns: AtomicU64,
    pub rollback_ns: AtomicU64,
}

/// A snapshot of the maintenance timers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QpTimers {
    pub compact_ns: u64,
    pub recycle_ns: u64,
    pub rollback_ns: u64,
}

/// Memory accounting for a trie, in cells except where noted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QpMemUsage {
    /// Leaves present in the trie.
    pub leaves: u64,
    /// Cells in use and not freed.
    pub live: u64,
    /// Cells allocated below the chunks' high-water marks.
    pub used: u64,
    /// Freed cells, including held ones.
    pub free: u64,
    /// Freed cells pinned by immutability until reclamation.
    pub hold: u64,
    /// Live chunks (allocated and not queued for reclamation).
    pub chunk_count: usize,
    /// Total heap footprint of chunk storage and the directory.
    pub bytes: usize,
}

/// A single-writer qp-trie.
pub struct Qp {
    pub(crate) root: QpRef,
    pub(crate) base: *mut QpBase,
    pub(crate) usage: Vec<ChunkUsage>,
    pub(crate) bump: u32,
    pub(crate) fender: u32,
    pub(crate) leaf_count: u64,
    pub(crate) used_count: u64,
    pub(crate) free_count: u64,
    pub(crate) hold_count: u64,
    pub(crate) mode: TxMode,
    pub(crate) compact_all: bool,
    pub(crate) methods: Arc<dyn LeafMethods>,
    pub(crate) stats: Arc<QpStats>,
}

// SAFETY: Qp owns its chunks and directory reference outright; the raw
// pointers are not shared except through the multi-reader machinery, which
// carries its own synchronization.
unsafe impl Send for Qp {}

impl Qp {
    pub fn new(methods: Arc<dyn LeafMethods>) -> Qp {
        let mut qp = Qp {
            root: QpRef::INVALID,
            base: QpBase::create(INITIAL_CHUNKS),
            usage: vec![ChunkUsage::default(); INITIAL_CHUNKS as usize],
            bump: 0,
            fender: 0,
            leaf_count: 0,
            used_count: 0,
            free_count: 0,
            hold_count: 0,
            mode: TxMode::Write,
            compact_all: false,
            methods,
            stats: Arc::new(QpStats::default()),
        };
        qp.new_bump();
        qp
    }

    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// Inserts a leaf. The key is recovered from the leaf itself via
    /// [`LeafMethods::leaf_key`]. `pval` must be non-null and 2-aligned
    /// (bit 0 is the branch tag).
    pub fn insert(&mut self, pval: *mut (), ival: u32) -> Result<(), QpError> {
        assert!(
            !pval.is_null() && pval as usize & 1 == 0,
            "leaf pointers must be non-null and even"
        );
        let key = self.methods.leaf_key(pval, ival);

        if !self.root.is_valid() {
            let r = self.alloc_twigs(1);
            unsafe { *self.node_ptr(r) = Node::leaf(pval, ival) };
            self.methods.attach(pval);
            self.root = r;
            self.leaf_count += 1;
            return Ok(());
        }

        // First pass, read-only: find any leaf that agrees with the new
        // key as far as the existing branches discriminate. Where the
        // key's shift is absent, any twig will do (all leaves below this
        // branch agree at earlier offsets).
        let mut n = self.read_node(self.root);
        while n.is_branch() {
            let shift = n.branch_keybit(&key);
            let pos = if n.branch_has_twig(shift) {
                n.branch_twig_pos(shift)
            } else {
                0
            };
            n = unsafe { *self.node_at(n.branch_twigs(), pos) };
        }
        let found = self.methods.leaf_key(n.leaf_pval(), n.leaf_ival());
        let Some(offset) = key_compare(&key, &found) else {
            return Err(QpError::Exists);
        };
        let new_shift = key.bit(offset);
        let old_shift = found.bit(offset);
        debug_assert_ne!(new_shift, old_shift);

        // Second pass: descend again along the new key, unfreezing every
        // twig vector on the way, and splice the leaf in at the node
        // whose offset passes the first difference.
        self.make_root_mutable();
        let mut np = self.node_ptr(self.root);
        let destroyed;
        unsafe {
            loop {
                let n = *np;
                if n.is_branch() && n.branch_key_offset() < offset {
                    prefetch(self.node_ptr(n.branch_twigs()));
                    self.make_twigs_mutable(np);
                    let n = *np;
                    let shift = n.branch_keybit(&key);
                    debug_assert!(n.branch_has_twig(shift));
                    np = self.node_at(n.branch_twigs(), n.branch_twig_pos(shift));
                    continue;
                }
                if n.is_branch() && n.branch_key_offset() == offset {
                    destroyed = self.grow_branch(np, new_shift, pval, ival);
                } else {
                    self.new_branch(np, offset, new_shift, old_shift, pval, ival);
                    destroyed = false;
                }
                break;
            }
        }
        self.methods.attach(pval);
        self.leaf_count += 1;
        if destroyed {
            self.auto_gc();
        }
        Ok(())
    }

    /// Splits the subtree at `np` with a fresh two-twig branch holding the
    /// old node and the new leaf in shift order.
    unsafe fn new_branch(
        &mut self,
        np: *mut Node,
        offset: usize,
        new_shift: u8,
        old_shift: u8,
        pval: *mut (),
        ival: u32,
    ) {
        let old = *np;
        let twigs = self.alloc_twigs(2);
        let leaf = Node::leaf(pval, ival);
        let tp = self.node_ptr(twigs);
        if new_shift < old_shift {
            *tp = leaf;
            *tp.add(1) = old;
        } else {
            *tp = old;
            *tp.add(1) = leaf;
        }
        *np = Node::branch(shift_bit(new_shift) | shift_bit(old_shift), offset, twigs);
    }

    /// Widens the branch at `np` by one twig. Returns whether the old
    /// vector was destroyed (as opposed to duplicated for readers).
    unsafe fn grow_branch(
        &mut self,
        np: *mut Node,
        new_shift: u8,
        pval: *mut (),
        ival: u32,
    ) -> bool {
        let n = *np;
        debug_assert!(!n.branch_has_twig(new_shift));
        let size = n.branch_twig_count();
        let pos = n.branch_twig_pos(new_shift);
        let old = n.branch_twigs();
        let new = self.alloc_twigs(size + 1);
        let src = self.node_ptr(old);
        let dst = self.node_ptr(new);
        ptr::copy_nonoverlapping(src, dst, pos as usize);
        *dst.add(pos as usize) = Node::leaf(pval, ival);
        ptr::copy_nonoverlapping(
            src.add(pos as usize),
            dst.add(pos as usize + 1),
            (size - pos) as usize,
        );
        *np = Node::branch(
            n.branch_bitmap() | shift_bit(new_shift),
            n.branch_key_offset(),
            new,
        );
        let destroyed = self.free_twigs(old, size);
        if !destroyed {
            for i in 0..=size {
                if i == pos {
                    continue;
                }
                let t = *dst.add(i as usize);
                if t.is_leaf() {
                    self.methods.attach(t.leaf_pval());
                }
            }
        }
        destroyed
    }

    pub fn delete_by_name(&mut self, name: &DnsName) -> Result<(), QpError> {
        self.delete_by_key(&QpKey::from_name(name))
    }

    /// Removes the leaf with exactly this key. A branch left with a
    /// single twig is collapsed into that twig.
    pub fn delete_by_key(&mut self, key: &QpKey) -> Result<(), QpError> {
        if !self.root.is_valid() {
            return Err(QpError::NotFound);
        }
        self.make_root_mutable();
        unsafe {
            let mut parent: *mut Node = ptr::null_mut();
            let mut np = self.node_ptr(self.root);
            loop {
                let n = *np;
                if !n.is_branch() {
                    break;
                }
                let shift = n.branch_keybit(key);
                if !n.branch_has_twig(shift) {
                    return Err(QpError::NotFound);
                }
                prefetch(self.node_ptr(n.branch_twigs()));
                self.make_twigs_mutable(np);
                let n = *np;
                parent = np;
                np = self.node_at(n.branch_twigs(), n.branch_twig_pos(shift));
            }
            let leaf = *np;
            let found = self.methods.leaf_key(leaf.leaf_pval(), leaf.leaf_ival());
            if key_compare(key, &found).is_some() {
                return Err(QpError::NotFound);
            }
            self.methods.detach(leaf.leaf_pval());
            self.leaf_count -= 1;

            let destroyed;
            if parent.is_null() {
                destroyed = self.free_twigs(self.root, 1);
                self.root = QpRef::INVALID;
            } else {
                let p = *parent;
                let size = p.branch_twig_count();
                let shift = p.branch_keybit(key);
                let pos = p.branch_twig_pos(shift);
                let twigs = p.branch_twigs();
                if size == 2 {
                    // A one-twig branch is not allowed to exist: replace
                    // the parent with the surviving twig.
                    let survivor = *self.node_at(twigs, 1 - pos);
                    *parent = survivor;
                    destroyed = self.free_twigs(twigs, 2);
                } else {
                    // Shrink in place and free the trailing cell; the
                    // descent made the vector mutable.
                    let tp = self.node_ptr(twigs);
                    ptr::copy(
                        tp.add(pos as usize + 1),
                        tp.add(pos as usize),
                        (size - pos - 1) as usize,
                    );
                    *parent = Node::branch(
                        p.branch_bitmap() & !shift_bit(shift),
                        p.branch_key_offset(),
                        twigs,
                    );
                    destroyed = self.free_twigs(twigs.advance(size - 1), 1);
                }
            }
            if destroyed {
                self.auto_gc();
            }
        }
        Ok(())
    }

    pub fn get_by_name(&self, name: &DnsName) -> Option<(*mut (), u32)> {
        self.get_by_key(&QpKey::from_name(name))
    }

    pub fn get_by_key(&self, key: &QpKey) -> Option<(*mut (), u32)> {
        lookup_leaf(|c| self.chunk_ptr(c), self.root, &*self.methods, key)
    }

    /// Walks the leaves in key order, which is DNS canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (*mut (), u32)> + '_ {
        LeafIter::new(|c| self.chunk_ptr(c), self.root)
    }

    pub fn memusage(&self) -> QpMemUsage {
        let mut chunk_count = 0;
        let mut bytes = 0;
        for u in &self.usage {
            if u.exists {
                bytes += u.cap as usize * std::mem::size_of::<Node>();
                if u.phase == 0 && !u.snapfree {
                    chunk_count += 1;
                }
            }
        }
        bytes += self.usage.len() * std::mem::size_of::<*mut Node>();
        QpMemUsage {
            leaves: self.leaf_count,
            live: self.used_count - self.free_count,
            used: self.used_count,
            free: self.free_count,
            hold: self.hold_count,
            chunk_count,
            bytes,
        }
    }

    pub fn timers(&self) -> QpTimers {
        QpTimers {
            compact_ns: self.stats.compact_ns.load(Relaxed),
            recycle_ns: self.stats.recycle_ns.load(Relaxed),
            rollback_ns: self.stats.rollback_ns.load(Relaxed),
        }
    }

    /// Checks the counter invariants against `usage[]`; test support.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn assert_counters(&self) {
        let mut used = 0u64;
        let mut free = 0u64;
        for u in &self.usage {
            if u.exists && u.phase == 0 && !u.snapfree {
                used += u.used as u64;
                free += u.free as u64;
            }
        }
        assert_eq!(used, self.used_count);
        assert_eq!(free, self.free_count);
        assert!(self.free_count <= self.used_count);
        assert!(self.hold_count <= self.free_count);
    }
}

impl Drop for Qp {
    fn drop(&mut self) {
        for chunk in 0..self.usage.len() as u32 {
            if self.usage[chunk as usize].exists {
                self.chunk_destroy(chunk);
            }
        }
        unsafe { QpBase::rc_dec(self.base) };
    }
}

/// Exact-match lookup over any chunk resolver: the writer's directory, a
/// published reader anchor, or a snapshot's pinned pointer array.
pub(crate) fn lookup_leaf<F>(
    chunk_at: F,
    root: QpRef,
    methods: &dyn LeafMethods,
    key: &QpKey,
) -> Option<(*mut (), u32)>
where
    F: Fn(u32) -> *mut Node,
{
    if !root.is_valid() {
        return None;
    }
    let mut n = unsafe { *chunk_at(root.chunk()).add(root.cell() as usize) };
    while n.is_branch() {
        let shift = n.branch_keybit(key);
        if !n.branch_has_twig(shift) {
            return None;
        }
        let twigs = n.branch_twigs();
        let tp = unsafe { chunk_at(twigs.chunk()).add(twigs.cell() as usize) };
        prefetch(tp);
        n = unsafe { *tp.add(n.branch_twig_pos(shift) as usize) };
    }
    let found = methods.leaf_key(n.leaf_pval(), n.leaf_ival());
    if key_compare(key, &found).is_none() {
        Some((n.leaf_pval(), n.leaf_ival()))
    } else {
        None
    }
}

/// Depth-first twig-order traversal yielding leaves in key order.
pub(crate) struct LeafIter<F> {
    chunk_at: F,
    next: Option<Node>,
    stack: Vec<(Node, u32)>,
}

impl<F: Fn(u32) -> *mut Node> LeafIter<F> {
    pub(crate) fn new(chunk_at: F, root: QpRef) -> Self {
        let next = if root.is_valid() {
            Some(unsafe { *chunk_at(root.chunk()).add(root.cell() as usize) })
        } else {
            None
        };
        LeafIter {
            chunk_at,
            next,
            stack: Vec::new(),
        }
    }
}

impl<F: Fn(u32) -> *mut Node> Iterator for LeafIter<F> {
    type Item = (*mut (), u32);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(n) = self.next.take() {
                if n.is_branch() {
                    self.stack.push((n, 0));
                    continue;
                }
                return Some((n.leaf_pval(), n.leaf_ival()));
            }
            let (branch, pos) = self.stack.last_mut()?;
            if *pos == branch.branch_twig_count() {
                self.stack.pop();
                continue;
            }
            let twig = branch.branch_twigs().advance(*pos);
            *pos += 1;
            self.next = Some(unsafe { *(self.chunk_at)(twig.chunk()).add(twig.cell() as usize) });
        }
    }
}
