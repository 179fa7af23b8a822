//! The concurrent trie: one writer, many readers.
//!
//! A `QpMulti` owns a writer trie behind a mutex and publishes committed
//! versions through a single atomic pointer to a packed "anchor" cell
//! holding the chunk directory and the root reference. Query readers
//! load-acquire the anchor and walk immutable chunks with no further
//! synchronization; they are protected by QSBR. Snapshots are explicit
//! strong references that pin their chunks across any number of commits.

use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;
use std::time::Instant;

use crate::key::QpKey;
use crate::name::DnsName;
use crate::node::{Node, QpRef};
use crate::qsbr::{Phase, Qsbr, QsbrReader, Reclaimer};
use crate::trie::{
    lookup_leaf, ChunkUsage, CompactMode, LeafIter, LeafMethods, Qp, QpBase, QpMemUsage, QpTimers,
    TxMode,
};

/// Writer state saved when a heavy transaction opens, enough to put the
/// trie back exactly as it was. Chunks allocated after the save are the
/// transaction's own and are simply discarded on rollback.
struct RollbackState {
    root: QpRef,
    base: *mut QpBase,
    usage: Vec<ChunkUsage>,
    bump: u32,
    fender: u32,
    leaf_count: u64,
    used_count: u64,
    free_count: u64,
    hold_count: u64,
    compact_all: bool,
}

struct SnapInner {
    root: QpRef,
    /// Chunk pointers indexed by chunk number; null where the snapshot
    /// references nothing.
    chunks: Vec<*mut Node>,
}

// SAFETY: a snapshot's chunks are immutable for its whole lifetime; the
// writer neither writes nor frees them until mark-sweep proves no
// snapshot is left.
unsafe impl Send for SnapInner {}
unsafe impl Sync for SnapInner {}

struct MultiShared {
    writer: Qp,
    /// The anchor cell the current `reader` pointer refers to.
    reader_ref: QpRef,
    rollback: Option<Box<RollbackState>>,
    snapshots: Vec<Arc<SnapInner>>,
    /// Directory references retired by commits, released once their phase
    /// drains (readers may still be walking the old directory).
    retired: Vec<(Phase, *mut QpBase)>,
}

// SAFETY: everything behind the raw pointers is owned by this structure
// or shared only through the reader protocol, which has its own ordering.
unsafe impl Send for MultiShared {}

struct MultiInner {
    shared: Mutex<MultiShared>,
    /// Published anchor; null until the first commit.
    reader: AtomicPtr<Node>,
    methods: Arc<dyn LeafMethods>,
    qsbr: Arc<Qsbr>,
}

/// A qp-trie shared between one writer and any number of readers.
pub struct QpMulti {
    inner: Arc<MultiInner>,
}

impl QpMulti {
    pub fn new(qsbr: Arc<Qsbr>, methods: Arc<dyn LeafMethods>) -> QpMulti {
        QpMulti {
            inner: Arc::new(MultiInner {
                shared: Mutex::new(MultiShared {
                    writer: Qp::new(methods.clone()),
                    reader_ref: QpRef::INVALID,
                    rollback: None,
                    snapshots: Vec::new(),
                    retired: Vec::new(),
                }),
                reader: AtomicPtr::new(ptr::null_mut()),
                methods,
                qsbr,
            }),
        }
    }

    /// Opens a light write transaction. Commits on drop; a light write
    /// has no rollback state.
    pub fn write(&self) -> WriteTx<'_> {
        let mut shared = self.inner.shared.lock().unwrap();
        let qp = &mut shared.writer;
        transaction_open(qp);
        if qp.mode == TxMode::Write && qp.usage[qp.bump as usize].exists {
            // Consecutive light writes keep growing the same bump chunk;
            // the fender guards the previously committed prefix.
            qp.usage[qp.bump as usize].immutable = false;
            qp.fender = qp.usage[qp.bump as usize].used;
        } else {
            qp.new_bump();
        }
        qp.mode = TxMode::Write;
        WriteTx {
            inner: &self.inner,
            shared,
            done: false,
        }
    }

    /// Opens a heavy update transaction: rollback-capable, and its commit
    /// compacts and trims allocations. Rolls back on drop.
    pub fn update(&self) -> UpdateTx<'_> {
        let mut shared = self.inner.shared.lock().unwrap();
        {
            let shared = &mut *shared;
            let qp = &mut shared.writer;
            transaction_open(qp);
            // The rollback copy shares the directory, which pins it: any
            // growth during the transaction must swap in a fresh one.
            unsafe { QpBase::rc_inc(qp.base) };
            shared.rollback = Some(Box::new(RollbackState {
                root: qp.root,
                base: qp.base,
                usage: qp.usage.clone(),
                bump: qp.bump,
                fender: qp.fender,
                leaf_count: qp.leaf_count,
                used_count: qp.used_count,
                free_count: qp.free_count,
                hold_count: qp.hold_count,
                compact_all: qp.compact_all,
            }));
            // A fresh bump chunk makes every allocation of this
            // transaction land in chunks rollback can simply discard.
            qp.new_bump();
            qp.mode = TxMode::Update;
        }
        UpdateTx {
            inner: &self.inner,
            shared,
            done: false,
        }
    }

    /// Opens a zero-cost read-only view of the latest committed version.
    /// The view borrows the calling thread's QSBR registration, so the
    /// thread cannot declare quiescence while the view is live.
    pub fn query<'a>(&'a self, reader: &'a QsbrReader) -> QpRead<'a> {
        assert!(
            reader.in_domain(&self.inner.qsbr),
            "reader registered with a different reclamation domain"
        );
        let anchor = self.inner.reader.load(Acquire);
        let (base, root) = if anchor.is_null() {
            (ptr::null(), QpRef::INVALID)
        } else {
            // SAFETY: the anchor cell is immutable while published and
            // QSBR keeps it allocated while this thread stays active.
            let cell = unsafe { *anchor };
            (
                (cell.hi() & !1) as *const QpBase,
                QpRef::from_raw(cell.lo() as u32),
            )
        };
        QpRead {
            base,
            root,
            methods: &*self.inner.methods,
            tid: std::thread::current().id(),
        }
    }

    /// Pins the latest committed version. The snapshot keeps every chunk
    /// it references allocated until it is dropped, no matter how many
    /// commits happen in between.
    pub fn snapshot(&self) -> QpSnap<'_> {
        let mut shared = self.inner.shared.lock().unwrap();
        let shared = &mut *shared;
        let qp = &mut shared.writer;
        let mut chunks = vec![ptr::null_mut(); qp.usage.len()];
        for chunk in 0..qp.usage.len() {
            let u = qp.usage[chunk];
            if u.exists && u.phase == 0 && u.live() > 0 {
                chunks[chunk] = qp.chunk_ptr(chunk as u32);
                qp.usage[chunk].snapshot = true;
            }
        }
        let inner = Arc::new(SnapInner {
            root: qp.root,
            chunks,
        });
        shared.snapshots.push(inner.clone());
        tracing::trace!(
            trie = self.inner.methods.tree_name(),
            leaves = qp.leaf_count,
            "snapshot taken"
        );
        QpSnap { multi: self, inner }
    }

    pub fn memusage(&self) -> QpMemUsage {
        self.inner.shared.lock().unwrap().writer.memusage()
    }

    pub fn timers(&self) -> QpTimers {
        self.inner.shared.lock().unwrap().writer.timers()
    }
}

fn transaction_open(qp: &mut Qp) {
    // Seal everything, the bump chunk included: cells from before this
    // transaction must survive for readers of the committed version.
    for u in qp.usage.iter_mut() {
        if u.exists {
            u.immutable = true;
        }
    }
    // Only space freed from here on counts toward the auto-GC heuristic.
    qp.hold_count = qp.free_count;
}

fn commit_locked(inner: &Arc<MultiInner>, shared: &mut MultiShared) {
    let mode = shared.writer.mode;
    if let Some(rb) = shared.rollback.take() {
        unsafe { QpBase::rc_dec(rb.base) };
    }
    // Retire the previous anchor. The cell is immutable (sealed or below
    // the fender), so freeing it leaves the contents for readers that
    // loaded the old pointer; its directory reference is released only
    // after the grace period.
    let mut retired_base = None;
    if shared.reader_ref.is_valid() {
        let anchor = shared.writer.read_node(shared.reader_ref);
        retired_base = Some((anchor.hi() & !1) as *mut QpBase);
        shared.writer.free_twigs(shared.reader_ref, 1);
    }
    if mode == TxMode::Update {
        shared.writer.compact_pass(CompactMode::Maybe);
    }
    let anchor = shared.writer.alloc_twigs(1);
    if mode == TxMode::Update {
        shared.writer.shrink_bump();
    }
    unsafe {
        QpBase::rc_inc(shared.writer.base);
        // Tagged like a branch so chunk teardown never takes the
        // directory pointer for a leaf.
        *shared.writer.node_ptr(anchor) = Node::pair(
            shared.writer.base as u64 | 1,
            shared.writer.root.raw() as u64,
        );
    }
    shared.reader_ref = anchor;
    inner
        .reader
        .store(shared.writer.node_ptr(anchor), Release);
    if mode == TxMode::Update || shared.writer.needgc() {
        shared.writer.recycle();
    }
    let phase = inner.qsbr.phase();
    let deferred = shared.writer.defer_chunk_reclamation(phase);
    if let Some(base) = retired_base {
        shared.retired.push((phase, base));
    }
    if deferred || !shared.retired.is_empty() {
        inner.qsbr.activate(phase, inner.clone());
    }
    #[cfg(debug_assertions)]
    shared.writer.assert_counters();
    tracing::trace!(
        trie = inner.methods.tree_name(),
        leaves = shared.writer.leaf_count,
        phase,
        "committed"
    );
}

fn rollback_locked(shared: &mut MultiShared) {
    let start = Instant::now();
    let rb = *shared.rollback.take().expect("open update transaction");
    let qp = &mut shared.writer;
    // Chunks that did not exist when the transaction opened are its own.
    for chunk in 0..qp.usage.len() as u32 {
        let pre_existing =
            (chunk as usize) < rb.usage.len() && rb.usage[chunk as usize].exists;
        if qp.usage[chunk as usize].exists && !pre_existing {
            qp.chunk_destroy(chunk);
        }
    }
    if qp.base != rb.base {
        unsafe { QpBase::rc_dec(qp.base) };
    }
    qp.root = rb.root;
    qp.base = rb.base;
    qp.usage = rb.usage;
    qp.bump = rb.bump;
    qp.fender = rb.fender;
    qp.leaf_count = rb.leaf_count;
    qp.used_count = rb.used_count;
    qp.free_count = rb.free_count;
    qp.hold_count = rb.hold_count;
    qp.compact_all = rb.compact_all;
    qp.stats.rollback_ns.fetch_add(
        start.elapsed().as_nanos() as u64,
        std::sync::atomic::Ordering::Relaxed,
    );
    tracing::trace!(trie = qp.methods.tree_name(), "rolled back");
}

impl Reclaimer for MultiInner {
    fn reclaim(&self, upto: Phase) -> bool {
        let mut shared = self.shared.lock().unwrap();
        let shared = &mut *shared;
        let mut later = shared.writer.reclaim_chunks(upto);
        let mut kept = Vec::new();
        for (phase, base) in shared.retired.drain(..) {
            if phase <= upto {
                unsafe { QpBase::rc_dec(base) };
            } else {
                kept.push((phase, base));
            }
        }
        shared.retired = kept;
        later | !shared.retired.is_empty()
    }
}

impl Drop for MultiInner {
    fn drop(&mut self) {
        // No readers or snapshots can outlive the multi (they borrow it),
        // so the deferred releases can happen immediately. The writer's
        // own drop then tears down chunks and its directory reference.
        let shared = self.shared.get_mut().unwrap();
        for (_, base) in shared.retired.drain(..) {
            unsafe { QpBase::rc_dec(base) };
        }
        if shared.reader_ref.is_valid() {
            unsafe { QpBase::rc_dec(shared.writer.base) };
        }
    }
}

/// A light write transaction. Dereferences to [`Qp`] for the trie
/// operations; commits on drop.
pub struct WriteTx<'a> {
    inner: &'a Arc<MultiInner>,
    shared: MutexGuard<'a, MultiShared>,
    done: bool,
}

impl WriteTx<'_> {
    pub fn commit(mut self) {
        commit_locked(self.inner, &mut self.shared);
        self.done = true;
    }
}

impl Deref for WriteTx<'_> {
    type Target = Qp;
    fn deref(&self) -> &Qp {
        &self.shared.writer
    }
}

impl DerefMut for WriteTx<'_> {
    fn deref_mut(&mut self) -> &mut Qp {
        &mut self.shared.writer
    }
}

impl Drop for WriteTx<'_> {
    fn drop(&mut self) {
        if !self.done {
            commit_locked(self.inner, &mut self.shared);
        }
    }
}

/// A heavy update transaction. Dereferences to [`Qp`]; rolls back on drop
/// unless committed.
pub struct UpdateTx<'a> {
    inner: &'a Arc<MultiInner>,
    shared: MutexGuard<'a, MultiShared>,
    done: bool,
}

impl UpdateTx<'_> {
    pub fn commit(mut self) {
        commit_locked(self.inner, &mut self.shared);
        self.done = true;
    }

    /// Puts the trie back exactly as it was when the transaction opened.
    pub fn rollback(mut self) {
        rollback_locked(&mut self.shared);
        self.done = true;
    }
}

impl Deref for UpdateTx<'_> {
    type Target = Qp;
    fn deref(&self) -> &Qp {
        &self.shared.writer
    }
}

impl DerefMut for UpdateTx<'_> {
    fn deref_mut(&mut self) -> &mut Qp {
        &mut self.shared.writer
    }
}

impl Drop for UpdateTx<'_> {
    fn drop(&mut self) {
        if !self.done {
            rollback_locked(&mut self.shared);
        }
    }
}

/// A zero-cost read-only view of a committed version, valid on the
/// creating thread until it next declares quiescence.
pub struct QpRead<'a> {
    base: *const QpBase,
    root: QpRef,
    methods: &'a dyn LeafMethods,
    tid: ThreadId,
}

impl QpRead<'_> {
    fn check_thread(&self) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.tid,
            "query view used from another thread"
        );
    }

    pub fn get_by_name(&self, name: &DnsName) -> Option<(*mut (), u32)> {
        self.get_by_key(&QpKey::from_name(name))
    }

    pub fn get_by_key(&self, key: &QpKey) -> Option<(*mut (), u32)> {
        self.check_thread();
        if self.base.is_null() {
            return None;
        }
        lookup_leaf(
            |c| unsafe { QpBase::chunk(self.base, c) },
            self.root,
            self.methods,
            key,
        )
    }

    /// Walks the committed leaves in key order.
    pub fn iter(&self) -> impl Iterator<Item = (*mut (), u32)> + '_ {
        self.check_thread();
        let root = if self.base.is_null() {
            QpRef::INVALID
        } else {
            self.root
        };
        LeafIter::new(|c| unsafe { QpBase::chunk(self.base, c) }, root)
    }
}

/// A pinned snapshot of a committed version. Dropping it releases the
/// pinned chunks via mark-sweep.
pub struct QpSnap<'a> {
    multi: &'a QpMulti,
    inner: Arc<SnapInner>,
}

impl QpSnap<'_> {
    fn chunk_at(&self, chunk: u32) -> *mut Node {
        let ptr = self.inner.chunks[chunk as usize];
        debug_assert!(!ptr.is_null());
        ptr
    }

    pub fn get_by_name(&self, name: &DnsName) -> Option<(*mut (), u32)> {
        self.get_by_key(&QpKey::from_name(name))
    }

    pub fn get_by_key(&self, key: &QpKey) -> Option<(*mut (), u32)> {
        lookup_leaf(
            |c| self.chunk_at(c),
            self.inner.root,
            &*self.multi.inner.methods,
            key,
        )
    }

    /// Walks the snapshot's leaves in key order. This is the zone-walk
    /// surface: the snapshot stays valid however long the walk takes.
    pub fn iter(&self) -> impl Iterator<Item = (*mut (), u32)> + '_ {
        LeafIter::new(|c| self.chunk_at(c), self.inner.root)
    }
}

impl Drop for QpSnap<'_> {
    fn drop(&mut self) {
        let mut shared = self.multi.inner.shared.lock().unwrap();
        let shared = &mut *shared;
        shared.snapshots.retain(|s| !Arc::ptr_eq(s, &self.inner));
        let remaining: Vec<&[*mut Node]> = shared
            .snapshots
            .iter()
            .map(|s| s.chunks.as_slice())
            .collect();
        shared.writer.marksweep_chunks(remaining);
    }
}
