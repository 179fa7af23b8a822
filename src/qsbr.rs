//! Quiescent-state-based reclamation.
//!
//! Readers register once per thread and periodically declare a quiescent
//! state: a point where they hold no references into shared trie memory.
//! Writers stamp retired memory with the phase current at retirement; the
//! phase has drained once every registered reader has declared quiescence
//! after the phase moved on, and only then do the reclaim callbacks run.
//!
//! A [`QsbrReader`] declares quiescence through `&mut self`, so a query
//! view borrowing the handle statically cannot span a quiescent state.

use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

/// An SMR epoch. Phase 0 is reserved for "not retired".
pub type Phase = u32;

/// Work queued for a drained phase. `reclaim` frees everything retired at
/// or before `upto` and returns whether work for a later phase remains,
/// in which case it is queued again.
pub trait Reclaimer: Send + Sync {
    fn reclaim(&self, upto: Phase) -> bool;
}

struct ReaderSlot {
    /// The last phase this reader went quiescent in.
    counter: AtomicU32,
}

/// The reclamation domain. One per process is typical; tries attached to
/// different domains never wait on each other's readers.
pub struct Qsbr {
    phase: AtomicU32,
    readers: Mutex<Vec<Arc<ReaderSlot>>>,
    pending: Mutex<Vec<(Phase, Arc<dyn Reclaimer>)>>,
}

impl Qsbr {
    pub fn new() -> Arc<Qsbr> {
        Arc::new(Qsbr {
            phase: AtomicU32::new(1),
            readers: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
        })
    }

    /// The phase to stamp on memory retired now.
    pub fn phase(&self) -> Phase {
        self.phase.load(Acquire)
    }

    /// Registers the calling thread as a reader. Readers that stop
    /// calling [`QsbrReader::quiescent`] stall reclamation until the
    /// handle is dropped.
    pub fn register(self: &Arc<Self>) -> QsbrReader {
        let slot = Arc::new(ReaderSlot {
            counter: AtomicU32::new(self.phase()),
        });
        self.readers.lock().unwrap().push(slot.clone());
        QsbrReader {
            qsbr: self.clone(),
            slot,
        }
    }

    /// Queues `work` for the end of `phase`'s grace period and moves the
    /// global phase past it, so future quiescent states count toward the
    /// drain.
    pub fn activate(&self, phase: Phase, work: Arc<dyn Reclaimer>) {
        self.pending.lock().unwrap().push((phase, work));
        self.phase.fetch_max(phase + 1, AcqRel);
    }

    /// Runs reclaim callbacks for every drained phase. Called from
    /// quiescent states; hosts with an idle loop can also call it there.
    pub fn poll(&self) {
        let current = self.phase.load(Acquire);
        let oldest = {
            let readers = self.readers.lock().unwrap();
            readers
                .iter()
                .map(|slot| slot.counter.load(Acquire))
                .min()
                .unwrap_or(current)
        };
        // Phases strictly below every reader's last quiescent state have
        // drained: no reader can still hold memory retired in them.
        let drained = oldest.min(current).saturating_sub(1);
        if drained == 0 {
            return;
        }
        let ready: Vec<_> = {
            let mut pending = self.pending.lock().unwrap();
            let mut ready = Vec::new();
            pending.retain(|(phase, work)| {
                if *phase <= drained {
                    ready.push(work.clone());
                    false
                } else {
                    true
                }
            });
            ready
        };
        for work in ready {
            if work.reclaim(drained) {
                self.pending.lock().unwrap().push((drained + 1, work));
            }
        }
    }
}

/// A registered reader thread. Dropping the handle deregisters it.
pub struct QsbrReader {
    qsbr: Arc<Qsbr>,
    slot: Arc<ReaderSlot>,
}

impl QsbrReader {
    /// Whether this reader registered with the given domain.
    pub fn in_domain(&self, qsbr: &Arc<Qsbr>) -> bool {
        Arc::ptr_eq(&self.qsbr, qsbr)
    }

    /// Declares a quiescent state: the calling thread holds no references
    /// into memory protected by this domain. Borrowing rules enforce that
    /// for query views created from this handle.
    pub fn quiescent(&mut self) {
        self.slot
            .counter
            .store(self.qsbr.phase.load(Acquire), Release);
        self.qsbr.poll();
    }
}

impl Drop for QsbrReader {
    fn drop(&mut self) {
        let mut readers = self.qsbr.readers.lock().unwrap();
        readers.retain(|slot| !Arc::ptr_eq(slot, &self.slot));
        drop(readers);
        self.qsbr.poll();
    }
}
