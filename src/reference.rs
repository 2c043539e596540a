//! Soft and weak reference processing.
//!
//! References are registered with a generation's processor. Soft referents
//! are kept alive by marking unless the soft-reference policy says to clear
//! them; weak referents never are. After marking, references whose referent
//! died are cleared and queued as pending, references whose referent moves
//! are updated to the new copy.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use log::debug;
use parking_lot::RwLock;

use crate::{
    cycle::closures::{EvacUpdateCleanupClosure, SlotOutcome},
    heap::Heap,
    types::ObjRef,
    workers::GangTask,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceKind {
    Soft,
    Weak,
}

#[derive(Debug)]
pub struct Reference {
    kind: ReferenceKind,
    referent: AtomicUsize,
}

impl Reference {
    pub fn kind(&self) -> ReferenceKind {
        self.kind
    }

    pub fn get(&self) -> Option<ObjRef> {
        ObjRef::from_raw(self.referent.load(Ordering::Acquire))
    }

    pub fn referent_slot(&self) -> &AtomicUsize {
        &self.referent
    }
}

#[derive(Default)]
pub struct ReferenceProcessor {
    references: RwLock<Vec<Arc<Reference>>>,
    clear_soft_refs: AtomicBool,
    /// Per-worker references cleared in the current pass.
    discovered: DashMap<usize, Vec<Arc<Reference>>>,
    pending: SegQueue<Arc<Reference>>,
    claim: AtomicUsize,
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: ReferenceKind, referent: ObjRef) -> Arc<Reference> {
        let reference = Arc::new(Reference {
            kind,
            referent: AtomicUsize::new(referent.addr()),
        });
        self.references.write().push(Arc::clone(&reference));
        reference
    }

    pub fn len(&self) -> usize {
        self.references.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset_thread_locals(&self) {
        self.discovered.clear();
        self.claim.store(0, Ordering::Release);
    }

    pub fn set_soft_reference_policy(&self, clear_all: bool) {
        self.clear_soft_refs.store(clear_all, Ordering::Release);
    }

    pub fn clears_soft_references(&self) -> bool {
        self.clear_soft_refs.load(Ordering::Acquire)
    }

    /// Soft referents marking must treat as strong under the current policy.
    pub fn soft_referents(&self) -> Vec<ObjRef> {
        if self.clears_soft_references() {
            return Vec::new();
        }
        self.references
            .read()
            .iter()
            .filter(|r| r.kind == ReferenceKind::Soft)
            .filter_map(|r| r.get())
            .collect()
    }

    /// Clear dead referents and update moved ones across the worker gang.
    /// Runs to completion even when the cycle is cancelled: a dead referent
    /// left behind would dangle once its region is recycled.
    pub fn process_references(&self, heap: &Heap) -> usize {
        self.claim.store(0, Ordering::Release);
        let task = ProcessReferencesTask {
            processor: self,
            closure: EvacUpdateCleanupClosure::new(heap),
        };
        heap.workers().run_task(&task);

        let mut cleared = 0;
        for mut entry in self.discovered.iter_mut() {
            for reference in entry.value_mut().drain(..) {
                self.pending.push(reference);
                cleared += 1;
            }
        }
        debug!("Reference processing cleared {cleared} of {} references", self.len());
        cleared
    }

    /// Point referents at their forwarded copies.
    pub fn update_referents(&self, heap: &Heap) -> usize {
        self.references
            .read()
            .iter()
            .filter(|r| heap.update_slot(r.referent_slot()))
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn take_pending(&self) -> Vec<Arc<Reference>> {
        std::iter::from_fn(|| self.pending.pop()).collect()
    }
}

struct ProcessReferencesTask<'a> {
    processor: &'a ReferenceProcessor,
    closure: EvacUpdateCleanupClosure<'a>,
}

impl GangTask for ProcessReferencesTask<'_> {
    fn name(&self) -> &'static str {
        "Process References"
    }

    fn work(&self, worker_id: usize) {
        let references = self.processor.references.read();
        loop {
            let idx = self.processor.claim.fetch_add(1, Ordering::AcqRel);
            let Some(reference) = references.get(idx) else {
                break;
            };
            if self.closure.apply(reference.referent_slot()) == SlotOutcome::Cleared {
                self.processor
                    .discovered
                    .entry(worker_id)
                    .or_default()
                    .push(Arc::clone(reference));
            }
        }
    }
}
