//! Slot closures and gang tasks for the concurrent root phases.
//!
//! Every slot update here is a compare-exchange against the value that was
//! loaded, so a racing mutator store or a racing worker is never overwritten
//! with a stale or reclaimed address.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;

use crate::{
    heap::Heap,
    roots::{ClaimingIter, ClassLoaderData, CodeUnit, OopStorageParState},
    thread::MutatorThread,
    types::ObjRef,
    workers::GangTask,
};

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    Untouched,
    /// The referent was dead and the slot now holds null.
    Cleared,
    /// The slot now points at the evacuated copy.
    Updated,
}

/// Weak-slot closure: clears dead referents of the collected generation and
/// moves live collection-set referents to to-space.
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use regiongc::cycle::closures::{EvacUpdateCleanupClosure, SlotOutcome};
/// use regiongc::test_utils::TestFixture;
/// use regiongc::types::Affiliation;
///
/// let fixture = TestFixture::new().unwrap();
/// let heap = fixture.heap();
/// let dead = fixture.alloc(Affiliation::Young, 0).unwrap();
/// heap.capture_top_at_mark_start(|_| true);
///
/// let slot = AtomicUsize::new(dead.addr());
/// let closure = EvacUpdateCleanupClosure::new(heap);
/// assert_eq!(closure.apply(&slot), SlotOutcome::Cleared);
/// assert_eq!(slot.load(Ordering::Acquire), 0);
/// ```
pub struct EvacUpdateCleanupClosure<'a> {
    heap: &'a Heap,
    evac_in_progress: bool,
}

impl<'a> EvacUpdateCleanupClosure<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self {
            heap,
            evac_in_progress: heap.is_evacuation_in_progress(),
        }
    }

    pub fn apply(&self, slot: &AtomicUsize) -> SlotOutcome {
        let heap = self.heap;
        let raw = slot.load(Ordering::Acquire);
        let Some(obj) = ObjRef::from_raw(raw) else {
            return SlotOutcome::Untouched;
        };
        if heap.region_index_for(obj.addr()).is_none() {
            return SlotOutcome::Untouched;
        }
        if !heap.is_marked(obj) {
            if heap.is_in_active_generation(obj)
                && slot
                    .compare_exchange(raw, 0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return SlotOutcome::Cleared;
            }
            return SlotOutcome::Untouched;
        }
        if self.evac_in_progress && heap.in_collection_set(obj) {
            let resolved = {
                let _scope = heap.evac_oom().enter();
                heap.evacuate_object(obj)
            };
            if resolved != obj
                && slot
                    .compare_exchange(raw, resolved.addr(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                debug_assert!(
                    heap.cancelled_gc() || !heap.in_collection_set(resolved),
                    "weak slot updated to a collection-set copy"
                );
                return SlotOutcome::Updated;
            }
        }
        SlotOutcome::Untouched
    }
}

/// Evacuate a collection-set referent of a strong slot and point the slot at
/// the copy. The caller has entered the evacuation-OOM scope.
pub(crate) fn evacuate_update_slot(heap: &Heap, slot: &AtomicUsize) -> bool {
    let raw = slot.load(Ordering::Acquire);
    let Some(obj) = ObjRef::from_raw(raw) else {
        return false;
    };
    if !heap.in_collection_set(obj) {
        return false;
    }
    let resolved = heap.evacuate_object(obj);
    resolved != obj
        && slot
            .compare_exchange(raw, resolved.addr(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
}

/// Heal an armed code unit and disarm it. Takes the unit lock before the
/// evacuation-OOM scope; the mutator entry barrier nests them the same way.
pub(crate) fn evacuate_update_code_unit(heap: &Heap, unit: &CodeUnit) -> usize {
    let _lock = unit.lock();
    // A disarmed unit was already healed by its entry barrier.
    if !unit.is_armed() {
        return 0;
    }
    let _scope = heap.evac_oom().enter();
    let updated = unit
        .oops()
        .iter()
        .filter(|slot| evacuate_update_slot(heap, slot))
        .count();
    unit.disarm();
    updated
}

/// Evacuates and updates mutator stack slots, one thread per claim.
pub(crate) struct ThreadRootsEvacUpdateTask<'a> {
    pub(crate) heap: &'a Heap,
    pub(crate) threads: ClaimingIter<MutatorThread>,
}

impl GangTask for ThreadRootsEvacUpdateTask<'_> {
    fn name(&self) -> &'static str {
        "Evacuate/Update Concurrent Thread Roots"
    }

    fn work(&self, worker_id: usize) {
        let heap = self.heap;
        let mut updated = 0;
        while let Some(thread) = self.threads.claim() {
            let _scope = heap.evac_oom().enter();
            thread.stack_slots_do(|slot| {
                if evacuate_update_slot(heap, slot) {
                    updated += 1;
                }
            });
        }
        trace!("Worker {worker_id} updated {updated} thread roots");
    }
}

/// Clears dead weak roots and moves live ones. With class unloading it also
/// caches loader liveness and code-unit unloading state for the phase after.
pub(crate) struct WeakRootsEvacUpdateTask<'a> {
    pub(crate) heap: &'a Heap,
    pub(crate) closure: EvacUpdateCleanupClosure<'a>,
    pub(crate) vm_weak: OopStorageParState<'a>,
    pub(crate) unloading: Option<(ClaimingIter<Arc<ClassLoaderData>>, ClaimingIter<Arc<CodeUnit>>)>,
}

impl<'a> WeakRootsEvacUpdateTask<'a> {
    pub(crate) fn new(heap: &'a Heap) -> Self {
        let roots = heap.roots();
        let unloading = heap.unload_classes().then(|| {
            (
                roots.class_loaders().claiming_iter(),
                roots.code_cache().concurrent_iter(),
            )
        });
        Self {
            heap,
            closure: EvacUpdateCleanupClosure::new(heap),
            vm_weak: roots.vm_weak().par_state(),
            unloading,
        }
    }
}

impl GangTask for WeakRootsEvacUpdateTask<'_> {
    fn name(&self) -> &'static str {
        "Evacuate/Update Concurrent Weak Roots"
    }

    fn work(&self, worker_id: usize) {
        let mut dead = 0;
        self.vm_weak.oops_do(|slot| {
            if self.closure.apply(slot) == SlotOutcome::Cleared {
                dead += 1;
            }
        });
        self.vm_weak.note_dead(dead);

        if let Some((loaders, code)) = &self.unloading {
            while let Some(cld) = loaders.claim() {
                // Liveness is cached before the holder slot can be cleared.
                cld.is_alive(self.heap);
                self.closure.apply(cld.holder_slot());
            }
            while let Some(unit) = code.claim() {
                unit.is_unloading(self.heap);
            }
        }
        trace!("Worker {worker_id} cleared {dead} weak roots");
    }
}

impl Drop for WeakRootsEvacUpdateTask<'_> {
    fn drop(&mut self) {
        self.vm_weak.report_num_dead();
    }
}

/// Evacuates and updates VM strong roots, loader handles and, unless classes
/// unload, code-unit references.
pub(crate) struct StrongRootsEvacUpdateTask<'a> {
    pub(crate) heap: &'a Heap,
    pub(crate) vm_strong: OopStorageParState<'a>,
    pub(crate) loaders: ClaimingIter<Arc<ClassLoaderData>>,
    pub(crate) code: Option<ClaimingIter<Arc<CodeUnit>>>,
}

impl<'a> StrongRootsEvacUpdateTask<'a> {
    pub(crate) fn new(heap: &'a Heap) -> Self {
        let roots = heap.roots();
        Self {
            heap,
            vm_strong: roots.vm_strong().par_state(),
            loaders: roots.class_loaders().claiming_iter(),
            code: (!heap.unload_classes()).then(|| roots.code_cache().concurrent_iter()),
        }
    }
}

impl GangTask for StrongRootsEvacUpdateTask<'_> {
    fn name(&self) -> &'static str {
        "Evacuate/Update Concurrent Strong Roots"
    }

    fn work(&self, worker_id: usize) {
        let heap = self.heap;
        let unloading = heap.unload_classes();
        let mut updated = 0;
        {
            let _scope = heap.evac_oom().enter();
            self.vm_strong.oops_do(|slot| {
                if evacuate_update_slot(heap, slot) {
                    updated += 1;
                }
            });
            while let Some(cld) = self.loaders.claim() {
                cld.handles().oops_do(|slot| {
                    if evacuate_update_slot(heap, slot) {
                        updated += 1;
                    }
                });
                // Weak while classes unload; the weak-roots task owns it then.
                if !unloading && evacuate_update_slot(heap, cld.holder_slot()) {
                    updated += 1;
                }
            }
        }
        // No OOM scope here: code units take theirs under the unit lock.
        if let Some(code) = &self.code {
            while let Some(unit) = code.claim() {
                updated += evacuate_update_code_unit(heap, unit);
            }
        }
        trace!("Worker {worker_id} updated {updated} strong roots");
    }
}
