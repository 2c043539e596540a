//! Reference update after evacuation, and the cleanup that follows it.
//!
//! Update-refs walks every active region outside the collection set up to
//! the watermark recorded at init-update-refs and points each field at the
//! forwarded copy. Regions are claimed from a heap-wide cursor so a
//! cancelled pass can be resumed by the degenerated collector.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, trace};

use crate::{
    roots::{CodeUnit, RootVisitor},
    types::{Affiliation, ObjRef},
    workers::GangTask,
};

use super::Heap;

impl Heap {
    /// Point `slot` at the forwarded copy of a collection-set referent.
    /// Returns true if the slot changed.
    pub(crate) fn update_slot(&self, slot: &AtomicUsize) -> bool {
        let raw = slot.load(Ordering::Acquire);
        let Some(obj) = ObjRef::from_raw(raw) else {
            return false;
        };
        if !self.in_collection_set(obj) {
            return false;
        }
        let fwd = self.resolve_forwarded(obj);
        fwd != obj
            && slot
                .compare_exchange(raw, fwd.addr(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Fix the update watermark of every region and rewind the cursor.
    pub fn prepare_update_heap_references(&self) {
        for region in self.regions.iter().filter(|r| r.is_active()) {
            region.set_update_watermark(region.top());
        }
        self.update_refs_cursor.store(0, Ordering::Release);
    }

    /// Regions remain for the update-refs iterator.
    pub fn update_refs_has_next(&self) -> bool {
        self.update_refs_cursor.load(Ordering::Acquire) < self.regions.len()
    }

    /// Update references in claimed regions. The concurrent pass stops
    /// claiming once the cycle is cancelled; claimed regions always finish.
    pub fn update_heap_references(&self, concurrent: bool) {
        let task = UpdateHeapRefsTask {
            heap: self,
            concurrent,
        };
        self.workers.run_task(&task);
        debug!(
            "Updated {} references, iterator {}",
            self.counters.references_updated.load(Ordering::Relaxed),
            if self.update_refs_has_next() { "not exhausted" } else { "exhausted" }
        );
    }

    /// Collection-set regions become trash and the set is emptied.
    pub fn update_heap_region_states(&self) {
        let _lock = self.heap_lock();
        let regions = self.collection_set.regions();
        for idx in &regions {
            self.regions[*idx].make_trash();
        }
        self.collection_set.clear();
        debug!("{} collection set regions are now trash", regions.len());
    }

    /// Stop-the-world update of every root, including thread stacks.
    pub fn update_roots(&self) {
        debug_assert!(
            self.safepoint.is_at_safepoint() || self.safepoint.is_vm_thread(),
            "roots updated outside a safepoint"
        );
        let visitor = UpdateRootsVisitor { heap: self };
        self.roots.roots_do(&visitor, false);
        for thread in self.threads.iter() {
            thread.stack_slots_do(|slot| {
                self.update_slot(slot);
            });
        }
        for generation in [&self.young, &self.old, &self.global] {
            generation.ref_processor().update_referents(self);
        }
    }

    /// Turn unmarked objects below TAMS in old regions into filler. Returns
    /// false if cancelled before finishing.
    pub fn coalesce_and_fill_old_regions(&self) -> bool {
        let mut filled = 0;
        for region in self
            .regions
            .iter()
            .filter(|r| r.is_active() && r.affiliation() == Affiliation::Old)
        {
            if self.cancelled_gc() {
                self.counters.objects_filled.fetch_add(filled, Ordering::Relaxed);
                return false;
            }
            for (addr, _) in region.objects_below(region.tams()) {
                if !self.marking_context.is_marked(addr) {
                    region.remove_object(addr);
                    filled += 1;
                }
            }
        }
        self.counters.objects_filled.fetch_add(filled, Ordering::Relaxed);
        debug!("Coalesced {filled} dead old objects");
        true
    }

    /// Unlink code units and class loaders whose cached liveness says dead.
    pub fn do_class_unloading(&self) -> (usize, usize) {
        let units = self.roots.code_cache().unlink_unloading();
        let loaders = self.roots.class_loaders().unlink_dead();
        self.counters
            .code_units_unloaded
            .fetch_add(units, Ordering::Relaxed);
        self.counters
            .class_loaders_unloaded
            .fetch_add(loaders, Ordering::Relaxed);
        debug!("Unloaded {units} code units and {loaders} class loaders");
        (units, loaders)
    }
}

struct UpdateHeapRefsTask<'a> {
    heap: &'a Heap,
    concurrent: bool,
}

impl GangTask for UpdateHeapRefsTask<'_> {
    fn name(&self) -> &'static str {
        "Update References"
    }

    fn work(&self, worker_id: usize) {
        let heap = self.heap;
        let mut updated = 0;
        loop {
            if self.concurrent && heap.cancelled_gc() {
                break;
            }
            // The unprepared cursor sits at usize::MAX and must not wrap.
            if !heap.update_refs_has_next() {
                break;
            }
            let idx = heap.update_refs_cursor.fetch_add(1, Ordering::AcqRel);
            let Some(region) = heap.regions.get(idx) else {
                break;
            };
            if !region.is_active() || heap.collection_set.is_in(idx) {
                continue;
            }
            for (_, object) in region.objects_below(region.update_watermark()) {
                for field in object.fields() {
                    if heap.update_slot(field) {
                        updated += 1;
                    }
                }
            }
        }
        heap.counters
            .references_updated
            .fetch_add(updated, Ordering::Relaxed);
        trace!("Worker {worker_id} updated {updated} references");
    }
}

struct UpdateRootsVisitor<'a> {
    heap: &'a Heap,
}

impl RootVisitor for UpdateRootsVisitor<'_> {
    fn visit_strong_root(&self, slot: &AtomicUsize) {
        self.heap.update_slot(slot);
    }

    fn visit_weak_root(&self, slot: &AtomicUsize) {
        self.heap.update_slot(slot);
    }

    fn visit_code_unit(&self, unit: &CodeUnit) {
        let _lock = unit.lock();
        for slot in unit.oops() {
            self.heap.update_slot(slot);
        }
    }
}
