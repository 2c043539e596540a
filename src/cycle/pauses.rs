// Stop-the-world pauses of the concurrent cycle.
//
// Each `vmop_entry_*` times the gross pause, fires the fault-injection hook
// and hands the operation to the safepoint executor, blocking until it has
// run. The `op_*` bodies run on the VM thread with every mutator stopped.

use std::sync::{
    atomic::{fence, Ordering},
    Arc,
};

use log::debug;

use crate::{
    error::GcResult,
    phase::{PausePhase, Phase, TimingsTracker},
    types::Affiliation,
    verifier::Verifier,
    workers::WorkerScope,
};

use super::ConcurrentGc;

impl ConcurrentGc {
    pub(super) fn vmop_entry_init_mark(self: &Arc<Self>) -> GcResult<()> {
        self.submit_pause(Phase::InitMarkGross, Phase::InitMark, Self::op_init_mark)
    }

    pub(super) fn vmop_entry_final_mark(self: &Arc<Self>) -> GcResult<()> {
        self.submit_pause(Phase::FinalMarkGross, Phase::FinalMark, Self::op_final_mark)
    }

    pub(super) fn vmop_entry_init_update_refs(self: &Arc<Self>) -> GcResult<()> {
        self.submit_pause(
            Phase::InitUpdateRefsGross,
            Phase::InitUpdateRefs,
            Self::op_init_update_refs,
        )
    }

    pub(super) fn vmop_entry_final_update_refs(self: &Arc<Self>) -> GcResult<()> {
        self.submit_pause(
            Phase::FinalUpdateRefsGross,
            Phase::FinalUpdateRefs,
            Self::op_final_update_refs,
        )
    }

    pub(super) fn vmop_entry_final_roots(self: &Arc<Self>) -> GcResult<()> {
        self.submit_pause(Phase::FinalRootsGross, Phase::FinalRoots, Self::op_final_roots)
    }

    fn submit_pause(
        self: &Arc<Self>,
        gross: Phase,
        phase: Phase,
        op: fn(&ConcurrentGc),
    ) -> GcResult<()> {
        let heap = &*self.heap;
        let _gross = TimingsTracker::new(heap.timings(), gross);
        heap.try_inject_alloc_failure(phase);

        let gc = Arc::clone(self);
        heap.safepoint().execute(phase.title(), move || {
            let heap = &*gc.heap;
            let _phase = PausePhase::new(heap, phase, gc.generation);
            let _workers = WorkerScope::new(
                heap.workers(),
                heap.worker_policy().workers_for(phase, heap.options()),
                phase,
            );
            op(&gc);
        })
    }

    pub(crate) fn op_init_mark(&self) {
        let heap = &*self.heap;
        let generation = self.generation();
        assert!(
            heap.safepoint().is_vm_thread(),
            "init mark must run on the safepoint thread"
        );
        debug_assert!(generation.is_bitmap_clear(heap), "need clear marking bitmap");
        assert!(!generation.is_mark_complete(), "marking should not be complete");
        assert!(!heap.has_forwarded_objects(), "no forwarded objects on this path");

        if heap.options().verify {
            Verifier::new(heap).verify_before_concmark();
        }

        // The young remembered set is snapshotted for card scanning.
        if heap.is_generational()
            && (self.generation.is_young() || (self.generation.is_global() && heap.options().verify))
        {
            heap.young_generation().swap_remembered_set();
        }

        generation.set_concurrent_mark_in_progress(heap, true);
        let bootstrap = self.bootstrap_old;
        if bootstrap {
            heap.old_generation().set_concurrent_mark_in_progress(heap, true);
        }

        let captured = heap.capture_top_at_mark_start(|r| {
            generation.contains_region(r) || (bootstrap && r.affiliation() == Affiliation::Old)
        });
        debug!("Init mark: captured TAMS for {captured} regions");

        let rp = generation.ref_processor();
        rp.reset_thread_locals();
        rp.set_soft_reference_policy(heap.options().clear_soft_refs);

        // Workers must see region and reference-processor state before marking.
        fence(Ordering::SeqCst);

        let code = heap.roots().code_cache();
        if heap.unload_classes() {
            code.arm_all();
        }
        code.change_epoch();

        heap.set_aging_cycle(heap.is_generational() && self.generation.is_young());
    }

    pub(crate) fn op_final_mark(&self) {
        let heap = &*self.heap;
        let generation = self.generation();
        assert!(!heap.has_forwarded_objects(), "no forwarded objects on this path");

        if heap.options().verify {
            Verifier::new(heap).verify_roots_no_forwarded();
        }

        if heap.cancelled_gc() {
            debug!("Final mark skipped, cycle is cancelled");
            return;
        }

        heap.marking_engine().finish_mark(heap, generation);
        assert!(!heap.cancelled_gc(), "stop-the-world mark cannot run out of memory");
        // Old marking started by a bootstrap cycle keeps going.
        generation.set_concurrent_mark_in_progress(heap, false);

        let mixed = generation.prepare_regions_and_collection_set(heap, true);
        self.mixed_evac.store(mixed, Ordering::Release);

        // Needs the collection set.
        heap.prepare_concurrent_roots();

        if !heap.collection_set().is_empty() {
            if heap.options().verify {
                Verifier::new(heap).verify_before_evacuation();
            }
            heap.set_evacuation_in_progress(true);
            heap.set_has_forwarded_objects(true);

            let code = heap.roots().code_cache();
            code.arm_all();
            code.change_epoch();
        } else if heap.options().verify {
            Verifier::new(heap).verify_after_concmark();
        }
    }

    pub(crate) fn op_init_update_refs(&self) {
        let heap = &*self.heap;
        heap.set_evacuation_in_progress(false);
        heap.set_concurrent_weak_root_in_progress(false);
        heap.prepare_update_heap_references();
        heap.set_update_refs_in_progress(true);
        if heap.options().verify {
            Verifier::new(heap).verify_before_update_refs();
        }
    }

    pub(crate) fn op_final_update_refs(&self) {
        let heap = &*self.heap;
        assert!(
            heap.safepoint().is_vm_thread(),
            "final update refs must run on the safepoint thread"
        );
        assert!(
            !heap.update_refs_has_next(),
            "update references must be finished before final update refs"
        );

        heap.update_roots();
        heap.finish_concurrent_roots();

        // Nothing is left to unwind, so a late cancellation is dropped here.
        if heap.cancelled_gc() {
            heap.clear_cancelled_gc(true);
        }

        if heap.options().verify {
            Verifier::new(heap).verify_roots_in_to_space();
        }

        heap.update_heap_region_states();

        if heap.is_concurrent_old_mark_in_progress() {
            heap.purge_old_satb_buffers();
        }

        heap.set_update_refs_in_progress(false);
        heap.set_has_forwarded_objects(false);
        heap.set_aging_cycle(false);

        if heap.options().verify {
            Verifier::new(heap).verify_after_update_refs();
        }

        heap.rebuild_free_set(true);
    }

    pub(crate) fn op_final_roots(&self) {
        let heap = &*self.heap;
        heap.set_concurrent_weak_root_in_progress(false);
        heap.finish_concurrent_roots();
        heap.set_aging_cycle(false);
    }
}
