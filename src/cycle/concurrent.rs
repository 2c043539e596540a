// Concurrent phases of the cycle.
//
// `run_concurrent` is the phase wrapper: it opens the phase scope, sizes the
// gang from the worker policy, fires the fault-injection hook and runs the
// body. Bodies that the degenerated collector reuses are `op_*` methods.

use std::sync::Arc;

use log::{debug, warn};

use crate::{
    handshake::HandshakeCoordinator,
    phase::{ConcurrentPhase, Phase},
    roots::ClaimingIter,
    workers::WorkerScope,
};

use super::{
    closures::{StrongRootsEvacUpdateTask, ThreadRootsEvacUpdateTask, WeakRootsEvacUpdateTask},
    ConcurrentGc,
};

impl ConcurrentGc {
    fn run_concurrent(&self, phase: Phase, body: impl FnOnce(&Self)) {
        let heap = &*self.heap;
        let _phase = ConcurrentPhase::new(heap, phase, self.generation);
        let _workers = WorkerScope::new(
            heap.workers(),
            heap.worker_policy().workers_for(phase, heap.options()),
            phase,
        );
        heap.try_inject_alloc_failure(phase);
        body(self);
    }

    pub(super) fn entry_reset(&self) {
        self.run_concurrent(Phase::ConcReset, Self::op_reset);
    }

    pub(super) fn entry_scan_remembered_set(&self) {
        self.run_concurrent(Phase::ConcScanRememberedSet, |gc| {
            gc.generation().scan_remembered_set(&gc.heap);
        });
    }

    pub(super) fn entry_mark_roots(&self) {
        self.run_concurrent(Phase::ConcMarkRoots, Self::op_mark_roots);
    }

    pub(super) fn entry_mark(&self) {
        self.run_concurrent(Phase::ConcMark, |gc| {
            gc.heap
                .marking_engine()
                .concurrent_mark(&gc.heap, gc.generation());
        });
    }

    pub(super) fn entry_thread_roots(&self) {
        self.run_concurrent(Phase::ConcThreadRoots, Self::op_thread_roots);
    }

    pub(super) fn entry_weak_refs(&self) {
        self.run_concurrent(Phase::ConcWeakRefs, Self::op_weak_refs);
    }

    pub(super) fn entry_weak_roots(&self) {
        self.run_concurrent(Phase::ConcWeakRoots, |gc| {
            gc.op_weak_roots();
            // Flush mutators still holding a weak referent this pass cleared.
            let heap = &*gc.heap;
            if let Err(e) =
                HandshakeCoordinator::new(heap.threads(), heap.options().handshake_timeout)
                    .rendezvous()
            {
                warn!("Weak roots rendezvous incomplete: {e}");
            }
        });
    }

    pub(super) fn entry_cleanup_early(&self) {
        self.run_concurrent(Phase::ConcCleanupEarly, Self::op_cleanup);
    }

    pub(super) fn entry_class_unloading(&self) {
        self.run_concurrent(Phase::ConcClassUnload, Self::op_class_unloading);
    }

    pub(super) fn entry_strong_roots(&self) {
        self.run_concurrent(Phase::ConcStrongRoots, |gc| {
            let heap = &*gc.heap;
            assert!(
                heap.is_concurrent_strong_root_in_progress(),
                "strong roots phase without strong roots in progress"
            );
            heap.workers().run_task(&StrongRootsEvacUpdateTask::new(heap));
            heap.set_concurrent_strong_root_in_progress(false);
        });
    }

    pub(super) fn entry_coalesce_and_fill(&self) {
        self.run_concurrent(Phase::ConcCoalesceAndFill, |gc| {
            if !gc.heap.coalesce_and_fill_old_regions() {
                debug!("Coalesce and fill interrupted by cancellation");
            }
        });
    }

    pub(super) fn entry_evacuate(&self) {
        self.run_concurrent(Phase::ConcEvac, |gc| gc.heap.evacuate_collection_set(true));
    }

    pub(super) fn entry_update_refs(&self) {
        self.run_concurrent(Phase::ConcUpdateRefs, |gc| gc.heap.update_heap_references(true));
    }

    pub(super) fn entry_update_thread_roots(&self) {
        self.run_concurrent(Phase::ConcUpdateThreadRoots, |gc| {
            let heap = Arc::clone(&gc.heap);
            let coordinator =
                HandshakeCoordinator::new(gc.heap.threads(), gc.heap.options().handshake_timeout);
            let result = coordinator.execute("Update Thread Roots", move |thread| {
                thread.stack_slots_do(|slot| {
                    heap.update_slot(slot);
                });
            });
            // Final update refs rewrites every stack with the world stopped.
            if let Err(e) = result {
                warn!("Thread roots not updated concurrently: {e}");
            }
        });
    }

    pub(super) fn entry_cleanup_complete(&self) {
        self.run_concurrent(Phase::ConcCleanupComplete, Self::op_cleanup);
    }

    pub(crate) fn op_reset(&self) {
        if self.generation.is_old() {
            // Promotions since the last old reset still belong to this collection.
            let promoted = self.heap.old_generation().bytes_allocated_since_gc_start();
            self.heap.monitoring().update_copied_between_pools(promoted);
        }
        self.generation().prepare_gc(&self.heap, self.bootstrap_old);
    }

    pub(crate) fn op_mark_roots(&self) {
        self.heap
            .marking_engine()
            .mark_concurrent_roots(&self.heap, self.generation());
    }

    pub(crate) fn op_thread_roots(&self) {
        let heap = &*self.heap;
        assert!(heap.is_evacuation_in_progress(), "thread roots outside evacuation");
        let task = ThreadRootsEvacUpdateTask {
            heap,
            threads: ClaimingIter::new(heap.threads().iter()),
        };
        heap.workers().run_task(&task);
    }

    pub(crate) fn op_weak_refs(&self) {
        let heap = &*self.heap;
        assert!(
            heap.is_concurrent_weak_root_in_progress(),
            "weak references processed outside weak root phase"
        );
        self.generation().ref_processor().process_references(heap);
    }

    /// Weak-root gang task without the trailing rendezvous.
    pub(crate) fn op_weak_roots(&self) {
        let heap = &*self.heap;
        assert!(
            heap.is_concurrent_weak_root_in_progress(),
            "weak roots processed outside weak root phase"
        );
        heap.workers().run_task(&WeakRootsEvacUpdateTask::new(heap));
    }

    pub(crate) fn op_class_unloading(&self) {
        let heap = &*self.heap;
        assert!(
            heap.unload_classes() && heap.is_concurrent_weak_root_in_progress(),
            "class unloading outside weak root phase"
        );
        heap.do_class_unloading();
    }

    /// Recycle trash regions. Without trash this changes nothing.
    pub(crate) fn op_cleanup(&self) {
        self.heap.recycle_trash();
    }
}
