//! Stop-the-world fallback for a cancelled concurrent cycle.
//!
//! [`DegeneratedGc`] finishes the cycle inside a single pause, starting from
//! the [`DegenPoint`] the concurrent cycle recorded. Work the concurrent
//! cycle already committed is not repeated:
//!
//! | point | resumes with |
//! |---|---|
//! | `OutsideCycle` | reset, init mark, root marking, then as `Mark` |
//! | `Mark` | finish marking and final mark, root cleanup, then as `Evac` |
//! | `Evac` | evacuate what is left, init update refs, then as `UpdateRefs` |
//! | `UpdateRefs` | finish the update-refs iterator, final update refs, cleanup |
//!
//! Running out of to-space during the stop-the-world evacuation cannot be
//! recovered here and is reported as [`DegenOutcome::UpgradeToFull`].
//!
//! The fallback stays scoped to the generation of the cancelled cycle. It runs
//! that cycle's own phase bodies under the pause rather than switching to a
//! separate whole-heap collector, so a young or mixed collection set is
//! finished as selected and old regions outside it are left alone. Whole-heap
//! collection after [`DegenOutcome::UpgradeToFull`] is up to the caller.

use std::sync::Arc;

use log::{error, info, warn};

use crate::{
    cycle::ConcurrentGc,
    error::{GcError, GcResult},
    phase::{PausePhase, Phase, TimingsTracker},
    types::{DegenPoint, GcCause},
    verifier::Verifier,
    workers::WorkerScope,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegenOutcome {
    Completed,
    /// Evacuation failed with the world stopped. The heap is left
    /// mid-evacuation for a full collection to take over.
    UpgradeToFull,
}

pub struct DegeneratedGc {
    gc: Arc<ConcurrentGc>,
    point: DegenPoint,
}

impl DegeneratedGc {
    pub fn new(gc: Arc<ConcurrentGc>) -> Self {
        let point = gc.degen_point();
        Self { gc, point }
    }

    pub fn point(&self) -> DegenPoint {
        self.point
    }

    pub fn collect(&self, cause: GcCause) -> GcResult<DegenOutcome> {
        let heap = self.gc.heap();
        warn!(
            "Degenerated {} GC at {} ({cause})",
            self.gc.generation_mode(),
            self.point
        );
        let _gross = TimingsTracker::new(heap.timings(), Phase::DegenGcGross);

        let (tx, rx) = flume::bounded(1);
        let gc = Arc::clone(&self.gc);
        let point = self.point;
        heap.safepoint().execute(Phase::DegenGc.title(), move || {
            let heap = gc.heap();
            let _phase = PausePhase::new(heap, Phase::DegenGc, gc.generation_mode());
            let _workers = WorkerScope::new(
                heap.workers(),
                heap.worker_policy().workers_for(Phase::DegenGc, heap.options()),
                Phase::DegenGc,
            );
            let _ = tx.send(op_degenerated(&gc, point));
        })?;

        let outcome = rx.try_recv().map_err(|_| GcError::SafepointExecutorGone)?;
        match outcome {
            DegenOutcome::Completed => info!("Degenerated {} GC complete", self.gc.generation_mode()),
            DegenOutcome::UpgradeToFull => error!(
                "Degenerated {} GC ran out of to-space, full collection required",
                self.gc.generation_mode()
            ),
        }
        Ok(outcome)
    }
}

fn op_degenerated(gc: &ConcurrentGc, point: DegenPoint) -> DegenOutcome {
    let heap = gc.heap();
    // Everything from here on runs with the world stopped.
    heap.clear_cancelled_gc(true);

    match point {
        DegenPoint::Unset => panic!("degenerated GC without a degeneration point"),
        DegenPoint::OutsideCycle => {
            // Root marking was cancelled; restart marking under the pause.
            if gc.generation().is_concurrent_mark_in_progress() {
                gc.generation().set_concurrent_mark_in_progress(heap, false);
            }
            if gc.bootstraps_old() && heap.is_concurrent_old_mark_in_progress() {
                heap.old_generation().set_concurrent_mark_in_progress(heap, false);
            }
            gc.op_reset();
            gc.op_init_mark();
            gc.op_mark_roots();
            finish_mark(gc);
            degenerate_evac(gc)
        }
        DegenPoint::Mark => {
            finish_mark(gc);
            degenerate_evac(gc)
        }
        DegenPoint::Evac => degenerate_evac(gc),
        DegenPoint::UpdateRefs => {
            degenerate_update_refs(gc);
            DegenOutcome::Completed
        }
    }
}

fn finish_mark(gc: &ConcurrentGc) {
    let heap = gc.heap();
    gc.op_final_mark();
    if heap.is_concurrent_weak_root_in_progress() {
        gc.op_weak_refs();
        gc.op_weak_roots();
    }
    gc.op_cleanup();
    if heap.unload_classes() && heap.is_concurrent_weak_root_in_progress() {
        gc.op_class_unloading();
    }
    // Final update refs rewrites every strong root.
    heap.set_concurrent_strong_root_in_progress(false);
}

fn degenerate_evac(gc: &ConcurrentGc) -> DegenOutcome {
    let heap = gc.heap();
    if heap.is_evacuation_in_progress() {
        heap.evacuate_collection_set(false);
        if heap.cancelled_gc() {
            return DegenOutcome::UpgradeToFull;
        }
    }
    if heap.has_forwarded_objects() {
        gc.op_init_update_refs();
    }
    degenerate_update_refs(gc);
    DegenOutcome::Completed
}

fn degenerate_update_refs(gc: &ConcurrentGc) {
    let heap = gc.heap();
    if heap.has_forwarded_objects() {
        heap.update_heap_references(false);
        gc.op_final_update_refs();
    } else {
        gc.op_final_roots();
    }
    gc.op_cleanup();
    if heap.options().verify {
        Verifier::new(heap).verify_after_degenerated();
    }
}
