//! The concurrent collection cycle.
//!
//! [`ConcurrentGc::collect`] drives one cycle for a generation through the
//! fixed phase sequence:
//!
//! ```text
//! Reset -> InitMark -> [ScanRememberedSet] -> MarkRoots -> Mark -> FinalMark
//!   -> [ThreadRoots] -> [WeakRefs -> WeakRoots] -> CleanupEarly
//!   -> [ClassUnload] -> [StrongRoots] -> [CoalesceAndFill]
//!   -> Evacuate -> InitUpdateRefs -> UpdateRefs -> UpdateThreadRoots
//!        -> FinalUpdateRefs -> CleanupComplete
//!    | FinalRoots
//! ```
//!
//! Pauses go through the safepoint executor (see `pauses`), concurrent phases
//! through the phase wrapper (see `concurrent`). Cancellation is observed only
//! at the checkpoints after root marking, marking, evacuation and the two
//! update-refs phases. A tripped checkpoint records the [`DegenPoint`] and the
//! cycle returns `false`; the degenerated collector picks up from there.
//!
//! [`ConcurrentGc::resume_old_marking`] is the old-generation continuation:
//! a young cycle that bootstrapped old marking already did its reset and init
//! mark, so the old cycle enters the sequence at `MarkRoots`.

pub mod closures;
mod concurrent;
mod pauses;
#[cfg(test)]
mod tests;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_utils::atomic::AtomicCell;
use log::{error, info, warn};

use crate::{
    error::GcError,
    generation::Generation,
    heap::Heap,
    phase::Phase,
    types::{DegenPoint, GcCause, GenerationMode},
};

pub struct ConcurrentGc {
    heap: Arc<Heap>,
    generation: GenerationMode,
    /// Young cycle that also starts old-generation marking.
    bootstrap_old: bool,
    degen_point: AtomicCell<DegenPoint>,
    mixed_evac: AtomicBool,
    abbreviated: AtomicBool,
}

impl ConcurrentGc {
    pub fn new(heap: Arc<Heap>, generation: GenerationMode, bootstrap_old: bool) -> Arc<Self> {
        debug_assert!(
            !bootstrap_old || generation.is_young(),
            "only young cycles bootstrap old marking"
        );
        Arc::new(Self {
            heap,
            generation,
            bootstrap_old,
            degen_point: AtomicCell::new(DegenPoint::Unset),
            mixed_evac: AtomicBool::new(false),
            abbreviated: AtomicBool::new(false),
        })
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn generation_mode(&self) -> GenerationMode {
        self.generation
    }

    pub fn bootstraps_old(&self) -> bool {
        self.bootstrap_old
    }

    pub(crate) fn generation(&self) -> &Generation {
        self.heap.generation(self.generation)
    }

    /// Where the cycle stopped, `Unset` unless `collect` returned false.
    pub fn degen_point(&self) -> DegenPoint {
        self.degen_point.load()
    }

    /// Whether the collection set spans young and old regions.
    pub fn mixed_evac(&self) -> bool {
        self.mixed_evac.load(Ordering::Acquire)
    }

    /// The collection set was empty and the cycle ended with final roots.
    pub fn abbreviated(&self) -> bool {
        self.abbreviated.load(Ordering::Acquire)
    }

    /// Run one concurrent cycle. Returns true if no cancellation checkpoint
    /// tripped.
    pub fn collect(self: &Arc<Self>, cause: GcCause) -> bool {
        info!("Concurrent {} cycle ({cause})", self.generation);
        self.heap.set_active_generation(self.generation);

        self.entry_reset();
        if let Err(e) = self.vmop_entry_init_mark() {
            return self.pause_failed(Phase::InitMark, e, DegenPoint::OutsideCycle);
        }
        self.collect_after_init_mark()
    }

    /// Finish the old marking a bootstrapping young cycle started. Reset and
    /// init mark for the old generation already ran in that young cycle, so
    /// this picks up at root marking and continues like [`collect`].
    ///
    /// Panics unless this is an old cycle and old marking is in progress.
    ///
    /// [`collect`]: ConcurrentGc::collect
    pub fn resume_old_marking(self: &Arc<Self>, cause: GcCause) -> bool {
        assert!(self.generation.is_old(), "only an old cycle resumes old marking");
        assert!(
            self.heap.is_concurrent_old_mark_in_progress(),
            "no bootstrapped old marking to resume"
        );
        info!("Concurrent old cycle ({cause}), resuming bootstrapped marking");
        self.heap.set_active_generation(self.generation);
        self.collect_after_init_mark()
    }

    fn collect_after_init_mark(self: &Arc<Self>) -> bool {
        let heap = &*self.heap;
        if heap.is_generational() && self.generation.is_young() {
            self.entry_scan_remembered_set();
        }

        self.entry_mark_roots();
        if self.check_cancellation_and_abort(DegenPoint::OutsideCycle) {
            return false;
        }

        self.entry_mark();
        if self.check_cancellation_and_abort(DegenPoint::Mark) {
            return false;
        }

        if let Err(e) = self.vmop_entry_final_mark() {
            return self.pause_failed(Phase::FinalMark, e, DegenPoint::Mark);
        }
        // Final mark skips its work when it finds the cycle cancelled.
        if self.generation().is_concurrent_mark_in_progress() {
            assert!(
                heap.cancelled_gc(),
                "{} marking still in progress after final mark",
                self.generation
            );
            return !self.check_cancellation_and_abort(DegenPoint::Mark);
        }

        if heap.is_evacuation_in_progress() {
            self.entry_thread_roots();
        }

        if heap.is_concurrent_weak_root_in_progress() {
            self.entry_weak_refs();
            self.entry_weak_roots();
        }

        self.entry_cleanup_early();
        heap.log_free_set_status();

        if heap.unload_classes() && heap.is_concurrent_weak_root_in_progress() {
            self.entry_class_unloading();
        }

        if heap.is_concurrent_strong_root_in_progress() {
            self.entry_strong_roots();
        }

        if !heap.cancelled_gc() && heap.is_generational() && self.generation.is_global() {
            self.entry_coalesce_and_fill();
        }

        if heap.is_evacuation_in_progress() {
            self.entry_evacuate();
            if self.check_cancellation_and_abort(DegenPoint::Evac) {
                return false;
            }

            if let Err(e) = self.vmop_entry_init_update_refs() {
                return self.pause_failed(Phase::InitUpdateRefs, e, DegenPoint::Evac);
            }

            self.entry_update_refs();
            if self.check_cancellation_and_abort(DegenPoint::UpdateRefs) {
                return false;
            }

            self.entry_update_thread_roots();
            if self.check_cancellation_and_abort(DegenPoint::UpdateRefs) {
                return false;
            }

            if let Err(e) = self.vmop_entry_final_update_refs() {
                return self.pause_failed(Phase::FinalUpdateRefs, e, DegenPoint::UpdateRefs);
            }

            self.entry_cleanup_complete();
        } else {
            self.abbreviated.store(true, Ordering::Release);
            if let Err(e) = self.vmop_entry_final_roots() {
                return self.pause_failed(Phase::FinalRoots, e, DegenPoint::UpdateRefs);
            }
        }

        info!("Concurrent {} cycle complete", self.generation);
        true
    }

    /// Record `point` and report true if the heap is cancelled.
    pub fn check_cancellation_and_abort(&self, point: DegenPoint) -> bool {
        if !self.heap.cancelled_gc() {
            return false;
        }
        warn!(
            "Concurrent {} cycle cancelled ({}), degenerating at {point}",
            self.generation,
            self.heap
                .cancelled_cause()
                .map_or("unknown cause", GcCause::name)
        );
        self.record_degen_point(point);
        true
    }

    fn pause_failed(&self, phase: Phase, e: GcError, point: DegenPoint) -> bool {
        error!("{} failed: {e}", phase.title());
        self.record_degen_point(point);
        false
    }

    fn record_degen_point(&self, point: DegenPoint) {
        assert_ne!(point, DegenPoint::Unset, "degeneration point must be a real boundary");
        if let Err(existing) = self.degen_point.compare_exchange(DegenPoint::Unset, point) {
            panic!("degeneration point already set to {existing}, cannot record {point}");
        }
    }
}
