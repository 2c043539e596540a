//! Cycle control.
//!
//! [`GcController`] turns a collection request into a concurrent cycle,
//! hands a cancelled cycle to the degenerated collector and keeps running
//! totals. Only one cycle runs at a time, whether requested synchronously
//! with [`GcController::run_cycle`] or in the background with
//! [`GcController::trigger_gc`].
//!
//! ```
//! use regiongc::control::{CycleOutcome, GcController};
//! use regiongc::test_utils::TestFixture;
//! use regiongc::types::{Affiliation, GcCause, GenerationMode};
//!
//! let fixture = TestFixture::new().unwrap();
//! fixture.evacuation_candidate(Affiliation::Young).unwrap();
//! let controller = GcController::new(fixture.heap().clone());
//! let outcome = controller.run_cycle(GcCause::Explicit, GenerationMode::Global).unwrap();
//! assert_eq!(outcome, CycleOutcome::Concurrent);
//! assert_eq!(controller.stats().cycles_completed, 1);
//! ```

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use flume::{Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::{
    cycle::ConcurrentGc,
    degenerated::{DegenOutcome, DegeneratedGc},
    error::GcResult,
    heap::Heap,
    types::{DegenPoint, GcCause, GenerationMode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Every cancellation checkpoint passed.
    Concurrent,
    /// Cancelled at the point, finished by the degenerated collector.
    Degenerated(DegenPoint),
    /// The degenerated collector could not evacuate.
    UpgradeToFull(DegenPoint),
}

/// Running totals across cycles
#[derive(Debug, Default, Clone)]
pub struct CycleStats {
    pub cycles_completed: usize,
    pub concurrent_cycles: usize,
    pub degenerated_cycles: usize,
    pub upgraded_to_full: usize,
    pub last_outcome: Option<CycleOutcome>,
    pub last_cycle_time: Duration,
    pub total_cycle_time: Duration,
    pub total_pause_time: Duration,
}

pub struct GcController {
    heap: Arc<Heap>,
    cycle_lock: Mutex<()>,
    collection_in_progress: AtomicBool,
    finished_tx: Sender<CycleOutcome>,
    finished_rx: Receiver<CycleOutcome>,
    stats: ArcSwap<CycleStats>,
}

impl GcController {
    pub fn new(heap: Arc<Heap>) -> Arc<Self> {
        let (finished_tx, finished_rx) = flume::unbounded();
        Arc::new(Self {
            heap,
            cycle_lock: Mutex::new(()),
            collection_in_progress: AtomicBool::new(false),
            finished_tx,
            finished_rx,
            stats: ArcSwap::from_pointee(CycleStats::default()),
        })
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn stats(&self) -> CycleStats {
        self.stats.load().as_ref().clone()
    }

    pub fn is_collecting(&self) -> bool {
        self.collection_in_progress.load(Ordering::Acquire)
    }

    /// Run one cycle for `mode` on the calling thread. An old cycle while
    /// bootstrapped old marking is in progress resumes that marking.
    pub fn run_cycle(&self, cause: GcCause, mode: GenerationMode) -> GcResult<CycleOutcome> {
        self.run(cause, mode, false)
    }

    /// Young cycle that also starts old-generation marking.
    pub fn run_bootstrap_cycle(&self, cause: GcCause) -> GcResult<CycleOutcome> {
        self.run(cause, GenerationMode::Young, true)
    }

    fn run(&self, cause: GcCause, mode: GenerationMode, bootstrap_old: bool) -> GcResult<CycleOutcome> {
        let _cycle = self.cycle_lock.lock();
        let heap = &*self.heap;
        let monitoring = heap.monitoring();
        monitoring.gc_requested(heap, mode);
        monitoring.gc_begin(heap, mode);
        let start = Instant::now();

        let gc = ConcurrentGc::new(Arc::clone(&self.heap), mode, bootstrap_old);
        let completed = if mode.is_old() && heap.is_concurrent_old_mark_in_progress() {
            gc.resume_old_marking(cause)
        } else {
            gc.collect(cause)
        };
        let result = if completed {
            Ok(CycleOutcome::Concurrent)
        } else {
            let point = gc.degen_point();
            warn!("Cancelled {mode} cycle degenerates at {point}");
            DegeneratedGc::new(gc)
                .collect(cause)
                .map(|outcome| match outcome {
                    DegenOutcome::Completed => CycleOutcome::Degenerated(point),
                    DegenOutcome::UpgradeToFull => CycleOutcome::UpgradeToFull(point),
                })
        };

        // A cancellation the cycle did not need to unwind is stale now.
        if heap.cancelled_gc() {
            debug!("Clearing stale cancellation ({:?})", heap.cancelled_cause());
            heap.clear_cancelled_gc(true);
        }

        let elapsed = start.elapsed();
        let pause_time = monitoring
            .gc_end(heap, mode, cause)
            .map_or(Duration::ZERO, |info| info.total_pause_time());

        match &result {
            Ok(outcome) => {
                info!("{mode} cycle finished: {outcome:?} in {:.3}ms", elapsed.as_secs_f64() * 1000.0);
                self.record(*outcome, elapsed, pause_time);
            }
            Err(e) => error!("{mode} cycle failed: {e}"),
        }
        result
    }

    fn record(&self, outcome: CycleOutcome, elapsed: Duration, pause_time: Duration) {
        self.stats.rcu(|current| {
            let mut next = CycleStats::clone(current);
            next.cycles_completed += 1;
            match outcome {
                CycleOutcome::Concurrent => next.concurrent_cycles += 1,
                CycleOutcome::Degenerated(_) => next.degenerated_cycles += 1,
                CycleOutcome::UpgradeToFull(_) => next.upgraded_to_full += 1,
            }
            next.last_outcome = Some(outcome);
            next.last_cycle_time = elapsed;
            next.total_cycle_time += elapsed;
            next.total_pause_time += pause_time;
            next
        });
    }

    /// Start a cycle on a background thread unless one is already running.
    /// Returns whether this call started it.
    pub fn trigger_gc(self: &Arc<Self>, cause: GcCause, mode: GenerationMode) -> bool {
        if self
            .collection_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Cycle already running, ignoring {cause} request");
            return false;
        }
        // Signals from earlier cycles are not for the next waiter.
        while self.finished_rx.try_recv().is_ok() {}

        let controller = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("gc-control".into())
            .spawn(move || {
                let outcome = controller.run_cycle(cause, mode);
                controller.collection_in_progress.store(false, Ordering::Release);
                if let Ok(outcome) = outcome {
                    let _ = controller.finished_tx.send(outcome);
                }
            });
        if let Err(e) = spawned {
            error!("Cannot start collector thread: {e}");
            self.collection_in_progress.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Wait for a background cycle. Returns true if none is running by the
    /// deadline.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_collecting() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return !self.is_collecting();
            }
            // Woken by the finishing cycle; the flag is cleared before the signal.
            let _ = self
                .finished_rx
                .recv_timeout(remaining.min(Duration::from_millis(50)));
        }
        true
    }
}
