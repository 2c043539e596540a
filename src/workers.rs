//! Worker gang for parallel and concurrent phase bodies.
//!
//! A [`GangTask`] is run once per active worker, each call receiving its
//! worker id. Phases size the gang through a [`WorkerScope`] which asks the
//! heap's [`WorkerPolicy`] how many workers the phase wants.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use crate::{
    error::{GcError, GcResult},
    options::GcOptions,
    phase::{Phase, PhaseClass},
};

/// Work split across the gang. Implementations claim their own chunks.
pub trait GangTask: Sync {
    fn name(&self) -> &'static str;
    fn work(&self, worker_id: usize);
}

/// Chooses how many workers a phase runs with.
pub trait WorkerPolicy: Send + Sync {
    fn workers_for(&self, phase: Phase, options: &GcOptions) -> usize;
}

/// Parallel workers for pauses, concurrent workers for concurrent phases,
/// none for phases the driver runs alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultWorkerPolicy;

impl WorkerPolicy for DefaultWorkerPolicy {
    fn workers_for(&self, phase: Phase, options: &GcOptions) -> usize {
        match phase.class() {
            PhaseClass::NoWorkers => 0,
            PhaseClass::RequiresSafepoint => options.parallel_workers,
            PhaseClass::Concurrent => options.concurrent_workers,
        }
    }
}

pub struct WorkerGang {
    pool: rayon::ThreadPool,
    max_workers: usize,
    active_workers: AtomicUsize,
}

impl WorkerGang {
    pub fn new(max_workers: usize) -> GcResult<Self> {
        let max_workers = max_workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_workers)
            .thread_name(|index| format!("gc-worker-{index}"))
            .build()
            .map_err(|e| GcError::WorkerPool(e.to_string()))?;
        Ok(Self {
            pool,
            max_workers,
            active_workers: AtomicUsize::new(max_workers),
        })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Acquire)
    }

    /// Returns the previous value. Zero means tasks run on the caller.
    pub fn set_active_workers(&self, workers: usize) -> usize {
        self.active_workers
            .swap(workers.min(self.max_workers), Ordering::AcqRel)
    }

    /// Run `task` on every active worker and wait for all of them.
    pub fn run_task(&self, task: &dyn GangTask) {
        let workers = self.active_workers();
        if workers == 0 {
            task.work(0);
            return;
        }
        self.pool.scope(|s| {
            for worker_id in 0..workers {
                s.spawn(move |_| task.work(worker_id));
            }
        });
    }
}

/// Sizes the gang for one phase and restores the previous size on drop.
pub struct WorkerScope<'a> {
    gang: &'a WorkerGang,
    previous: usize,
}

impl<'a> WorkerScope<'a> {
    pub fn new(gang: &'a WorkerGang, workers: usize, phase: Phase) -> Self {
        let previous = gang.set_active_workers(workers);
        debug!(
            "Using {} of {} workers for {}",
            gang.active_workers(),
            gang.max_workers(),
            phase.title()
        );
        Self { gang, previous }
    }
}

impl Drop for WorkerScope<'_> {
    fn drop(&mut self) {
        self.gang.set_active_workers(self.previous);
    }
}
