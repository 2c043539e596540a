//! Memory-usage reporting.
//!
//! A passive observer of the cycle. Each generation has a [`MemoryManager`]
//! that keeps a [`GcStatInfo`] for the collection in flight: usage before and
//! after, allocation and copy counters, garbage found and collected, and the
//! pauses and concurrent phases it went through. Finished collections are
//! broadcast to subscribers as [`GcNotification`]s.
//!
//! Nothing here writes heap state.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use crossbeam_utils::atomic::AtomicCell;
use flume::{Receiver, Sender};
use log::{debug, trace};
use parking_lot::Mutex;

use crate::{
    heap::Heap,
    phase::Phase,
    types::{GcCause, GenerationMode, HeapMode},
};

pub const MAX_PAUSES_PER_CYCLE: usize = 4;
pub const MAX_CONCURRENT_PHASES_PER_CYCLE: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolUsage {
    pub used: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseRecord {
    pub name: &'static str,
    pub duration: Duration,
}

/// One collection as seen by a memory manager.
#[derive(Debug, Clone, Default)]
pub struct GcStatInfo {
    pub index: usize,
    /// Offsets from monitoring start.
    pub start_time: Duration,
    pub end_time: Duration,
    pub cause: Option<GcCause>,
    pub usage_before: PoolUsage,
    pub usage_after: PoolUsage,
    pub allocated_since_previous: i64,
    pub allocated_during_collection: i64,
    /// Bytes promoted into old while this collection ran.
    pub copied_between_pools: i64,
    pub garbage_found: usize,
    pub garbage_collected: Option<usize>,
    pub live_before: i64,
    pub live_after: usize,
    pub pauses: Vec<PhaseRecord>,
    pub concurrent_phases: Vec<PhaseRecord>,
    pub gc_threads: usize,
}

impl GcStatInfo {
    pub fn duration(&self) -> Duration {
        self.end_time.saturating_sub(self.start_time)
    }

    pub fn total_pause_time(&self) -> Duration {
        self.pauses.iter().map(|p| p.duration).sum()
    }
}

#[derive(Debug, Clone)]
pub struct GcNotification {
    pub manager: &'static str,
    pub action: &'static str,
    pub cause: GcCause,
    pub info: Arc<GcStatInfo>,
}

/// Invocation count and accumulated time for one kind of collector work.
#[derive(Debug, Default)]
pub struct CollectorCounters {
    invocations: AtomicUsize,
    time: Mutex<Duration>,
}

impl CollectorCounters {
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Relaxed)
    }

    pub fn time(&self) -> Duration {
        *self.time.lock()
    }

    fn begin(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    fn end(&self, elapsed: Duration) {
        *self.time.lock() += elapsed;
    }
}

pub struct MemoryManager {
    name: &'static str,
    gc_end_message: &'static str,
    generation: GenerationMode,
    collection_count: AtomicUsize,
    accumulated_time: Mutex<Duration>,
    allocated_since_previous_start: AtomicUsize,
    current: Mutex<Option<GcStatInfo>>,
    last: ArcSwapOption<GcStatInfo>,
}

impl MemoryManager {
    fn new(name: &'static str, gc_end_message: &'static str, generation: GenerationMode) -> Self {
        Self {
            name,
            gc_end_message,
            generation,
            collection_count: AtomicUsize::new(0),
            accumulated_time: Mutex::new(Duration::ZERO),
            allocated_since_previous_start: AtomicUsize::new(0),
            current: Mutex::new(None),
            last: ArcSwapOption::empty(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn gc_end_message(&self) -> &'static str {
        self.gc_end_message
    }

    pub fn generation(&self) -> GenerationMode {
        self.generation
    }

    pub fn collection_count(&self) -> usize {
        self.collection_count.load(Ordering::Relaxed)
    }

    pub fn accumulated_time(&self) -> Duration {
        *self.accumulated_time.lock()
    }

    pub fn last_gc_info(&self) -> Option<Arc<GcStatInfo>> {
        self.last.load_full()
    }

    pub fn is_collecting(&self) -> bool {
        self.current.lock().is_some()
    }

    fn with_current(&self, f: impl FnOnce(&mut GcStatInfo)) {
        if let Some(info) = self.current.lock().as_mut() {
            f(info);
        }
    }
}

pub struct MonitoringSupport {
    mode: HeapMode,
    epoch: Instant,
    global: MemoryManager,
    young: MemoryManager,
    old: MemoryManager,
    active: AtomicCell<Option<GenerationMode>>,
    stw: CollectorCounters,
    concurrent: CollectorCounters,
    subscribers: Mutex<Vec<Sender<GcNotification>>>,
}

impl MonitoringSupport {
    pub fn new(mode: HeapMode) -> Self {
        Self {
            mode,
            epoch: Instant::now(),
            global: MemoryManager::new("Global", "end of global collection", GenerationMode::Global),
            young: MemoryManager::new(
                "Young Gen",
                "end of young generation collection",
                GenerationMode::Young,
            ),
            old: MemoryManager::new(
                "Old Gen",
                "end of old generation collection",
                GenerationMode::Old,
            ),
            active: AtomicCell::new(None),
            stw: CollectorCounters::default(),
            concurrent: CollectorCounters::default(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// The manager reporting collections of `generation`. Without
    /// generations everything is reported as global.
    pub fn manager(&self, generation: GenerationMode) -> &MemoryManager {
        match (self.mode, generation) {
            (HeapMode::Satb, _) | (_, GenerationMode::Global) => &self.global,
            (HeapMode::Generational, GenerationMode::Young) => &self.young,
            (HeapMode::Generational, GenerationMode::Old) => &self.old,
        }
    }

    pub fn managers(&self) -> Vec<&MemoryManager> {
        match self.mode {
            HeapMode::Satb => vec![&self.global],
            HeapMode::Generational => vec![&self.young, &self.old, &self.global],
        }
    }

    pub fn stw_counters(&self) -> &CollectorCounters {
        &self.stw
    }

    pub fn concurrent_counters(&self) -> &CollectorCounters {
        &self.concurrent
    }

    pub fn subscribe(&self) -> Receiver<GcNotification> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn active_manager(&self) -> Option<&MemoryManager> {
        self.active.load().map(|mode| self.manager(mode))
    }

    /// Called before the cycle starts, while counters still describe the
    /// previous one.
    pub fn gc_requested(&self, heap: &Heap, generation: GenerationMode) {
        let allocated = heap.generation(generation).bytes_allocated_since_gc_start();
        self.manager(generation)
            .allocated_since_previous_start
            .store(allocated, Ordering::Relaxed);
    }

    pub fn gc_begin(&self, heap: &Heap, generation: GenerationMode) {
        let manager = self.manager(generation);
        let previous_during = manager
            .last_gc_info()
            .map_or(0, |last| last.allocated_during_collection);
        let since_previous_start = manager.allocated_since_previous_start.load(Ordering::Relaxed) as i64;
        let copied_between_pools = if heap.is_generational() && !generation.is_old() {
            -(heap.old_generation().bytes_allocated_since_gc_start() as i64)
        } else {
            0
        };
        let info = GcStatInfo {
            index: manager.collection_count() + 1,
            start_time: self.epoch.elapsed(),
            usage_before: PoolUsage {
                used: heap.used_by(generation),
                capacity: heap.capacity(),
            },
            allocated_since_previous: since_previous_start - previous_during,
            copied_between_pools,
            gc_threads: heap.workers().max_workers(),
            ..GcStatInfo::default()
        };
        *manager.current.lock() = Some(info);
        self.active.store(Some(generation));
        debug!("{}: collection {} begins", manager.name, manager.collection_count() + 1);
    }

    pub fn gc_end(&self, heap: &Heap, generation: GenerationMode, cause: GcCause) -> Option<Arc<GcStatInfo>> {
        let manager = self.manager(generation);
        let mut info = manager.current.lock().take()?;
        self.active.store(None);

        if heap.is_generational() && !generation.is_old() {
            info.copied_between_pools += heap.old_generation().bytes_allocated_since_gc_start() as i64;
        }
        info.allocated_during_collection =
            heap.generation(generation).bytes_allocated_since_gc_start() as i64;
        info.live_after = heap.used_by(generation);
        info.live_before = info.live_after as i64 - info.allocated_during_collection;
        info.usage_after = PoolUsage {
            used: info.live_after,
            capacity: heap.capacity(),
        };
        if info.garbage_collected.is_none() {
            let before = info.usage_before.used as i64 + info.allocated_during_collection;
            info.garbage_collected = Some((before - info.live_after as i64).max(0) as usize);
        }
        info.cause = Some(cause);
        info.end_time = self.epoch.elapsed();

        manager.collection_count.fetch_add(1, Ordering::Relaxed);
        *manager.accumulated_time.lock() += info.duration();
        let info = Arc::new(info);
        manager.last.store(Some(Arc::clone(&info)));
        debug!(
            "{}: {} ({cause}), {} pauses, {}K collected",
            manager.name,
            manager.gc_end_message,
            info.pauses.len(),
            info.garbage_collected.unwrap_or(0) / 1024
        );

        let notification = GcNotification {
            manager: manager.name,
            action: manager.gc_end_message,
            cause,
            info: Arc::clone(&info),
        };
        self.subscribers
            .lock()
            .retain(|tx| tx.send(notification.clone()).is_ok());
        Some(info)
    }

    pub fn pause_begin(&self, phase: Phase) {
        self.stw.begin();
        trace!("Pause {} begins", phase.event_name());
    }

    pub fn pause_end(&self, phase: Phase, elapsed: Duration) {
        self.stw.end(elapsed);
        if let Some(manager) = self.active_manager() {
            manager.with_current(|info| {
                if info.pauses.len() < MAX_PAUSES_PER_CYCLE {
                    info.pauses.push(PhaseRecord {
                        name: phase.event_name(),
                        duration: elapsed,
                    });
                } else {
                    debug!("Pause {} not recorded, cycle limit reached", phase.event_name());
                }
            });
        }
    }

    pub fn concurrent_phase_begin(&self, phase: Phase) {
        self.concurrent.begin();
        trace!("Concurrent phase {} begins", phase.event_name());
    }

    pub fn concurrent_phase_end(&self, phase: Phase, elapsed: Duration) {
        self.concurrent.end(elapsed);
        if let Some(manager) = self.active_manager() {
            manager.with_current(|info| {
                if info.concurrent_phases.len() < MAX_CONCURRENT_PHASES_PER_CYCLE {
                    info.concurrent_phases.push(PhaseRecord {
                        name: phase.event_name(),
                        duration: elapsed,
                    });
                }
            });
        }
    }

    /// Garbage identified by collection-set selection.
    pub fn record_garbage_found(&self, bytes: usize) {
        if let Some(manager) = self.active_manager() {
            manager.with_current(|info| info.garbage_found = bytes);
        }
    }

    pub fn report_garbage(&self, found: usize, collected: usize) {
        if let Some(manager) = self.active_manager() {
            manager.with_current(|info| {
                info.garbage_found = found;
                info.garbage_collected = Some(collected);
            });
        }
    }

    /// Old allocations about to be reset still count as promotion for the
    /// collection in flight.
    pub fn update_copied_between_pools(&self, copied_before_reset: usize) {
        if let Some(manager) = self.active_manager() {
            manager.with_current(|info| info.copied_between_pools += copied_before_reset as i64);
        }
    }
}
