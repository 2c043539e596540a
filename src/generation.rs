//! Generations and their remembered set.
//!
//! A [`Generation`] is a logical partition of the heap. During its cycle the
//! driver owns it exclusively; between cycles other subsystems read its flags.

use std::{
    collections::HashSet,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crossbeam::queue::SegQueue;
use dashmap::DashSet;
use log::debug;
use parking_lot::RwLock;

use crate::{
    heap::{
        region::{Region, RegionState},
        Heap,
    },
    reference::ReferenceProcessor,
    types::{Affiliation, GenerationMode, ObjRef},
};

/// Old objects that may hold references into the young generation.
///
/// Mutator stores dirty the write view. `swap` snapshots it into the read
/// view that the next young cycle scans.
#[derive(Debug, Default)]
pub struct RememberedSet {
    write: DashSet<usize>,
    read: RwLock<HashSet<usize>>,
}

impl RememberedSet {
    pub fn record(&self, old_object: usize) {
        self.write.insert(old_object);
    }

    pub fn is_dirty(&self, old_object: usize) -> bool {
        self.write.contains(&old_object)
    }

    pub fn swap(&self) {
        let snapshot: HashSet<usize> = self.write.iter().map(|e| *e).collect();
        *self.read.write() = snapshot;
    }

    pub fn read_snapshot(&self) -> Vec<usize> {
        self.read.read().iter().copied().collect()
    }

    /// A scanned object no longer points into young.
    pub fn clean(&self, old_object: usize) {
        self.write.remove(&old_object);
    }

    pub fn on_object_moved(&self, from: usize, to: usize) {
        if self.write.remove(&from).is_some() {
            self.write.insert(to);
        }
    }

    pub fn forget_range(&self, bottom: usize, end: usize) {
        self.write.retain(|addr| *addr < bottom || *addr >= end);
        self.read.write().retain(|addr| *addr < bottom || *addr >= end);
    }

    pub fn len(&self) -> usize {
        self.write.len()
    }

    pub fn is_empty(&self) -> bool {
        self.write.is_empty()
    }
}

pub struct Generation {
    mode: GenerationMode,
    mark_in_progress: AtomicBool,
    mark_complete: AtomicBool,
    mark_queue: SegQueue<ObjRef>,
    remembered_set: RememberedSet,
    ref_processor: ReferenceProcessor,
    bytes_allocated_since_gc_start: AtomicUsize,
}

impl Generation {
    pub fn new(mode: GenerationMode) -> Self {
        Self {
            mode,
            mark_in_progress: AtomicBool::new(false),
            mark_complete: AtomicBool::new(false),
            mark_queue: SegQueue::new(),
            remembered_set: RememberedSet::default(),
            ref_processor: ReferenceProcessor::new(),
            bytes_allocated_since_gc_start: AtomicUsize::new(0),
        }
    }

    pub fn mode(&self) -> GenerationMode {
        self.mode
    }

    pub fn name(&self) -> &'static str {
        self.mode.name()
    }

    pub fn contains_region(&self, region: &Region) -> bool {
        self.mode.contains(region.affiliation())
    }

    pub fn mark_queue(&self) -> &SegQueue<ObjRef> {
        &self.mark_queue
    }

    pub fn remembered_set(&self) -> &RememberedSet {
        &self.remembered_set
    }

    pub fn ref_processor(&self) -> &ReferenceProcessor {
        &self.ref_processor
    }

    pub fn is_concurrent_mark_in_progress(&self) -> bool {
        self.mark_in_progress.load(Ordering::Acquire)
    }

    pub fn set_concurrent_mark_in_progress(&self, heap: &Heap, in_progress: bool) {
        self.mark_in_progress.store(in_progress, Ordering::Release);
        heap.set_concurrent_mark_in_progress(self.mode, in_progress);
    }

    pub fn is_mark_complete(&self) -> bool {
        self.mark_complete.load(Ordering::Acquire)
    }

    pub fn set_mark_complete(&self) {
        self.mark_complete.store(true, Ordering::Release);
    }

    pub fn set_mark_incomplete(&self) {
        self.mark_complete.store(false, Ordering::Release);
    }

    pub fn increase_allocated(&self, bytes: usize) {
        self.bytes_allocated_since_gc_start
            .fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_allocated_since_gc_start(&self) -> usize {
        self.bytes_allocated_since_gc_start.load(Ordering::Relaxed)
    }

    pub fn reset_bytes_allocated_since_gc_start(&self) {
        self.bytes_allocated_since_gc_start.store(0, Ordering::Relaxed);
    }

    pub fn used(&self, heap: &Heap) -> usize {
        heap.used_by(self.mode)
    }

    /// No mark bits set in any region of this generation.
    pub fn is_bitmap_clear(&self, heap: &Heap) -> bool {
        heap.regions()
            .iter()
            .filter(|r| self.contains_region(r))
            .all(|r| heap.marking_context().is_range_clear(r.bottom(), r.end()))
    }

    /// Concurrent reset: clear mark bits and liveness and move TAMS to top for
    /// this generation, and for old as well when bootstrapping an old cycle.
    pub fn prepare_gc(&self, heap: &Heap, bootstrap: bool) {
        let covers = |r: &Region| {
            self.contains_region(r) || (bootstrap && r.affiliation() == Affiliation::Old)
        };
        let mut reset = 0;
        for region in heap.regions().iter().filter(|r| covers(r)) {
            heap.marking_context()
                .clear_range(region.bottom(), region.end());
            region.reset_live_bytes();
            region.capture_tams();
            reset += 1;
        }
        while self.mark_queue.pop().is_some() {}
        self.set_mark_incomplete();
        self.reset_bytes_allocated_since_gc_start();
        if bootstrap {
            heap.old_generation().set_mark_incomplete();
        }
        debug!("Reset {reset} regions for {} marking", self.name());
    }

    pub fn swap_remembered_set(&self) {
        self.remembered_set.swap();
    }

    /// Mark young objects referenced from dirty old objects.
    pub fn scan_remembered_set(&self, heap: &Heap) -> usize {
        debug_assert!(self.mode.is_young(), "only young cycles scan the remembered set");
        let mut roots = 0;
        for addr in self.remembered_set.read_snapshot() {
            let Some(obj) = ObjRef::from_raw(addr) else {
                continue;
            };
            let Ok(object) = heap.object(obj) else {
                self.remembered_set.clean(addr);
                continue;
            };
            let mut points_young = false;
            for referent in object.references() {
                if heap.region_for(referent).affiliation() == Affiliation::Young {
                    points_young = true;
                    if heap.mark_object(self, referent) {
                        roots += 1;
                    }
                }
            }
            if !points_young {
                self.remembered_set.clean(addr);
            }
        }
        debug!("Remembered set scan marked {roots} young objects");
        roots
    }

    /// Select the collection set after marking. Regions without live data
    /// become trash immediately. Returns whether the set spans generations.
    pub fn prepare_regions_and_collection_set(&self, heap: &Heap, concurrent: bool) -> bool {
        let threshold = heap.options().garbage_threshold_percent * heap.options().region_size / 100;
        let cset = heap.collection_set();
        let mut immediate_regions = 0;
        let mut immediate_garbage = 0;
        {
            let mut free_set = heap.heap_lock();
            free_set.retire_alloc_regions();
            for region in heap
                .regions()
                .iter()
                .filter(|r| r.state() == RegionState::Regular)
                .filter(|r| self.contains_region(r))
            {
                let below_tams = region.tams() - region.bottom();
                if below_tams == 0 {
                    continue;
                }
                if region.live_bytes() == 0 && region.top() == region.tams() {
                    immediate_garbage += region.used();
                    immediate_regions += 1;
                    region.make_trash();
                } else if region.garbage() > 0 && region.garbage() >= threshold {
                    cset.add_region(region);
                }
            }
            free_set.rebuild(heap.regions(), concurrent);
        }
        heap.monitoring()
            .record_garbage_found(immediate_garbage + cset.garbage());
        debug!(
            "Collection set ({}): {} regions, {}K garbage; {} immediate trash regions, {}K",
            self.name(),
            cset.count(),
            cset.garbage() / 1024,
            immediate_regions,
            immediate_garbage / 1024
        );
        cset.is_mixed()
    }
}
