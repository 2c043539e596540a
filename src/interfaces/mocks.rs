// Counting collaborators for unit tests.
//
// Each mock delegates to the production implementation and records how the
// cycle drove it, so tests can assert call order and counts without
// reimplementing marking or free-set bookkeeping.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    generation::Generation,
    heap::{free_set::RegionFreeSet, region::Region, Heap},
    interfaces::{AllocRequest, FreeSet, FreeSetStatus, MarkingEngine},
    mark::ConcurrentMark,
    types::{GcCause, GenerationMode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkCall {
    Roots(GenerationMode),
    Concurrent(GenerationMode),
    Finish(GenerationMode),
}

/// Marking engine that logs each call and can cancel the cycle mid-mark.
#[derive(Default)]
pub struct CountingMarkingEngine {
    inner: ConcurrentMark,
    calls: Mutex<Vec<MarkCall>>,
    cancel_during_mark: AtomicBool,
}

impl CountingMarkingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Cancel the heap, as an allocation failure would, on the next
    /// concurrent mark.
    pub fn cancel_during_next_mark(&self) {
        self.cancel_during_mark.store(true, Ordering::Release);
    }

    pub fn calls(&self) -> Vec<MarkCall> {
        self.calls.lock().clone()
    }
}

impl MarkingEngine for CountingMarkingEngine {
    fn mark_concurrent_roots(&self, heap: &Heap, generation: &Generation) {
        self.calls.lock().push(MarkCall::Roots(generation.mode()));
        self.inner.mark_concurrent_roots(heap, generation);
    }

    fn concurrent_mark(&self, heap: &Heap, generation: &Generation) {
        self.calls.lock().push(MarkCall::Concurrent(generation.mode()));
        if self.cancel_during_mark.swap(false, Ordering::AcqRel) {
            heap.cancel_gc(GcCause::AllocationFailure);
        }
        self.inner.concurrent_mark(heap, generation);
    }

    fn finish_mark(&self, heap: &Heap, generation: &Generation) {
        self.calls.lock().push(MarkCall::Finish(generation.mode()));
        self.inner.finish_mark(heap, generation);
    }
}

#[derive(Debug, Default)]
pub struct FreeSetCalls {
    pub concurrent_rebuilds: AtomicUsize,
    pub stw_rebuilds: AtomicUsize,
    pub recycled: AtomicUsize,
}

/// Region free set that counts rebuilds and recycled regions.
pub struct CountingFreeSet {
    inner: RegionFreeSet,
    calls: Arc<FreeSetCalls>,
}

impl CountingFreeSet {
    pub fn new(reserve_percent: usize) -> (Box<Self>, Arc<FreeSetCalls>) {
        let calls = Arc::new(FreeSetCalls::default());
        let free_set = Box::new(Self {
            inner: RegionFreeSet::new(reserve_percent),
            calls: Arc::clone(&calls),
        });
        (free_set, calls)
    }
}

impl FreeSet for CountingFreeSet {
    fn region_for(&mut self, regions: &[Region], request: AllocRequest) -> Option<usize> {
        self.inner.region_for(regions, request)
    }

    fn retire_alloc_regions(&mut self) {
        self.inner.retire_alloc_regions();
    }

    fn recycle_trash(&mut self, regions: &[Region]) -> Vec<usize> {
        let recycled = self.inner.recycle_trash(regions);
        self.calls.recycled.fetch_add(recycled.len(), Ordering::Relaxed);
        recycled
    }

    fn rebuild(&mut self, regions: &[Region], concurrent: bool) {
        let counter = if concurrent {
            &self.calls.concurrent_rebuilds
        } else {
            &self.calls.stw_rebuilds
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.inner.rebuild(regions, concurrent);
    }

    fn status(&self, regions: &[Region]) -> FreeSetStatus {
        self.inner.status(regions)
    }

    fn log_status(&self, regions: &[Region]) {
        self.inner.log_status(regions);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        heap::HeapBuilder,
        test_utils::{test_options, TestFixture},
        types::{Affiliation, DegenPoint},
    };

    #[test]
    fn cycle_drives_marking_in_order() {
        let engine = CountingMarkingEngine::new();
        let heap = HeapBuilder::new(test_options())
            .with_marking_engine(engine.clone())
            .build()
            .unwrap();
        let fixture = TestFixture::from_heap(heap);
        fixture.evacuation_candidate(Affiliation::Young).unwrap();

        assert!(fixture.collect(GenerationMode::Global).0);
        assert_eq!(
            engine.calls(),
            vec![
                MarkCall::Roots(GenerationMode::Global),
                MarkCall::Concurrent(GenerationMode::Global),
                MarkCall::Finish(GenerationMode::Global),
            ]
        );
    }

    #[test]
    fn cancellation_inside_marking_skips_finish() {
        let engine = CountingMarkingEngine::new();
        let heap = HeapBuilder::new(test_options())
            .with_marking_engine(engine.clone())
            .build()
            .unwrap();
        let fixture = TestFixture::from_heap(heap);
        fixture.evacuation_candidate(Affiliation::Young).unwrap();
        engine.cancel_during_next_mark();

        let (ok, gc) = fixture.collect(GenerationMode::Global);
        assert!(!ok);
        assert_eq!(gc.degen_point(), DegenPoint::Mark);
        assert!(!engine
            .calls()
            .iter()
            .any(|c| matches!(c, MarkCall::Finish(_))));
    }

    #[test]
    fn evacuating_cycle_rebuilds_free_set_and_recycles() {
        let (free_set, calls) = CountingFreeSet::new(10);
        let heap = HeapBuilder::new(test_options())
            .with_free_set(free_set)
            .build()
            .unwrap();
        let fixture = TestFixture::from_heap(heap);
        fixture.evacuation_candidate(Affiliation::Young).unwrap();
        let stw_before = calls.stw_rebuilds.load(Ordering::Relaxed);

        assert!(fixture.collect(GenerationMode::Global).0);
        // Once after cset selection, once at final update refs.
        assert_eq!(calls.concurrent_rebuilds.load(Ordering::Relaxed), 2);
        assert_eq!(calls.stw_rebuilds.load(Ordering::Relaxed), stw_before);
        assert!(calls.recycled.load(Ordering::Relaxed) >= 1);
    }
}
