//! Test utilities for collector tests
//!
//! [`TestFixture`] builds a small heap and offers helpers to allocate object
//! graphs, install roots and run cycles, so unit tests, integration tests and
//! doc examples share one setup.
//!
//! # Examples
//!
//! ```
//! use regiongc::test_utils::TestFixture;
//! use regiongc::types::{Affiliation, GcCause, GenerationMode};
//!
//! let fixture = TestFixture::new().unwrap();
//! let chain = fixture.alloc_chain(Affiliation::Young, 3).unwrap();
//! fixture.root(chain[0]);
//! let gc = fixture.concurrent_gc(GenerationMode::Global);
//! assert!(gc.collect(GcCause::Explicit));
//! ```

use std::sync::Arc;

use crate::{
    cycle::ConcurrentGc,
    error::GcResult,
    heap::{Heap, HeapBuilder},
    options::GcOptions,
    thread::MutatorThread,
    types::{Affiliation, GenerationMode, HeapMode, ObjRef},
};

/// Default region size for tests.
pub const TEST_REGION_SIZE: usize = 4096;
/// Default region count for tests.
pub const TEST_REGION_COUNT: usize = 16;
/// Workers for both pauses and concurrent phases in tests.
pub const TEST_WORKER_COUNT: usize = 2;

/// Options every fixture starts from: small regions, every region with any
/// garbage is a collection-set candidate.
pub fn test_options() -> GcOptions {
    GcOptions::default()
        .with_region_size(TEST_REGION_SIZE)
        .with_region_count(TEST_REGION_COUNT)
        .with_workers(TEST_WORKER_COUNT, TEST_WORKER_COUNT)
        .with_garbage_threshold(0)
}

pub struct TestFixture {
    heap: Arc<Heap>,
}

impl TestFixture {
    pub fn new() -> GcResult<Self> {
        Self::with_options(test_options())
    }

    pub fn generational() -> GcResult<Self> {
        Self::with_options(test_options().with_mode(HeapMode::Generational))
    }

    pub fn with_options(options: GcOptions) -> GcResult<Self> {
        Ok(Self {
            heap: HeapBuilder::new(options).build()?,
        })
    }

    pub fn from_heap(heap: Arc<Heap>) -> Self {
        Self { heap }
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn alloc(&self, affiliation: Affiliation, num_fields: usize) -> GcResult<ObjRef> {
        self.heap.allocate(affiliation, num_fields)
    }

    /// Objects linked through field 0, head first.
    pub fn alloc_chain(&self, affiliation: Affiliation, len: usize) -> GcResult<Vec<ObjRef>> {
        let chain = (0..len)
            .map(|_| self.alloc(affiliation, 1))
            .collect::<GcResult<Vec<_>>>()?;
        for pair in chain.windows(2) {
            self.heap.store_field(pair[0], 0, Some(pair[1]))?;
        }
        Ok(chain)
    }

    /// Unreferenced objects.
    pub fn garbage(&self, affiliation: Affiliation, count: usize) -> GcResult<Vec<ObjRef>> {
        (0..count).map(|_| self.alloc(affiliation, 0)).collect()
    }

    /// Strong VM root holding `obj`. Returns the handle.
    pub fn root(&self, obj: ObjRef) -> usize {
        self.heap.roots().vm_strong().allocate(Some(obj))
    }

    /// Weak VM root holding `obj`. Returns the handle.
    pub fn weak_root(&self, obj: ObjRef) -> usize {
        self.heap.roots().vm_weak().allocate(Some(obj))
    }

    /// Current value of strong root `handle`.
    pub fn root_value(&self, handle: usize) -> Option<ObjRef> {
        self.heap.roots().vm_strong().get(handle)
    }

    pub fn weak_root_value(&self, handle: usize) -> Option<ObjRef> {
        self.heap.roots().vm_weak().get(handle)
    }

    /// Stop allocating into the current regions so the next object starts a
    /// fresh one.
    pub fn retire(&self) {
        self.heap.heap_lock().retire_alloc_regions();
    }

    /// Put the region of `obj` into the collection set.
    pub fn select_for_evacuation(&self, obj: ObjRef) {
        let mut free_set = self.heap.heap_lock();
        free_set.retire_alloc_regions();
        self.heap.collection_set().add_region(self.heap.region_for(obj));
    }

    /// Whether `copy` is where `original` ended up after a finished cycle.
    /// Cleanup drops the forwarding entries of recycled regions, so this
    /// checks placement: a live object in another region, outside the
    /// collection set.
    pub fn moved(&self, original: ObjRef, copy: ObjRef) -> bool {
        copy != original
            && self.heap.region_for(copy).index() != self.heap.region_for(original).index()
            && !self.heap.in_collection_set(copy)
            && self.heap.object(copy).is_ok()
    }

    /// Register a blocked mutator thread with `roots` on its stack.
    pub fn mutator(&self, id: usize, roots: &[ObjRef]) -> MutatorThread {
        let thread = MutatorThread::new(id);
        for obj in roots {
            thread.push_root(Some(*obj));
        }
        self.heap.threads().register(thread.clone());
        thread
    }

    /// A live root and a garbage object sharing one region, so a cycle has
    /// something to evacuate. Returns the root handle and the live object.
    pub fn evacuation_candidate(&self, affiliation: Affiliation) -> GcResult<(usize, ObjRef)> {
        self.retire();
        let live = self.alloc(affiliation, 1)?;
        self.garbage(affiliation, 2)?;
        self.retire();
        Ok((self.root(live), live))
    }

    pub fn concurrent_gc(&self, mode: GenerationMode) -> Arc<ConcurrentGc> {
        ConcurrentGc::new(Arc::clone(&self.heap), mode, false)
    }

    /// Run a cycle and return it with its result.
    pub fn collect(&self, mode: GenerationMode) -> (bool, Arc<ConcurrentGc>) {
        let gc = self.concurrent_gc(mode);
        let ok = gc.collect(crate::types::GcCause::Explicit);
        (ok, gc)
    }

    /// Resume bootstrapped old marking and return the old cycle.
    pub fn resume_old(&self) -> (bool, Arc<ConcurrentGc>) {
        let gc = self.concurrent_gc(GenerationMode::Old);
        let ok = gc.resume_old_marking(crate::types::GcCause::Explicit);
        (ok, gc)
    }
}
