//! The heap context shared by every phase body.
//!
//! [`Heap`] owns regions, mark bits, forwarding, the collection set, the
//! per-generation objects, root storage, mutator threads and the executors the
//! cycle runs on. Phase bodies receive it by reference instead of reaching for
//! globals.
//!
//! Flag ownership:
//!
//! | flag | written by | read by |
//! |---|---|---|
//! | marking | init mark, final mark | SATB barrier, code entry barrier |
//! | evacuation | final mark, init update refs | load barrier, root phases |
//! | weak roots | final mark, init update refs, final roots | weak-root phases, driver |
//! | strong roots | final mark, strong roots | driver |
//! | update refs | init and final update refs | driver, degenerated GC |
//! | has forwarded | final mark, final update refs | load barrier |
//! | aging cycle | cycle policy, final update refs | evacuation |
//! | cancelled | any thread | every concurrent phase |
//!
//! # Examples
//!
//! ```
//! use regiongc::heap::HeapBuilder;
//! use regiongc::options::GcOptions;
//! use regiongc::types::Affiliation;
//!
//! let heap = HeapBuilder::new(GcOptions::default().with_region_count(8))
//!     .build()
//!     .unwrap();
//! let a = heap.allocate(Affiliation::Young, 2).unwrap();
//! let b = heap.allocate(Affiliation::Young, 0).unwrap();
//! heap.store_field(a, 0, Some(b)).unwrap();
//! assert_eq!(heap.load_field(a, 0).unwrap(), Some(b));
//! ```

pub mod collection_set;
pub mod evac_oom;
pub mod evacuation;
pub mod free_set;
pub mod marking_context;
pub mod region;
pub mod update_refs;

use std::sync::{
    atomic::{fence, AtomicBool, AtomicU8, AtomicUsize, Ordering},
    Arc,
};

use crossbeam::queue::SegQueue;
use crossbeam_utils::atomic::AtomicCell;
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    error::{GcError, GcResult},
    fault::FaultInjector,
    generation::Generation,
    interfaces::{AllocRequest, FreeSet, FreeSetStatus, MarkingEngine},
    mark::ConcurrentMark,
    monitoring::MonitoringSupport,
    options::GcOptions,
    phase::{Phase, PhaseTimings},
    roots::RootSet,
    safepoint::SafepointExecutor,
    thread::ThreadRegistry,
    types::{Affiliation, GcCause, GcState, GenerationMode, HeapMode, ObjRef},
    workers::{DefaultWorkerPolicy, WorkerGang, WorkerPolicy},
};

use self::{
    collection_set::CollectionSet,
    evac_oom::EvacOomHandler,
    free_set::RegionFreeSet,
    marking_context::MarkingContext,
    region::{HeapObject, Region},
};

/// Address of the first region.
pub const HEAP_BASE: usize = 0x1000_0000;

/// Assembles a [`Heap`], optionally replacing collaborators.
pub struct HeapBuilder {
    options: GcOptions,
    marking_engine: Option<Arc<dyn MarkingEngine>>,
    free_set: Option<Box<dyn FreeSet>>,
    worker_policy: Option<Box<dyn WorkerPolicy>>,
}

impl HeapBuilder {
    pub fn new(options: GcOptions) -> Self {
        Self {
            options,
            marking_engine: None,
            free_set: None,
            worker_policy: None,
        }
    }

    pub fn with_marking_engine(mut self, engine: Arc<dyn MarkingEngine>) -> Self {
        self.marking_engine = Some(engine);
        self
    }

    pub fn with_free_set(mut self, free_set: Box<dyn FreeSet>) -> Self {
        self.free_set = Some(free_set);
        self
    }

    pub fn with_worker_policy(mut self, policy: Box<dyn WorkerPolicy>) -> Self {
        self.worker_policy = Some(policy);
        self
    }

    pub fn build(self) -> GcResult<Arc<Heap>> {
        crate::logger::try_init();
        self.options.validate()?;
        let options = self.options;
        let regions: Box<[Region]> = (0..options.region_count)
            .map(|i| Region::new(i, HEAP_BASE + i * options.region_size, options.region_size))
            .collect();

        let mut free_set = self
            .free_set
            .unwrap_or_else(|| Box::new(RegionFreeSet::new(options.evac_reserve_percent)));
        free_set.rebuild(&regions, false);

        let threads = Arc::new(ThreadRegistry::new());
        let safepoint = SafepointExecutor::start(Arc::clone(&threads), options.safepoint_timeout)?;
        let workers = WorkerGang::new(options.max_workers())?;

        debug!(
            "Heap: {} regions of {}K, mode {:?}, {} workers",
            options.region_count,
            options.region_size / 1024,
            options.mode,
            options.max_workers()
        );

        Ok(Arc::new(Heap {
            collection_set: CollectionSet::new(options.region_count),
            regions,
            free_set: Mutex::new(free_set),
            gc_state: AtomicU8::new(0),
            strong_roots_in_progress: AtomicBool::new(false),
            aging_cycle: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            cancel_cause: AtomicCell::new(None),
            active_generation: AtomicCell::new(GenerationMode::Global),
            marking_context: MarkingContext::new(),
            forwarding: DashMap::new(),
            evac_oom: EvacOomHandler::new(),
            young: Generation::new(GenerationMode::Young),
            old: Generation::new(GenerationMode::Old),
            global: Generation::new(GenerationMode::Global),
            marking_engine: self
                .marking_engine
                .unwrap_or_else(|| Arc::new(ConcurrentMark::new())),
            roots: RootSet::new(),
            threads,
            safepoint,
            workers,
            worker_policy: self
                .worker_policy
                .unwrap_or_else(|| Box::new(DefaultWorkerPolicy)),
            timings: PhaseTimings::new(),
            fault: FaultInjector::new(options.alloc_failure_injection),
            monitoring: MonitoringSupport::new(options.mode),
            update_refs_cursor: AtomicUsize::new(usize::MAX),
            satb_queue: SegQueue::new(),
            old_satb_queue: SegQueue::new(),
            counters: HeapCounters::default(),
            options,
        }))
    }
}

/// Running totals kept by the heap.
#[derive(Debug, Default)]
pub struct HeapCounters {
    pub bytes_allocated: AtomicUsize,
    pub bytes_evacuated: AtomicUsize,
    pub objects_evacuated: AtomicUsize,
    pub wasted_copies: AtomicUsize,
    pub references_updated: AtomicUsize,
    pub objects_filled: AtomicUsize,
    pub tams_captured: AtomicUsize,
    pub tams_skipped: AtomicUsize,
    pub trash_recycled: AtomicUsize,
    pub code_units_unloaded: AtomicUsize,
    pub class_loaders_unloaded: AtomicUsize,
}

impl HeapCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Relaxed)
    }
}

pub struct Heap {
    options: GcOptions,
    regions: Box<[Region]>,
    free_set: Mutex<Box<dyn FreeSet>>,
    gc_state: AtomicU8,
    strong_roots_in_progress: AtomicBool,
    aging_cycle: AtomicBool,
    cancelled: AtomicBool,
    cancel_cause: AtomicCell<Option<GcCause>>,
    active_generation: AtomicCell<GenerationMode>,
    marking_context: MarkingContext,
    forwarding: DashMap<usize, usize>,
    collection_set: CollectionSet,
    evac_oom: EvacOomHandler,
    young: Generation,
    old: Generation,
    global: Generation,
    marking_engine: Arc<dyn MarkingEngine>,
    roots: RootSet,
    threads: Arc<ThreadRegistry>,
    safepoint: SafepointExecutor,
    workers: WorkerGang,
    worker_policy: Box<dyn WorkerPolicy>,
    timings: PhaseTimings,
    fault: FaultInjector,
    monitoring: MonitoringSupport,
    update_refs_cursor: AtomicUsize,
    satb_queue: SegQueue<ObjRef>,
    old_satb_queue: SegQueue<ObjRef>,
    counters: HeapCounters,
}

impl Heap {
    pub fn options(&self) -> &GcOptions {
        &self.options
    }

    pub fn mode(&self) -> HeapMode {
        self.options.mode
    }

    pub fn is_generational(&self) -> bool {
        self.options.is_generational()
    }

    pub fn unload_classes(&self) -> bool {
        self.options.unload_classes
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region(&self, index: usize) -> &Region {
        &self.regions[index]
    }

    pub fn region_index_for(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(HEAP_BASE)?;
        let idx = offset / self.options.region_size;
        (idx < self.regions.len()).then_some(idx)
    }

    /// Region holding `obj`. A reference outside the heap is a corrupted slot.
    pub fn region_for(&self, obj: ObjRef) -> &Region {
        match self.region_index_for(obj.addr()) {
            Some(idx) => &self.regions[idx],
            None => panic!("reference {obj:?} is outside the heap"),
        }
    }

    pub fn generation(&self, mode: GenerationMode) -> &Generation {
        match mode {
            GenerationMode::Young => &self.young,
            GenerationMode::Old => &self.old,
            GenerationMode::Global => &self.global,
        }
    }

    pub fn young_generation(&self) -> &Generation {
        &self.young
    }

    pub fn old_generation(&self) -> &Generation {
        &self.old
    }

    pub fn global_generation(&self) -> &Generation {
        &self.global
    }

    pub fn active_generation(&self) -> GenerationMode {
        self.active_generation.load()
    }

    pub fn set_active_generation(&self, mode: GenerationMode) {
        self.active_generation.store(mode);
    }

    pub fn marking_context(&self) -> &MarkingContext {
        &self.marking_context
    }

    pub fn marking_engine(&self) -> &Arc<dyn MarkingEngine> {
        &self.marking_engine
    }

    pub fn collection_set(&self) -> &CollectionSet {
        &self.collection_set
    }

    pub fn evac_oom(&self) -> &EvacOomHandler {
        &self.evac_oom
    }

    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.threads
    }

    pub fn safepoint(&self) -> &SafepointExecutor {
        &self.safepoint
    }

    pub fn workers(&self) -> &WorkerGang {
        &self.workers
    }

    pub fn worker_policy(&self) -> &dyn WorkerPolicy {
        self.worker_policy.as_ref()
    }

    pub fn timings(&self) -> &PhaseTimings {
        &self.timings
    }

    pub fn fault_injector(&self) -> &FaultInjector {
        &self.fault
    }

    pub fn monitoring(&self) -> &MonitoringSupport {
        &self.monitoring
    }

    pub fn counters(&self) -> &HeapCounters {
        &self.counters
    }

    // ---- gc state ----

    pub fn gc_state(&self) -> GcState {
        GcState::from_bits_truncate(self.gc_state.load(Ordering::Acquire))
    }

    fn set_gc_state(&self, mask: GcState, value: bool) {
        if value {
            self.gc_state.fetch_or(mask.bits(), Ordering::AcqRel);
        } else {
            self.gc_state.fetch_and(!mask.bits(), Ordering::AcqRel);
        }
    }

    pub fn is_concurrent_mark_in_progress(&self) -> bool {
        self.gc_state().contains(GcState::MARKING)
    }

    pub fn is_concurrent_young_mark_in_progress(&self) -> bool {
        self.gc_state().contains(GcState::YOUNG_MARKING)
    }

    pub fn is_concurrent_old_mark_in_progress(&self) -> bool {
        self.gc_state().contains(GcState::OLD_MARKING)
    }

    /// Flip marking bits for one generation. The combined bit stays on while
    /// any generation is marking.
    pub fn set_concurrent_mark_in_progress(&self, mode: GenerationMode, value: bool) {
        match mode {
            GenerationMode::Young => self.set_gc_state(GcState::YOUNG_MARKING, value),
            GenerationMode::Old => self.set_gc_state(GcState::OLD_MARKING, value),
            GenerationMode::Global => {
                self.set_gc_state(GcState::YOUNG_MARKING | GcState::OLD_MARKING, value)
            }
        }
        let any = self
            .gc_state()
            .intersects(GcState::YOUNG_MARKING | GcState::OLD_MARKING);
        self.set_gc_state(GcState::MARKING, any);
    }

    pub fn is_evacuation_in_progress(&self) -> bool {
        self.gc_state().contains(GcState::EVACUATION)
    }

    pub fn set_evacuation_in_progress(&self, value: bool) {
        self.set_gc_state(GcState::EVACUATION, value);
    }

    pub fn is_update_refs_in_progress(&self) -> bool {
        self.gc_state().contains(GcState::UPDATE_REFS)
    }

    pub fn set_update_refs_in_progress(&self, value: bool) {
        self.set_gc_state(GcState::UPDATE_REFS, value);
    }

    pub fn has_forwarded_objects(&self) -> bool {
        self.gc_state().contains(GcState::HAS_FORWARDED)
    }

    pub fn set_has_forwarded_objects(&self, value: bool) {
        self.set_gc_state(GcState::HAS_FORWARDED, value);
    }

    pub fn is_concurrent_weak_root_in_progress(&self) -> bool {
        self.gc_state().contains(GcState::WEAK_ROOTS)
    }

    pub fn set_concurrent_weak_root_in_progress(&self, value: bool) {
        self.set_gc_state(GcState::WEAK_ROOTS, value);
    }

    pub fn is_concurrent_strong_root_in_progress(&self) -> bool {
        self.strong_roots_in_progress.load(Ordering::Acquire)
    }

    pub fn set_concurrent_strong_root_in_progress(&self, value: bool) {
        self.strong_roots_in_progress.store(value, Ordering::Release);
    }

    pub fn is_aging_cycle(&self) -> bool {
        self.aging_cycle.load(Ordering::Acquire)
    }

    pub fn set_aging_cycle(&self, value: bool) {
        self.aging_cycle.store(value, Ordering::Release);
    }

    /// Any cycle state that mutator barriers must honour.
    pub fn is_gc_in_progress(&self) -> bool {
        !self.gc_state().is_empty()
    }

    // ---- cancellation ----

    /// Request the running cycle to stop. Returns true if this call set the flag.
    pub fn cancel_gc(&self, cause: GcCause) -> bool {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.cancel_cause.store(Some(cause));
            warn!("Cancelling GC: {cause}");
            true
        } else {
            false
        }
    }

    pub fn cancelled_gc(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancelled_cause(&self) -> Option<GcCause> {
        self.cancel_cause.load()
    }

    /// Reset cancellation once the caller has unwound to a consistent state.
    pub fn clear_cancelled_gc(&self, clear_oom_handler: bool) {
        self.cancelled.store(false, Ordering::Release);
        self.cancel_cause.store(None);
        if clear_oom_handler {
            self.evac_oom.clear();
        }
    }

    /// Fault-injection hook, a no-op unless a test armed `site`.
    pub fn try_inject_alloc_failure(&self, site: Phase) -> bool {
        if self.fault.should_fail(site) {
            self.cancel_gc(GcCause::InjectedFailure);
            true
        } else {
            false
        }
    }

    // ---- heap lock and free set ----

    /// Take the heap lock. The free set is reachable only through it.
    pub fn heap_lock(&self) -> MutexGuard<'_, Box<dyn FreeSet>> {
        self.free_set.lock()
    }

    /// Return trash regions to the free set. A no-op without trash.
    pub fn recycle_trash(&self) -> usize {
        let recycled = self.heap_lock().recycle_trash(&self.regions);
        for idx in &recycled {
            let region = &self.regions[*idx];
            let (bottom, end) = (region.bottom(), region.end());
            self.marking_context.clear_range(bottom, end);
            self.forwarding.retain(|from, _| *from < bottom || *from >= end);
            self.young.remembered_set().forget_range(bottom, end);
        }
        self.counters
            .trash_recycled
            .fetch_add(recycled.len(), Ordering::Relaxed);
        recycled.len()
    }

    pub fn rebuild_free_set(&self, concurrent: bool) {
        self.heap_lock().rebuild(&self.regions, concurrent);
    }

    pub fn free_set_status(&self) -> FreeSetStatus {
        self.heap_lock().status(&self.regions)
    }

    pub fn log_free_set_status(&self) {
        self.heap_lock().log_status(&self.regions);
    }

    // ---- allocation and object access ----

    /// Mutator allocation. Failing while a cycle runs cancels it.
    pub fn allocate(&self, affiliation: Affiliation, num_fields: usize) -> GcResult<ObjRef> {
        let object = HeapObject::new(num_fields);
        let size = object.size();
        match self.allocate_object(AllocRequest::mutator(size, affiliation), object) {
            Some(obj) => {
                self.counters.bytes_allocated.fetch_add(size, Ordering::Relaxed);
                self.generation_of(affiliation).increase_allocated(size);
                self.global.increase_allocated(size);
                Ok(obj)
            }
            None => {
                if self.is_gc_in_progress() {
                    self.cancel_gc(GcCause::AllocationFailure);
                }
                Err(GcError::OutOfMemory { requested: size })
            }
        }
    }

    pub(crate) fn allocate_object(&self, request: AllocRequest, object: HeapObject) -> Option<ObjRef> {
        let mut free_set = self.heap_lock();
        let idx = free_set.region_for(&self.regions, request)?;
        let addr = self.regions[idx].allocate(object)?;
        ObjRef::from_raw(addr)
    }

    fn generation_of(&self, affiliation: Affiliation) -> &Generation {
        match affiliation {
            Affiliation::Old => &self.old,
            Affiliation::Young | Affiliation::Free => &self.young,
        }
    }

    pub fn object(&self, obj: ObjRef) -> GcResult<Arc<HeapObject>> {
        self.region_index_for(obj.addr())
            .and_then(|idx| self.regions[idx].object(obj.addr()))
            .ok_or(GcError::InvalidObject(obj.addr()))
    }

    /// Load a field through the load-reference barrier.
    pub fn load_field(&self, obj: ObjRef, index: usize) -> GcResult<Option<ObjRef>> {
        let obj = self.resolve_for_access(obj);
        let object = self.object(obj)?;
        let slot = object.field(index).ok_or(GcError::FieldOutOfBounds {
            object: obj.addr(),
            index,
        })?;
        Ok(self.load_reference_barrier(slot))
    }

    /// Store a field with the SATB pre-barrier and card marking.
    pub fn store_field(&self, obj: ObjRef, index: usize, value: Option<ObjRef>) -> GcResult<()> {
        let obj = self.resolve_for_access(obj);
        let object = self.object(obj)?;
        let slot = object.field(index).ok_or(GcError::FieldOutOfBounds {
            object: obj.addr(),
            index,
        })?;
        let value = value.map(|v| self.resolve_for_access(v));
        if self.is_concurrent_mark_in_progress() {
            if let Some(previous) = ObjRef::from_raw(slot.load(Ordering::Acquire)) {
                self.satb_queue.push(previous);
            }
        }
        slot.store(ObjRef::encode(value), Ordering::Release);
        if let Some(value) = value {
            if self.is_generational()
                && self.region_for(obj).affiliation() == Affiliation::Old
                && self.region_for(value).affiliation() == Affiliation::Young
            {
                self.young.remembered_set().record(obj.addr());
            }
        }
        Ok(())
    }

    /// Load `slot`, evacuating or resolving a collection-set referent and
    /// healing the slot.
    pub fn load_reference_barrier(&self, slot: &AtomicUsize) -> Option<ObjRef> {
        let raw = slot.load(Ordering::Acquire);
        let obj = ObjRef::from_raw(raw)?;
        if !self.has_forwarded_objects() || !self.in_collection_set(obj) {
            return Some(obj);
        }
        let fwd = self.resolve_for_access(obj);
        if fwd != obj {
            let _ = slot.compare_exchange(raw, fwd.addr(), Ordering::AcqRel, Ordering::Acquire);
        }
        Some(fwd)
    }

    fn resolve_for_access(&self, obj: ObjRef) -> ObjRef {
        if !self.has_forwarded_objects() || !self.in_collection_set(obj) {
            return obj;
        }
        if self.is_evacuation_in_progress() {
            let _scope = self.evac_oom.enter();
            self.evacuate_object(obj)
        } else {
            self.resolve_forwarded(obj)
        }
    }

    // ---- liveness ----

    /// Marked, or allocated at or above TAMS in its region.
    pub fn is_marked(&self, obj: ObjRef) -> bool {
        let region = self.region_for(obj);
        obj.addr() >= region.tams() || self.marking_context.is_marked(obj.addr())
    }

    pub fn in_collection_set(&self, obj: ObjRef) -> bool {
        self.region_index_for(obj.addr())
            .is_some_and(|idx| self.collection_set.is_in(idx))
    }

    pub fn is_in_active_generation(&self, obj: ObjRef) -> bool {
        self.active_generation()
            .contains(self.region_for(obj).affiliation())
    }

    /// Mark `obj` for `generation` and queue it for tracing. Objects outside
    /// the generation are skipped; old objects seen while bootstrapping are
    /// deferred to the old generation's queue.
    pub fn mark_object(&self, generation: &Generation, obj: ObjRef) -> bool {
        let region = self.region_for(obj);
        if !generation.mode().contains(region.affiliation()) {
            if generation.mode().is_young()
                && region.affiliation() == Affiliation::Old
                && self.is_concurrent_old_mark_in_progress()
            {
                self.old_satb_queue.push(obj);
            }
            return false;
        }
        if obj.addr() >= region.tams() {
            return false;
        }
        if !self.marking_context.mark(obj.addr()) {
            return false;
        }
        if let Some(object) = region.object(obj.addr()) {
            region.add_live_bytes(object.size());
        }
        generation.mark_queue().push(obj);
        true
    }

    /// Keep `obj` alive for the running mark. A no-op outside marking.
    pub fn keep_alive(&self, obj: ObjRef) {
        if self.is_concurrent_mark_in_progress() {
            self.satb_queue.push(obj);
        }
    }

    /// Move SATB-enqueued references into the generation's mark queue.
    pub fn drain_satb_buffers(&self, generation: &Generation) -> usize {
        let mut drained = 0;
        while let Some(obj) = self.satb_queue.pop() {
            if self.region_index_for(obj.addr()).is_some() {
                self.mark_object(generation, obj);
            }
            drained += 1;
        }
        drained
    }

    pub fn has_old_satb_entries(&self) -> bool {
        !self.old_satb_queue.is_empty()
    }

    /// Hand deferred old-generation references over to old marking.
    pub fn purge_old_satb_buffers(&self) -> usize {
        let mut transferred = 0;
        while let Some(obj) = self.old_satb_queue.pop() {
            let obj = self.resolve_forwarded(obj);
            if self.region_for(obj).is_active() {
                self.mark_object(&self.old, obj);
                transferred += 1;
            }
        }
        debug!("Transferred {transferred} deferred references to old marking");
        transferred
    }

    // ---- region state transitions driven by the cycle ----

    /// Capture TAMS for every active region `filter` accepts.
    pub fn capture_top_at_mark_start(&self, filter: impl Fn(&Region) -> bool) -> usize {
        let mut captured = 0;
        let mut skipped = 0;
        for region in self.regions.iter().filter(|r| r.is_active() && filter(r)) {
            if region.capture_tams() {
                captured += 1;
            } else {
                skipped += 1;
            }
        }
        self.counters.tams_captured.fetch_add(captured, Ordering::Relaxed);
        self.counters.tams_skipped.fetch_add(skipped, Ordering::Relaxed);
        // Workers must observe the new TAMS before they mark.
        fence(Ordering::SeqCst);
        captured
    }

    /// Concurrent root phases that follow final mark.
    pub fn prepare_concurrent_roots(&self) {
        self.set_concurrent_strong_root_in_progress(!self.collection_set.is_empty());
        self.set_concurrent_weak_root_in_progress(true);
        if self.unload_classes() {
            self.roots.class_loaders().reset_liveness();
            self.roots.code_cache().prepare_concurrent_unloading();
        }
    }

    pub fn finish_concurrent_roots(&self) {
        debug_assert!(
            !self.is_concurrent_weak_root_in_progress(),
            "weak roots still in progress when finishing concurrent roots"
        );
        if self.unload_classes() {
            self.roots.code_cache().finish_concurrent_unloading();
        }
    }

    pub fn used(&self) -> usize {
        self.regions.iter().map(Region::used).sum()
    }

    pub fn used_by(&self, mode: GenerationMode) -> usize {
        self.regions
            .iter()
            .filter(|r| mode.contains(r.affiliation()))
            .map(Region::used)
            .sum()
    }

    pub fn capacity(&self) -> usize {
        self.options.heap_size()
    }

    pub fn log_heap_usage(&self, phase: Phase) {
        debug!(
            "{}: used {}K of {}K",
            phase.title(),
            self.used() / 1024,
            self.capacity() / 1024
        );
    }
}
