//! Root storage and the visitor capability used to walk it.
//!
//! Roots live outside the heap: VM handle storages (strong and weak), class
//! loader data, executable code units, and mutator stacks (see
//! [`crate::thread`]). Phases walk them through [`RootVisitor`], implementing
//! only the operations they need.

use std::sync::{
    atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    Arc,
};

use log::debug;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};

use crate::{heap::Heap, types::ObjRef};

/// Slots claimed per worker step when walking an [`OopStorage`].
const CLAIM_CHUNK: usize = 32;

/// Tagged root operations. Each phase overrides the subset it needs.
pub trait RootVisitor: Sync {
    fn visit_strong_root(&self, _slot: &AtomicUsize) {}

    fn visit_weak_root(&self, _slot: &AtomicUsize) {}

    fn visit_code_unit(&self, _unit: &CodeUnit) {}

    /// A code unit whose references are weak because classes unload.
    fn visit_weak_code_unit(&self, _unit: &CodeUnit) {}
}

/// An append-only table of reference slots. Released slots hold null.
pub struct OopStorage {
    name: &'static str,
    slots: RwLock<Vec<AtomicUsize>>,
    dead_reported: AtomicUsize,
}

impl OopStorage {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slots: RwLock::new(Vec::new()),
            dead_reported: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Store `obj` in a new slot and return its handle.
    pub fn allocate(&self, obj: Option<ObjRef>) -> usize {
        let mut slots = self.slots.write();
        slots.push(AtomicUsize::new(ObjRef::encode(obj)));
        slots.len() - 1
    }

    pub fn get(&self, handle: usize) -> Option<ObjRef> {
        self.slots
            .read()
            .get(handle)
            .and_then(|s| ObjRef::from_raw(s.load(Ordering::Acquire)))
    }

    pub fn set(&self, handle: usize, obj: Option<ObjRef>) {
        if let Some(slot) = self.slots.read().get(handle) {
            slot.store(ObjRef::encode(obj), Ordering::Release);
        }
    }

    pub fn release(&self, handle: usize) {
        self.set(handle, None);
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every slot on the calling thread.
    pub fn oops_do(&self, mut f: impl FnMut(&AtomicUsize)) {
        for slot in self.slots.read().iter() {
            f(slot);
        }
    }

    pub fn par_state(&self) -> OopStorageParState<'_> {
        OopStorageParState {
            storage: self,
            next: AtomicUsize::new(0),
            dead: AtomicUsize::new(0),
        }
    }

    pub fn dead_reported(&self) -> usize {
        self.dead_reported.load(Ordering::Relaxed)
    }
}

/// Shared iteration state letting several workers split one storage.
pub struct OopStorageParState<'a> {
    storage: &'a OopStorage,
    next: AtomicUsize,
    dead: AtomicUsize,
}

impl OopStorageParState<'_> {
    /// Claim chunks until the storage is exhausted.
    pub fn oops_do(&self, mut f: impl FnMut(&AtomicUsize)) {
        let slots = self.storage.slots.read();
        loop {
            let start = self.next.fetch_add(CLAIM_CHUNK, Ordering::AcqRel);
            if start >= slots.len() {
                break;
            }
            let end = (start + CLAIM_CHUNK).min(slots.len());
            for slot in &slots[start..end] {
                f(slot);
            }
        }
    }

    pub fn note_dead(&self, count: usize) {
        self.dead.fetch_add(count, Ordering::Relaxed);
    }

    /// Publish the number of slots this pass cleared.
    pub fn report_num_dead(&self) {
        let dead = self.dead.load(Ordering::Relaxed);
        self.storage.dead_reported.fetch_add(dead, Ordering::Relaxed);
        if dead > 0 {
            debug!("{}: {dead} dead entries", self.storage.name);
        }
    }
}

/// Snapshot of items split between workers one at a time.
pub struct ClaimingIter<T> {
    items: Vec<T>,
    next: AtomicUsize,
}

impl<T> ClaimingIter<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            next: AtomicUsize::new(0),
        }
    }

    pub fn claim(&self) -> Option<&T> {
        self.items.get(self.next.fetch_add(1, Ordering::AcqRel))
    }

    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        while let Some(item) = self.claim() {
            f(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Liveness {
    Unknown = 0,
    Alive = 1,
    Dead = 2,
}

impl Liveness {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Liveness::Alive,
            2 => Liveness::Dead,
            _ => Liveness::Unknown,
        }
    }
}

/// Metadata owned by one class loader. The holder is weak when classes
/// may unload; handles are always strong.
pub struct ClassLoaderData {
    id: usize,
    holder: AtomicUsize,
    handles: OopStorage,
    liveness: AtomicU8,
    unloaded: AtomicBool,
}

impl ClassLoaderData {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn holder(&self) -> Option<ObjRef> {
        ObjRef::from_raw(self.holder.load(Ordering::Acquire))
    }

    pub fn holder_slot(&self) -> &AtomicUsize {
        &self.holder
    }

    pub fn handles(&self) -> &OopStorage {
        &self.handles
    }

    /// Compute and cache liveness. A loader without holder never unloads.
    pub fn is_alive(&self, heap: &Heap) -> bool {
        let cached = self.cached_liveness();
        if cached != Liveness::Unknown {
            return cached == Liveness::Alive;
        }
        let alive = match self.holder() {
            None => true,
            Some(holder) => heap.is_marked(holder) || !heap.is_in_active_generation(holder),
        };
        let value = if alive { Liveness::Alive } else { Liveness::Dead };
        self.liveness.store(value as u8, Ordering::Release);
        alive
    }

    pub fn cached_liveness(&self) -> Liveness {
        Liveness::from_u8(self.liveness.load(Ordering::Acquire))
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }
}

#[derive(Default)]
pub struct ClassLoaderDataGraph {
    loaders: RwLock<Vec<Arc<ClassLoaderData>>>,
    next_id: AtomicUsize,
}

impl ClassLoaderDataGraph {
    pub fn register(&self, holder: Option<ObjRef>) -> Arc<ClassLoaderData> {
        let cld = Arc::new(ClassLoaderData {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            holder: AtomicUsize::new(ObjRef::encode(holder)),
            handles: OopStorage::new("CLD handles"),
            liveness: AtomicU8::new(Liveness::Unknown as u8),
            unloaded: AtomicBool::new(false),
        });
        self.loaders.write().push(Arc::clone(&cld));
        cld
    }

    pub fn loaders(&self) -> Vec<Arc<ClassLoaderData>> {
        self.loaders.read().clone()
    }

    pub fn len(&self) -> usize {
        self.loaders.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn claiming_iter(&self) -> ClaimingIter<Arc<ClassLoaderData>> {
        ClaimingIter::new(self.loaders())
    }

    pub fn reset_liveness(&self) {
        for cld in self.loaders.read().iter() {
            cld.liveness.store(Liveness::Unknown as u8, Ordering::Release);
        }
    }

    /// Drop loaders found dead, using cached liveness only.
    pub fn unlink_dead(&self) -> usize {
        let mut loaders = self.loaders.write();
        let before = loaders.len();
        loaders.retain(|cld| {
            let dead = cld.cached_liveness() == Liveness::Dead;
            if dead {
                cld.unloaded.store(true, Ordering::Release);
            }
            !dead
        });
        before - loaders.len()
    }
}

/// A compiled code unit with embedded references.
pub struct CodeUnit {
    id: usize,
    loader: Option<Arc<ClassLoaderData>>,
    oops: Box<[AtomicUsize]>,
    armed: AtomicBool,
    lock: ReentrantMutex<()>,
    unloading: AtomicU8,
}

impl CodeUnit {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn oops(&self) -> &[AtomicUsize] {
        &self.oops
    }

    pub fn oop(&self, index: usize) -> Option<ObjRef> {
        self.oops
            .get(index)
            .and_then(|s| ObjRef::from_raw(s.load(Ordering::Acquire)))
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Per-unit metadata lock. Reentrant so an entry barrier running inside
    /// a GC closure on the same thread does not self-deadlock.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Speculatively decide whether this unit unloads and cache the answer.
    /// Later phases read the cache instead of touching the references again.
    pub fn is_unloading(&self, heap: &Heap) -> bool {
        let cached = self.cached_unloading();
        if cached != Liveness::Unknown {
            return cached == Liveness::Dead;
        }
        let loader_dead = self.loader.as_ref().is_some_and(|cld| !cld.is_alive(heap));
        let oop_dead = self.oops.iter().any(|slot| {
            ObjRef::from_raw(slot.load(Ordering::Acquire))
                .is_some_and(|obj| !heap.is_marked(obj) && heap.is_in_active_generation(obj))
        });
        let unloading = loader_dead || oop_dead;
        let value = if unloading { Liveness::Dead } else { Liveness::Alive };
        self.unloading.store(value as u8, Ordering::Release);
        unloading
    }

    pub fn cached_unloading(&self) -> Liveness {
        Liveness::from_u8(self.unloading.load(Ordering::Acquire))
    }

    fn reset_unloading(&self) {
        self.unloading.store(Liveness::Unknown as u8, Ordering::Release);
    }
}

#[derive(Default)]
pub struct CodeCache {
    units: RwLock<Vec<Arc<CodeUnit>>>,
    /// Guards iteration begin/end against concurrent registration.
    cache_lock: Mutex<()>,
    /// Taken by mutator entry barriers before the unit lock.
    entry_barrier_lock: Mutex<()>,
    unloading_in_progress: AtomicBool,
    next_id: AtomicUsize,
    epoch: AtomicUsize,
}

impl CodeCache {
    pub fn register(
        &self,
        oops: &[ObjRef],
        loader: Option<Arc<ClassLoaderData>>,
    ) -> Arc<CodeUnit> {
        let _guard = self.cache_lock.lock();
        let unit = Arc::new(CodeUnit {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            loader,
            oops: oops.iter().map(|o| AtomicUsize::new(o.addr())).collect(),
            armed: AtomicBool::new(false),
            lock: ReentrantMutex::new(()),
            unloading: AtomicU8::new(Liveness::Unknown as u8),
        });
        self.units.write().push(Arc::clone(&unit));
        unit
    }

    pub fn units(&self) -> Vec<Arc<CodeUnit>> {
        self.units.read().clone()
    }

    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot for a concurrent pass, taken under the cache lock.
    pub fn concurrent_iter(&self) -> ClaimingIter<Arc<CodeUnit>> {
        let _guard = self.cache_lock.lock();
        ClaimingIter::new(self.units.read().clone())
    }

    pub fn arm_all(&self) {
        for unit in self.units.read().iter() {
            unit.arm();
        }
    }

    pub fn armed_count(&self) -> usize {
        self.units.read().iter().filter(|u| u.is_armed()).count()
    }

    /// Invalidate stack watermarks so threads re-process frames lazily.
    pub fn change_epoch(&self) -> usize {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn prepare_concurrent_unloading(&self) {
        self.unloading_in_progress.store(true, Ordering::Release);
        for unit in self.units.read().iter() {
            unit.reset_unloading();
        }
    }

    pub fn finish_concurrent_unloading(&self) {
        self.unloading_in_progress.store(false, Ordering::Release);
    }

    pub fn is_unloading_in_progress(&self) -> bool {
        self.unloading_in_progress.load(Ordering::Acquire)
    }

    /// Remove units whose cached state says they unload.
    pub fn unlink_unloading(&self) -> usize {
        let _guard = self.cache_lock.lock();
        let mut units = self.units.write();
        let before = units.len();
        units.retain(|u| u.cached_unloading() != Liveness::Dead);
        before - units.len()
    }

    /// Mutator entry into `unit`. An armed unit gets its references kept
    /// alive or healed before the mutator runs it, then is disarmed.
    pub fn entry_barrier(&self, heap: &Heap, unit: &CodeUnit) {
        if !unit.is_armed() {
            return;
        }
        let _barrier = self.entry_barrier_lock.lock();
        let _unit = unit.lock();
        if !unit.is_armed() {
            return;
        }
        if heap.is_concurrent_mark_in_progress() {
            for slot in unit.oops() {
                if let Some(obj) = ObjRef::from_raw(slot.load(Ordering::Acquire)) {
                    heap.keep_alive(obj);
                }
            }
        }
        if heap.has_forwarded_objects() {
            let _scope = heap.evac_oom().enter();
            for slot in unit.oops() {
                heap.load_reference_barrier(slot);
            }
        }
        unit.disarm();
    }
}

/// All roots outside the heap except mutator stacks.
pub struct RootSet {
    vm_strong: OopStorage,
    vm_weak: OopStorage,
    class_loaders: ClassLoaderDataGraph,
    code_cache: CodeCache,
}

impl RootSet {
    pub fn new() -> Self {
        Self {
            vm_strong: OopStorage::new("VM strong handles"),
            vm_weak: OopStorage::new("VM weak handles"),
            class_loaders: ClassLoaderDataGraph::default(),
            code_cache: CodeCache::default(),
        }
    }

    pub fn vm_strong(&self) -> &OopStorage {
        &self.vm_strong
    }

    pub fn vm_weak(&self) -> &OopStorage {
        &self.vm_weak
    }

    pub fn class_loaders(&self) -> &ClassLoaderDataGraph {
        &self.class_loaders
    }

    pub fn code_cache(&self) -> &CodeCache {
        &self.code_cache
    }

    /// Walk roots on the calling thread. Weak visits cover VM weak handles
    /// and, when classes unload, loader holders and code units.
    pub fn roots_do(&self, visitor: &dyn RootVisitor, unload_classes: bool) {
        self.vm_strong.oops_do(|slot| visitor.visit_strong_root(slot));
        self.vm_weak.oops_do(|slot| visitor.visit_weak_root(slot));
        for cld in self.class_loaders.loaders() {
            cld.handles().oops_do(|slot| visitor.visit_strong_root(slot));
            if unload_classes {
                visitor.visit_weak_root(cld.holder_slot());
            } else {
                visitor.visit_strong_root(cld.holder_slot());
            }
        }
        for unit in self.code_cache.units() {
            if unload_classes {
                visitor.visit_weak_code_unit(&unit);
            } else {
                visitor.visit_code_unit(&unit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(addr: usize) -> ObjRef {
        ObjRef::from_raw(addr).unwrap()
    }

    #[test]
    fn par_state_visits_every_slot_once() {
        let storage = OopStorage::new("test");
        for i in 1..=100 {
            storage.allocate(Some(obj(i * 16)));
        }
        let state = storage.par_state();
        let seen = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| state.oops_do(|_| {
                    seen.fetch_add(1, Ordering::Relaxed);
                }));
            }
        });
        assert_eq!(seen.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn released_handles_read_null() {
        let storage = OopStorage::new("test");
        let handle = storage.allocate(Some(obj(0x40)));
        storage.release(handle);
        assert_eq!(storage.get(handle), None);
    }

    #[test]
    fn claiming_iter_hands_out_each_item_once() {
        let iter = ClaimingIter::new(vec![1, 2, 3]);
        let mut seen = Vec::new();
        iter.for_each(|v| seen.push(*v));
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(iter.claim().is_none());
    }

    #[test]
    fn unit_lock_is_reentrant() {
        let cache = CodeCache::default();
        let unit = cache.register(&[obj(0x80)], None);
        let _outer = unit.lock();
        let _inner = unit.lock();
        assert_eq!(unit.oop(0), Some(obj(0x80)));
    }

    #[test]
    fn unlink_uses_cached_state_only() {
        let cache = CodeCache::default();
        let unit = cache.register(&[], None);
        assert_eq!(cache.unlink_unloading(), 0);
        unit.unloading.store(Liveness::Dead as u8, Ordering::Release);
        assert_eq!(cache.unlink_unloading(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn unloading_makes_code_units_weak() {
        #[derive(Default)]
        struct Tally {
            strong_units: AtomicUsize,
            weak_units: AtomicUsize,
            weak_slots: AtomicUsize,
        }
        impl RootVisitor for Tally {
            fn visit_weak_root(&self, _slot: &AtomicUsize) {
                self.weak_slots.fetch_add(1, Ordering::Relaxed);
            }
            fn visit_code_unit(&self, _unit: &CodeUnit) {
                self.strong_units.fetch_add(1, Ordering::Relaxed);
            }
            fn visit_weak_code_unit(&self, _unit: &CodeUnit) {
                self.weak_units.fetch_add(1, Ordering::Relaxed);
            }
        }

        let roots = RootSet::new();
        let cld = roots.class_loaders().register(Some(obj(0x100)));
        roots.code_cache().register(&[obj(0x200)], Some(cld));

        let strong = Tally::default();
        roots.roots_do(&strong, false);
        assert_eq!(strong.strong_units.load(Ordering::Relaxed), 1);
        assert_eq!(strong.weak_units.load(Ordering::Relaxed), 0);
        assert_eq!(strong.weak_slots.load(Ordering::Relaxed), 0);

        let weak = Tally::default();
        roots.roots_do(&weak, true);
        assert_eq!(weak.strong_units.load(Ordering::Relaxed), 0);
        assert_eq!(weak.weak_units.load(Ordering::Relaxed), 1);
        // The loader holder is weak too.
        assert_eq!(weak.weak_slots.load(Ordering::Relaxed), 1);
    }
}
