//! Heap regions and the objects they hold.
//!
//! Region state is a small state machine. Transitions are guarded by the heap
//! lock, which allows changing the state of several regions atomically.
//!
//! ```text
//!   Empty --first allocation--> Regular --selected--> Cset
//!     ^                            |                    |
//!     |                            | immediate garbage  | evacuated
//!     |                            v                    v
//!     \-------- recycle -------- Trash <----------------/
//! ```
//!
//! No region goes Empty unless recycled from Trash, only Regular regions can
//! join the collection set, and Empty cannot go Trash.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::RwLock;

use crate::types::{Affiliation, ObjRef};

pub const OBJECT_HEADER_SIZE: usize = 16;
pub const WORD_SIZE: usize = 8;

/// Bytes an object with `num_fields` reference fields occupies.
pub const fn object_size(num_fields: usize) -> usize {
    OBJECT_HEADER_SIZE + num_fields * WORD_SIZE
}

/// A heap object: a fixed number of reference slots.
#[derive(Debug)]
pub struct HeapObject {
    size: usize,
    fields: Box<[AtomicUsize]>,
}

impl HeapObject {
    pub fn new(num_fields: usize) -> Self {
        Self {
            size: object_size(num_fields),
            fields: (0..num_fields).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// Field-by-field copy of `source`.
    pub fn copy_of(source: &HeapObject) -> Self {
        Self {
            size: source.size,
            fields: source
                .fields
                .iter()
                .map(|f| AtomicUsize::new(f.load(Ordering::Acquire)))
                .collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn field(&self, index: usize) -> Option<&AtomicUsize> {
        self.fields.get(index)
    }

    pub fn fields(&self) -> &[AtomicUsize] {
        &self.fields
    }

    /// Non-null references held in the fields right now.
    pub fn references(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.fields
            .iter()
            .filter_map(|f| ObjRef::from_raw(f.load(Ordering::Acquire)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Empty,
    Regular,
    Cset,
    Trash,
}

pub struct Region {
    index: usize,
    bottom: usize,
    end: usize,
    state: AtomicCell<RegionState>,
    affiliation: AtomicCell<Affiliation>,
    top: AtomicUsize,
    tams: AtomicUsize,
    update_watermark: AtomicUsize,
    live_bytes: AtomicUsize,
    objects: RwLock<BTreeMap<usize, Arc<HeapObject>>>,
}

impl Region {
    pub fn new(index: usize, bottom: usize, size: usize) -> Self {
        Self {
            index,
            bottom,
            end: bottom + size,
            state: AtomicCell::new(RegionState::Empty),
            affiliation: AtomicCell::new(Affiliation::Free),
            top: AtomicUsize::new(bottom),
            tams: AtomicUsize::new(bottom),
            update_watermark: AtomicUsize::new(bottom),
            live_bytes: AtomicUsize::new(0),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bottom(&self) -> usize {
        self.bottom
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom && addr < self.end
    }

    pub fn state(&self) -> RegionState {
        self.state.load()
    }

    pub fn affiliation(&self) -> Affiliation {
        self.affiliation.load()
    }

    pub fn is_empty(&self) -> bool {
        self.state() == RegionState::Empty
    }

    pub fn is_trash(&self) -> bool {
        self.state() == RegionState::Trash
    }

    pub fn is_cset(&self) -> bool {
        self.state() == RegionState::Cset
    }

    /// Regular or collection-set regions hold objects that may be reachable.
    pub fn is_active(&self) -> bool {
        matches!(self.state(), RegionState::Regular | RegionState::Cset)
    }

    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    pub fn free(&self) -> usize {
        self.end - self.top()
    }

    pub fn tams(&self) -> usize {
        self.tams.load(Ordering::Acquire)
    }

    /// Record top-at-mark-start. Returns false when it already matched top.
    pub fn capture_tams(&self) -> bool {
        let top = self.top();
        if self.tams.load(Ordering::Relaxed) == top {
            return false;
        }
        self.tams.store(top, Ordering::Release);
        true
    }

    pub fn update_watermark(&self) -> usize {
        self.update_watermark.load(Ordering::Acquire)
    }

    pub fn set_update_watermark(&self, watermark: usize) {
        self.update_watermark.store(watermark, Ordering::Release);
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn add_live_bytes(&self, bytes: usize) {
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn reset_live_bytes(&self) {
        self.live_bytes.store(0, Ordering::Relaxed);
    }

    /// Bytes below TAMS that marking did not reach.
    pub fn garbage(&self) -> usize {
        (self.tams() - self.bottom).saturating_sub(self.live_bytes())
    }

    /// Bump-allocate `object`. Caller holds the heap lock.
    pub fn allocate(&self, object: HeapObject) -> Option<usize> {
        let size = object.size();
        let top = self.top();
        if self.end - top < size {
            return None;
        }
        self.objects.write().insert(top, Arc::new(object));
        self.top.store(top + size, Ordering::Release);
        Some(top)
    }

    pub fn object(&self, addr: usize) -> Option<Arc<HeapObject>> {
        self.objects.read().get(&addr).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().len()
    }

    /// Snapshot of objects starting below `limit`.
    pub fn objects_below(&self, limit: usize) -> Vec<(usize, Arc<HeapObject>)> {
        self.objects
            .read()
            .range(..limit)
            .map(|(addr, obj)| (*addr, Arc::clone(obj)))
            .collect()
    }

    pub fn remove_object(&self, addr: usize) -> Option<Arc<HeapObject>> {
        self.objects.write().remove(&addr)
    }

    pub fn make_regular(&self, affiliation: Affiliation) {
        let state = self.state();
        assert!(
            state == RegionState::Empty || state == RegionState::Regular,
            "region {} cannot become regular from {state:?}",
            self.index
        );
        if state == RegionState::Empty {
            self.affiliation.store(affiliation);
            self.state.store(RegionState::Regular);
        }
    }

    pub fn make_cset(&self) {
        let state = self.state();
        assert_eq!(
            state,
            RegionState::Regular,
            "region {} cannot join the collection set from {state:?}",
            self.index
        );
        self.state.store(RegionState::Cset);
    }

    pub fn make_trash(&self) {
        let state = self.state();
        assert!(
            state == RegionState::Regular || state == RegionState::Cset,
            "region {} cannot become trash from {state:?}",
            self.index
        );
        self.state.store(RegionState::Trash);
    }

    /// Trash to Empty, dropping every object and resetting metadata.
    pub fn recycle(&self) {
        assert!(self.is_trash(), "region {} recycled while {:?}", self.index, self.state());
        self.objects.write().clear();
        self.top.store(self.bottom, Ordering::Release);
        self.tams.store(self.bottom, Ordering::Release);
        self.update_watermark.store(self.bottom, Ordering::Release);
        self.live_bytes.store(0, Ordering::Relaxed);
        self.affiliation.store(Affiliation::Free);
        self.state.store(RegionState::Empty);
    }
}
