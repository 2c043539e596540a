//! Heap verification at cycle checkpoints.
//!
//! Runs only when [`GcOptions::verify`](crate::options::GcOptions) is set. A
//! failed check panics naming the checkpoint and the offending reference.

use std::{
    collections::{HashSet, VecDeque},
    sync::atomic::{AtomicUsize, Ordering},
};

use log::debug;
use parking_lot::Mutex;

use crate::{
    heap::{region::RegionState, Heap},
    roots::{CodeUnit, RootVisitor},
    types::{GcState, ObjRef},
};

pub struct Verifier<'a> {
    heap: &'a Heap,
}

impl<'a> Verifier<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self { heap }
    }

    pub fn verify_before_concmark(&self) {
        let generation = self.heap.generation(self.heap.active_generation());
        if !generation.is_bitmap_clear(self.heap) {
            fail("before concurrent mark", "mark bitmap is not clear");
        }
        if self.heap.has_forwarded_objects() {
            fail("before concurrent mark", "heap reports forwarded objects");
        }
        self.verify_roots("before concurrent mark", |obj| {
            self.heap.is_forwarded(obj).then_some("root references a forwarded object")
        });
    }

    pub fn verify_roots_no_forwarded(&self) {
        self.verify_roots("roots no forwarded", |obj| {
            self.heap.is_forwarded(obj).then_some("root references a forwarded object")
        });
    }

    pub fn verify_after_concmark(&self) {
        if !self.heap.collection_set().is_empty() {
            fail("after concurrent mark", "collection set is not empty");
        }
        self.verify_reachable_marked("after concurrent mark");
    }

    pub fn verify_before_evacuation(&self) {
        for idx in self.heap.collection_set().regions() {
            let state = self.heap.region(idx).state();
            if state != RegionState::Cset {
                fail(
                    "before evacuation",
                    &format!("collection set region {idx} is {state:?}"),
                );
            }
        }
        self.verify_reachable_marked("before evacuation");
    }

    /// Every live collection-set object has a copy.
    pub fn verify_before_update_refs(&self) {
        if self.heap.cancelled_gc() {
            return;
        }
        for idx in self.heap.collection_set().regions() {
            let region = self.heap.region(idx);
            for (addr, _) in region.objects_below(region.top()) {
                let Some(obj) = ObjRef::from_raw(addr) else {
                    continue;
                };
                if self.heap.is_marked(obj) && !self.heap.is_forwarded(obj) {
                    fail(
                        "before update refs",
                        &format!("live {obj:?} in region {idx} was not evacuated"),
                    );
                }
            }
        }
    }

    pub fn verify_roots_in_to_space(&self) {
        self.verify_roots("roots in to-space", |obj| {
            self.heap
                .in_collection_set(obj)
                .then_some("root references the collection set")
        });
    }

    /// No reachable slot references a collection-set or reclaimed region.
    pub fn verify_after_update_refs(&self) {
        self.verify_reachable("after update refs", |obj| {
            let region = self.heap.region_for(obj);
            if self.heap.in_collection_set(obj) {
                Some("reachable object is in the collection set")
            } else if !region.is_active() {
                Some("reachable object is in a reclaimed region")
            } else {
                None
            }
        });
    }

    pub fn verify_after_degenerated(&self) {
        let mut state = self.heap.gc_state();
        // Old marking bootstrapped by a young cycle outlives it.
        if state.contains(GcState::OLD_MARKING) {
            state.remove(GcState::OLD_MARKING | GcState::MARKING);
        }
        if !state.is_empty() {
            fail("after degenerated", &format!("gc state still {state:?}"));
        }
        self.verify_after_update_refs();
    }

    fn verify_reachable_marked(&self, checkpoint: &'static str) {
        let mode = self.heap.active_generation();
        self.verify_reachable(checkpoint, |obj| {
            let in_generation = mode.contains(self.heap.region_for(obj).affiliation());
            (in_generation && !self.heap.is_marked(obj)).then_some("reachable object is unmarked")
        });
    }

    fn verify_roots(&self, checkpoint: &'static str, check: impl Fn(ObjRef) -> Option<&'static str>) {
        let mut checked = 0;
        for obj in self.root_referents() {
            if let Some(problem) = check(obj) {
                fail(checkpoint, &format!("{problem}: {obj:?}"));
            }
            checked += 1;
        }
        debug!("Verified {checked} roots ({checkpoint})");
    }

    fn verify_reachable(
        &self,
        checkpoint: &'static str,
        check: impl Fn(ObjRef) -> Option<&'static str>,
    ) {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<ObjRef> = self.root_referents().into_iter().collect();
        while let Some(obj) = queue.pop_front() {
            if !seen.insert(obj) {
                continue;
            }
            if let Some(problem) = check(obj) {
                fail(checkpoint, &format!("{problem}: {obj:?}"));
            }
            if let Ok(object) = self.heap.object(obj) {
                queue.extend(object.references().filter(|r| !seen.contains(r)));
            }
        }
        debug!("Verified {} reachable objects ({checkpoint})", seen.len());
    }

    /// Referents of strong roots and thread stacks inside the heap.
    fn root_referents(&self) -> Vec<ObjRef> {
        let collector = RootCollector::default();
        self.heap.roots().roots_do(&collector, self.heap.unload_classes());
        let mut referents = collector.referents.into_inner();
        for thread in self.heap.threads().iter() {
            referents.extend(thread.stack_roots());
        }
        referents.retain(|obj| self.heap.region_index_for(obj.addr()).is_some());
        referents
    }
}

#[derive(Default)]
struct RootCollector {
    referents: Mutex<Vec<ObjRef>>,
}

impl RootCollector {
    fn push(&self, slot: &AtomicUsize) {
        if let Some(obj) = ObjRef::from_raw(slot.load(Ordering::Acquire)) {
            self.referents.lock().push(obj);
        }
    }
}

impl RootVisitor for RootCollector {
    fn visit_strong_root(&self, slot: &AtomicUsize) {
        self.push(slot);
    }

    fn visit_code_unit(&self, unit: &CodeUnit) {
        let _lock = unit.lock();
        for slot in unit.oops() {
            self.push(slot);
        }
    }
}

fn fail(checkpoint: &str, message: &str) -> ! {
    panic!("Verification failed ({checkpoint}): {message}");
}
