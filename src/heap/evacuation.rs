//! Copying live objects out of the collection set.
//!
//! The forwarding table maps an original address to its copy. Installing a
//! forwarding entry is the single commit point: racing evacuators all copy,
//! one wins the entry and the losers drop their copy.

use std::sync::atomic::Ordering;

use dashmap::mapref::entry::Entry;
use log::{debug, trace};

use crate::{
    interfaces::AllocRequest,
    types::{GcCause, ObjRef},
    workers::GangTask,
};

use super::{region::HeapObject, Heap};

impl Heap {
    /// The copy `obj` was forwarded to, if any.
    pub fn forwardee(&self, obj: ObjRef) -> Option<ObjRef> {
        self.forwarding
            .get(&obj.addr())
            .and_then(|fwd| ObjRef::from_raw(*fwd))
    }

    /// `obj` itself unless it has been forwarded.
    pub fn resolve_forwarded(&self, obj: ObjRef) -> ObjRef {
        self.forwardee(obj).unwrap_or(obj)
    }

    pub fn is_forwarded(&self, obj: ObjRef) -> bool {
        self.forwarding.contains_key(&obj.addr())
    }

    /// Copy a collection-set object and return its to-space address. Caller
    /// is inside an evacuation-OOM scope. Without to-space the cycle is
    /// cancelled, evacuators drain, and the result is whatever copy won by
    /// then, or `obj` if none did.
    pub fn evacuate_object(&self, obj: ObjRef) -> ObjRef {
        if let Some(fwd) = self.forwardee(obj) {
            return fwd;
        }
        let region = self.region_for(obj);
        if !self.collection_set.is_in(region.index()) {
            return obj;
        }
        if self.evac_oom.is_oom() {
            self.evac_oom.wait_for_drain();
            return self.resolve_forwarded(obj);
        }
        let Some(original) = region.object(obj.addr()) else {
            return obj;
        };

        let copy = HeapObject::copy_of(&original);
        let size = copy.size();
        let request = AllocRequest::evacuation(size, region.affiliation());
        let Some(to) = self.allocate_object(request, copy) else {
            if self.evac_oom.handle_oom() {
                self.cancel_gc(GcCause::AllocationFailureEvac);
            }
            return self.resolve_forwarded(obj);
        };

        match self.forwarding.entry(obj.addr()) {
            Entry::Occupied(winner) => {
                let winner = *winner.get();
                self.region_for(to).remove_object(to.addr());
                self.counters.wasted_copies.fetch_add(1, Ordering::Relaxed);
                ObjRef::from_raw(winner).unwrap_or(obj)
            }
            Entry::Vacant(slot) => {
                slot.insert(to.addr());
                self.counters.bytes_evacuated.fetch_add(size, Ordering::Relaxed);
                self.counters.objects_evacuated.fetch_add(1, Ordering::Relaxed);
                self.young.remembered_set().on_object_moved(obj.addr(), to.addr());
                trace!("Evacuated {obj:?} -> {to:?}");
                to
            }
        }
    }

    /// Evacuate every live object of the collection set. The concurrent pass
    /// stops early once the cycle is cancelled; the degenerated pass keeps
    /// going until to-space runs out.
    pub fn evacuate_collection_set(&self, concurrent: bool) {
        self.collection_set.reset_claim();
        let task = EvacuationTask {
            heap: self,
            concurrent,
        };
        self.workers.run_task(&task);
        debug!(
            "Evacuated {} objects ({}K) from {} regions",
            self.counters.objects_evacuated.load(Ordering::Relaxed),
            self.counters.bytes_evacuated.load(Ordering::Relaxed) / 1024,
            self.collection_set.count()
        );
    }
}

struct EvacuationTask<'a> {
    heap: &'a Heap,
    concurrent: bool,
}

impl EvacuationTask<'_> {
    fn should_stop(&self) -> bool {
        (self.concurrent && self.heap.cancelled_gc()) || self.heap.evac_oom.is_oom()
    }
}

impl GangTask for EvacuationTask<'_> {
    fn name(&self) -> &'static str {
        "Evacuation"
    }

    fn work(&self, worker_id: usize) {
        let heap = self.heap;
        let mut evacuated = 0;
        while let Some(idx) = heap.collection_set.claim_next() {
            if self.should_stop() {
                break;
            }
            let region = heap.region(idx);
            let _scope = heap.evac_oom.enter();
            for (addr, _) in region.objects_below(region.top()) {
                if self.should_stop() {
                    break;
                }
                let Some(obj) = ObjRef::from_raw(addr) else {
                    continue;
                };
                if heap.is_marked(obj) && !heap.is_forwarded(obj) {
                    heap.evacuate_object(obj);
                    evacuated += 1;
                }
            }
        }
        trace!("Worker {worker_id} evacuated {evacuated} objects");
    }
}
