//! Default parallel marking engine.
//!
//! Roots are marked in parallel through claiming iterators. Tracing drains
//! the generation's mark queue together with the SATB buffer across the
//! worker gang until both are empty or the cycle is cancelled. The final,
//! stop-the-world step rescans thread stacks and drains whatever is left.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, trace, warn};

use crate::{
    generation::Generation,
    handshake::HandshakeCoordinator,
    heap::Heap,
    interfaces::MarkingEngine,
    roots::{ClaimingIter, ClassLoaderData, CodeUnit, OopStorageParState},
    types::ObjRef,
    workers::GangTask,
};

#[derive(Debug, Default)]
pub struct ConcurrentMark {
    objects_traced: AtomicUsize,
}

impl ConcurrentMark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Objects traced since creation.
    pub fn objects_traced(&self) -> usize {
        self.objects_traced.load(Ordering::Relaxed)
    }

    fn trace_until_empty(&self, heap: &Heap, generation: &Generation, concurrent: bool) {
        let task = MarkTask {
            heap,
            generation,
            concurrent,
            traced: &self.objects_traced,
        };
        heap.workers().run_task(&task);
    }

    fn mark_slot(heap: &Heap, generation: &Generation, raw: usize) {
        if let Some(obj) = ObjRef::from_raw(raw) {
            if heap.region_index_for(obj.addr()).is_some() {
                heap.mark_object(generation, obj);
            }
        }
    }
}

impl MarkingEngine for ConcurrentMark {
    fn mark_concurrent_roots(&self, heap: &Heap, generation: &Generation) {
        let roots = heap.roots();
        let task = MarkRootsTask {
            heap,
            generation,
            unload_classes: heap.unload_classes(),
            vm_strong: roots.vm_strong().par_state(),
            loaders: roots.class_loaders().claiming_iter(),
            code: roots.code_cache().concurrent_iter(),
        };
        heap.workers().run_task(&task);

        let soft = generation.ref_processor().soft_referents();
        for obj in &soft {
            heap.mark_object(generation, *obj);
        }
        debug!(
            "Marked roots for {}: {} loaders, {} code units, {} soft referents",
            generation.name(),
            task.loaders.len(),
            task.code.len(),
            soft.len()
        );
    }

    fn concurrent_mark(&self, heap: &Heap, generation: &Generation) {
        let (tx, rx) = flume::unbounded::<Vec<ObjRef>>();
        let handshake = HandshakeCoordinator::new(heap.threads(), heap.options().handshake_timeout)
            .execute("Mark thread roots", move |thread| {
                let _ = tx.send(thread.stack_roots());
            });
        if let Err(e) = handshake {
            // Final mark rescans every stack with the world stopped.
            warn!("Thread root marking incomplete: {e}");
        }
        for stack in rx.try_iter() {
            for obj in stack {
                heap.mark_object(generation, obj);
            }
        }

        self.trace_until_empty(heap, generation, true);
    }

    fn finish_mark(&self, heap: &Heap, generation: &Generation) {
        for thread in heap.threads().iter() {
            thread.stack_slots_do(|slot| {
                Self::mark_slot(heap, generation, slot.load(Ordering::Acquire));
            });
        }
        loop {
            self.trace_until_empty(heap, generation, false);
            heap.drain_satb_buffers(generation);
            if generation.mark_queue().is_empty() {
                break;
            }
        }
        generation.set_mark_complete();
        debug!(
            "Marking complete for {}: {} objects marked",
            generation.name(),
            heap.marking_context().marked_count()
        );
    }
}

struct MarkRootsTask<'a> {
    heap: &'a Heap,
    generation: &'a Generation,
    unload_classes: bool,
    vm_strong: OopStorageParState<'a>,
    loaders: ClaimingIter<std::sync::Arc<ClassLoaderData>>,
    code: ClaimingIter<std::sync::Arc<CodeUnit>>,
}

impl GangTask for MarkRootsTask<'_> {
    fn name(&self) -> &'static str {
        "Mark Roots"
    }

    fn work(&self, worker_id: usize) {
        let (heap, generation) = (self.heap, self.generation);
        self.vm_strong.oops_do(|slot| {
            ConcurrentMark::mark_slot(heap, generation, slot.load(Ordering::Acquire));
        });
        while let Some(cld) = self.loaders.claim() {
            cld.handles().oops_do(|slot| {
                ConcurrentMark::mark_slot(heap, generation, slot.load(Ordering::Acquire));
            });
            if !self.unload_classes {
                ConcurrentMark::mark_slot(heap, generation, cld.holder_slot().load(Ordering::Acquire));
            }
        }
        // With unloading, code references are weak and kept alive by entry
        // barriers instead.
        if !self.unload_classes {
            while let Some(unit) = self.code.claim() {
                let _lock = unit.lock();
                for slot in unit.oops() {
                    ConcurrentMark::mark_slot(heap, generation, slot.load(Ordering::Acquire));
                }
            }
        }
        trace!("Worker {worker_id} finished root marking");
    }
}

struct MarkTask<'a> {
    heap: &'a Heap,
    generation: &'a Generation,
    concurrent: bool,
    traced: &'a AtomicUsize,
}

impl GangTask for MarkTask<'_> {
    fn name(&self) -> &'static str {
        "Marking"
    }

    fn work(&self, worker_id: usize) {
        let (heap, generation) = (self.heap, self.generation);
        let mut traced = 0;
        loop {
            if self.concurrent && heap.cancelled_gc() {
                break;
            }
            let Some(obj) = generation.mark_queue().pop() else {
                if heap.drain_satb_buffers(generation) == 0 {
                    break;
                }
                continue;
            };
            if let Ok(object) = heap.object(obj) {
                for referent in object.references() {
                    heap.mark_object(generation, referent);
                }
            }
            traced += 1;
        }
        self.traced.fetch_add(traced, Ordering::Relaxed);
        trace!("Worker {worker_id} traced {traced} objects");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        heap::HeapBuilder,
        options::GcOptions,
        thread::MutatorThread,
        types::{Affiliation, GenerationMode},
    };
    use std::sync::Arc;

    fn heap() -> Arc<Heap> {
        HeapBuilder::new(
            GcOptions::default()
                .with_region_size(4096)
                .with_region_count(8)
                .with_workers(2, 2),
        )
        .build()
        .unwrap()
    }

    #[test]
    fn marks_everything_reachable_from_roots() {
        let heap = heap();
        let root = heap.allocate(Affiliation::Young, 1).unwrap();
        let child = heap.allocate(Affiliation::Young, 1).unwrap();
        let grandchild = heap.allocate(Affiliation::Young, 0).unwrap();
        let garbage = heap.allocate(Affiliation::Young, 0).unwrap();
        heap.store_field(root, 0, Some(child)).unwrap();
        heap.store_field(child, 0, Some(grandchild)).unwrap();
        heap.roots().vm_strong().allocate(Some(root));

        let generation = heap.global_generation();
        heap.capture_top_at_mark_start(|_| true);
        generation.set_concurrent_mark_in_progress(&heap, true);
        let engine = ConcurrentMark::new();
        engine.mark_concurrent_roots(&heap, generation);
        engine.concurrent_mark(&heap, generation);
        engine.finish_mark(&heap, generation);
        generation.set_concurrent_mark_in_progress(&heap, false);

        assert!(generation.is_mark_complete());
        assert!(heap.is_marked(root));
        assert!(heap.is_marked(child));
        assert!(heap.is_marked(grandchild));
        assert!(!heap.is_marked(garbage));
        assert_eq!(engine.objects_traced(), 3);
    }

    #[test]
    fn stack_roots_of_blocked_threads_are_marked() {
        let heap = heap();
        let obj = heap.allocate(Affiliation::Young, 0).unwrap();
        let thread = MutatorThread::new(1);
        thread.push_root(Some(obj));
        heap.threads().register(thread);

        let generation = heap.generation(GenerationMode::Global);
        heap.capture_top_at_mark_start(|_| true);
        ConcurrentMark::new().concurrent_mark(&heap, generation);
        assert!(heap.is_marked(obj));
    }

    #[test]
    fn cancelled_marking_leaves_work_for_finish() {
        let heap = heap();
        let root = heap.allocate(Affiliation::Young, 1).unwrap();
        let child = heap.allocate(Affiliation::Young, 0).unwrap();
        heap.store_field(root, 0, Some(child)).unwrap();
        heap.roots().vm_strong().allocate(Some(root));

        let generation = heap.global_generation();
        heap.capture_top_at_mark_start(|_| true);
        let engine = ConcurrentMark::new();
        engine.mark_concurrent_roots(&heap, generation);
        heap.cancel_gc(crate::types::GcCause::Explicit);
        engine.concurrent_mark(&heap, generation);
        assert!(!heap.is_marked(child));

        engine.finish_mark(&heap, generation);
        assert!(heap.is_marked(child));
    }
}
