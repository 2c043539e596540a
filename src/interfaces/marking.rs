//! Marking engine contract.

use crate::{generation::Generation, heap::Heap};

/// Start, continue and finish marking for one generation.
///
/// Each operation leaves the mark bits consistent on return and may be called
/// again within the same cycle. Concurrent operations stop early when the heap
/// is cancelled. `finish_mark` runs with the world stopped and must complete
/// without running out of memory.
pub trait MarkingEngine: Send + Sync {
    fn mark_concurrent_roots(&self, heap: &Heap, generation: &Generation);

    fn concurrent_mark(&self, heap: &Heap, generation: &Generation);

    fn finish_mark(&self, heap: &Heap, generation: &Generation);
}
