//! Mark bits for the generation being collected.
//!
//! Only the active cycle writes marks; any collector logic may read them.
//! Liveness of objects allocated after mark start is implied by TAMS and is
//! answered by [`crate::heap::Heap::is_marked`], not here.

use dashmap::DashSet;

#[derive(Debug, Default)]
pub struct MarkingContext {
    marks: DashSet<usize>,
}

impl MarkingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mark bit. Returns true if this call marked the object.
    pub fn mark(&self, addr: usize) -> bool {
        self.marks.insert(addr)
    }

    pub fn is_marked(&self, addr: usize) -> bool {
        self.marks.contains(&addr)
    }

    /// Clear marks in `[bottom, end)`.
    pub fn clear_range(&self, bottom: usize, end: usize) {
        self.marks.retain(|addr| *addr < bottom || *addr >= end);
    }

    pub fn is_range_clear(&self, bottom: usize, end: usize) -> bool {
        !self.marks.iter().any(|addr| *addr >= bottom && *addr < end)
    }

    pub fn marked_count(&self) -> usize {
        self.marks.len()
    }
}
