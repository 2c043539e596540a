// Collaborator seams consumed by the cycle.
//
// The concurrent cycle treats marking and free-region management as black
// boxes behind these traits. The heap ships a production implementation of
// each; unit tests swap in counting mocks.

pub mod free_set;
pub mod marking;

#[cfg(test)]
pub mod mocks;

pub use free_set::{AllocPurpose, AllocRequest, FreeSet, FreeSetStatus};
pub use marking::MarkingEngine;

#[cfg(test)]
pub use mocks::{CountingFreeSet, CountingMarkingEngine};
