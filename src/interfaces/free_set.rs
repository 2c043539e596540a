//! Free-region set contract.
//!
//! Every method runs under the heap lock: the heap hands out the free set only
//! through its lock guard.

use crate::{heap::region::Region, types::Affiliation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocPurpose {
    Mutator,
    Evacuation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub size: usize,
    pub affiliation: Affiliation,
    pub purpose: AllocPurpose,
}

impl AllocRequest {
    pub fn mutator(size: usize, affiliation: Affiliation) -> Self {
        Self {
            size,
            affiliation,
            purpose: AllocPurpose::Mutator,
        }
    }

    pub fn evacuation(size: usize, affiliation: Affiliation) -> Self {
        Self {
            size,
            affiliation,
            purpose: AllocPurpose::Evacuation,
        }
    }
}

/// Snapshot of free-set capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FreeSetStatus {
    pub mutator_regions: usize,
    pub collector_regions: usize,
    pub mutator_free_bytes: usize,
    pub collector_free_bytes: usize,
}

pub trait FreeSet: Send {
    /// Pick a region with room for `request` and return it. The caller
    /// performs the bump allocation.
    fn region_for(&mut self, regions: &[Region], request: AllocRequest) -> Option<usize>;

    /// Stop allocating into the current allocation regions.
    fn retire_alloc_regions(&mut self);

    /// Return trash regions to empty. Returns the recycled region indices.
    fn recycle_trash(&mut self, regions: &[Region]) -> Vec<usize>;

    fn rebuild(&mut self, regions: &[Region], concurrent: bool);

    fn status(&self, regions: &[Region]) -> FreeSetStatus;

    fn log_status(&self, regions: &[Region]);
}
