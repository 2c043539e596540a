//! Regions chosen for evacuation in the current cycle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::types::Affiliation;

use super::region::Region;

pub struct CollectionSet {
    members: Box<[AtomicBool]>,
    regions: RwLock<Vec<usize>>,
    claim: AtomicUsize,
    young_regions: AtomicUsize,
    old_regions: AtomicUsize,
    garbage: AtomicUsize,
    live: AtomicUsize,
}

impl CollectionSet {
    pub fn new(region_count: usize) -> Self {
        Self {
            members: (0..region_count).map(|_| AtomicBool::new(false)).collect(),
            regions: RwLock::new(Vec::new()),
            claim: AtomicUsize::new(0),
            young_regions: AtomicUsize::new(0),
            old_regions: AtomicUsize::new(0),
            garbage: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
        }
    }

    /// Add a regular region. Caller holds the heap lock.
    pub fn add_region(&self, region: &Region) {
        region.make_cset();
        self.members[region.index()].store(true, Ordering::Release);
        self.regions.write().push(region.index());
        match region.affiliation() {
            Affiliation::Young => self.young_regions.fetch_add(1, Ordering::Relaxed),
            Affiliation::Old => self.old_regions.fetch_add(1, Ordering::Relaxed),
            Affiliation::Free => 0,
        };
        self.garbage.fetch_add(region.garbage(), Ordering::Relaxed);
        self.live
            .fetch_add(region.used() - region.garbage(), Ordering::Relaxed);
    }

    pub fn is_in(&self, region_index: usize) -> bool {
        self.members
            .get(region_index)
            .is_some_and(|m| m.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn count(&self) -> usize {
        self.regions.read().len()
    }

    pub fn regions(&self) -> Vec<usize> {
        self.regions.read().clone()
    }

    /// Holds regions of more than one generation.
    pub fn is_mixed(&self) -> bool {
        self.young_regions.load(Ordering::Relaxed) > 0 && self.old_regions.load(Ordering::Relaxed) > 0
    }

    pub fn old_region_count(&self) -> usize {
        self.old_regions.load(Ordering::Relaxed)
    }

    pub fn garbage(&self) -> usize {
        self.garbage.load(Ordering::Relaxed)
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Next region for a parallel pass, `None` once exhausted.
    pub fn claim_next(&self) -> Option<usize> {
        let regions = self.regions.read();
        let idx = self.claim.fetch_add(1, Ordering::AcqRel);
        regions.get(idx).copied()
    }

    pub fn reset_claim(&self) {
        self.claim.store(0, Ordering::Release);
    }

    pub fn clear(&self) {
        let mut regions = self.regions.write();
        for idx in regions.drain(..) {
            self.members[idx].store(false, Ordering::Release);
        }
        self.claim.store(0, Ordering::Release);
        self.young_regions.store(0, Ordering::Relaxed);
        self.old_regions.store(0, Ordering::Relaxed);
        self.garbage.store(0, Ordering::Relaxed);
        self.live.store(0, Ordering::Relaxed);
    }
}
