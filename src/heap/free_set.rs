//! Region free set partitioned into mutator and collector views.
//!
//! The collector view is a reserve of empty regions held back for evacuation.
//! Evacuation may overflow into the mutator view; mutators never take from
//! the reserve.

use std::collections::{BTreeSet, HashMap};

use log::{debug, info};

use crate::{
    heap::region::{Region, RegionState},
    interfaces::{AllocPurpose, AllocRequest, FreeSet, FreeSetStatus},
    types::Affiliation,
};

#[derive(Debug, Default)]
pub struct RegionFreeSet {
    reserve_percent: usize,
    mutator: BTreeSet<usize>,
    collector: BTreeSet<usize>,
    current: HashMap<(AllocPurpose, Affiliation), usize>,
}

impl RegionFreeSet {
    pub fn new(reserve_percent: usize) -> Self {
        Self {
            reserve_percent,
            ..Self::default()
        }
    }

    fn usable(region: &Region, request: &AllocRequest) -> bool {
        match region.state() {
            RegionState::Empty => true,
            RegionState::Regular => {
                region.affiliation() == request.affiliation && region.free() >= request.size
            }
            RegionState::Cset | RegionState::Trash => false,
        }
    }

    fn take_from(
        set: &mut BTreeSet<usize>,
        regions: &[Region],
        request: &AllocRequest,
    ) -> Option<usize> {
        let idx = set
            .iter()
            .copied()
            .find(|idx| Self::usable(&regions[*idx], request))?;
        set.remove(&idx);
        Some(idx)
    }
}

impl FreeSet for RegionFreeSet {
    fn region_for(&mut self, regions: &[Region], request: AllocRequest) -> Option<usize> {
        let key = (request.purpose, request.affiliation);
        if let Some(idx) = self.current.get(&key).copied() {
            let region = &regions[idx];
            if region.state() == RegionState::Regular && region.free() >= request.size {
                return Some(idx);
            }
            self.current.remove(&key);
        }

        let idx = match request.purpose {
            AllocPurpose::Mutator => Self::take_from(&mut self.mutator, regions, &request),
            AllocPurpose::Evacuation => Self::take_from(&mut self.collector, regions, &request)
                .or_else(|| Self::take_from(&mut self.mutator, regions, &request)),
        }?;
        regions[idx].make_regular(request.affiliation);
        self.current.insert(key, idx);
        Some(idx)
    }

    fn retire_alloc_regions(&mut self) {
        self.current.clear();
    }

    fn recycle_trash(&mut self, regions: &[Region]) -> Vec<usize> {
        let recycled: Vec<usize> = regions
            .iter()
            .filter(|r| r.is_trash())
            .map(|r| {
                r.recycle();
                self.mutator.insert(r.index());
                r.index()
            })
            .collect();
        if !recycled.is_empty() {
            debug!("Recycled {} trash regions", recycled.len());
        }
        recycled
    }

    fn rebuild(&mut self, regions: &[Region], concurrent: bool) {
        self.mutator.clear();
        self.collector.clear();
        self.current.clear();

        let empty: Vec<usize> = regions
            .iter()
            .filter(|r| r.is_empty())
            .map(Region::index)
            .collect();
        let reserve = if self.reserve_percent == 0 || empty.is_empty() {
            0
        } else {
            (empty.len() * self.reserve_percent / 100).max(1)
        };
        // Reserve from the high end so mutators fill low regions first.
        let split = empty.len() - reserve;
        self.mutator.extend(&empty[..split]);
        self.collector.extend(&empty[split..]);
        self.mutator.extend(
            regions
                .iter()
                .filter(|r| r.state() == RegionState::Regular && r.free() > 0)
                .map(Region::index),
        );
        debug!(
            "Rebuilt free set ({}): {} mutator, {} collector regions",
            if concurrent { "concurrent" } else { "pause" },
            self.mutator.len(),
            self.collector.len()
        );
    }

    fn status(&self, regions: &[Region]) -> FreeSetStatus {
        let free_bytes = |set: &BTreeSet<usize>| set.iter().map(|i| regions[*i].free()).sum();
        FreeSetStatus {
            mutator_regions: self.mutator.len(),
            collector_regions: self.collector.len(),
            mutator_free_bytes: free_bytes(&self.mutator),
            collector_free_bytes: free_bytes(&self.collector),
        }
    }

    fn log_status(&self, regions: &[Region]) {
        let status = self.status(regions);
        let max_free = self
            .mutator
            .iter()
            .map(|i| regions[*i].free())
            .max()
            .unwrap_or(0);
        info!(
            "Free: {}K, Max: {}K regular, Reserve: {}K ({} regions)",
            status.mutator_free_bytes / 1024,
            max_free / 1024,
            status.collector_free_bytes / 1024,
            status.collector_regions
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::region::HeapObject;

    fn regions(n: usize) -> Vec<Region> {
        (0..n).map(|i| Region::new(i, 0x1000_0000 + i * 4096, 4096)).collect()
    }

    #[test]
    fn rebuild_reserves_collector_regions() {
        let regions = regions(10);
        let mut fs = RegionFreeSet::new(20);
        fs.rebuild(&regions, false);
        let status = fs.status(&regions);
        assert_eq!(status.collector_regions, 2);
        assert_eq!(status.mutator_regions, 8);
    }

    #[test]
    fn mutator_never_takes_reserve() {
        let regions = regions(2);
        let mut fs = RegionFreeSet::new(50);
        fs.rebuild(&regions, false);
        let request = AllocRequest::mutator(4096, Affiliation::Young);
        let first = fs.region_for(&regions, request).unwrap();
        regions[first].allocate(HeapObject::new(510)).unwrap();
        assert!(fs.region_for(&regions, request).is_none());
        assert!(fs
            .region_for(&regions, AllocRequest::evacuation(64, Affiliation::Young))
            .is_some());
    }

    #[test]
    fn recycle_without_trash_changes_nothing() {
        let regions = regions(4);
        let mut fs = RegionFreeSet::new(25);
        fs.rebuild(&regions, true);
        let before = fs.status(&regions);
        assert!(fs.recycle_trash(&regions).is_empty());
        assert_eq!(fs.status(&regions), before);
    }

    #[test]
    fn recycled_regions_become_allocatable() {
        let regions = regions(2);
        let mut fs = RegionFreeSet::new(0);
        fs.rebuild(&regions, false);
        let request = AllocRequest::mutator(64, Affiliation::Young);
        let idx = fs.region_for(&regions, request).unwrap();
        regions[idx].allocate(HeapObject::new(1)).unwrap();
        regions[idx].make_trash();
        fs.retire_alloc_regions();
        assert_eq!(fs.recycle_trash(&regions), vec![idx]);
        assert!(regions[idx].is_empty());
    }

    #[test]
    fn each_affiliation_keeps_its_own_alloc_region() {
        let regions = regions(4);
        let mut fs = RegionFreeSet::new(0);
        fs.rebuild(&regions, false);
        let young = AllocRequest::mutator(64, Affiliation::Young);
        let old = AllocRequest::mutator(64, Affiliation::Old);
        let y = fs.region_for(&regions, young).unwrap();
        let o = fs.region_for(&regions, old).unwrap();
        assert_ne!(y, o);
        assert_eq!(fs.region_for(&regions, young), Some(y));
        assert_eq!(fs.region_for(&regions, old), Some(o));
        assert_eq!(regions[o].affiliation(), Affiliation::Old);
    }
}
