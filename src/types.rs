//! Small value types shared by every layer of the collector.

use std::{fmt, num::NonZeroUsize};

use bitflags::bitflags;

/// Reference to a heap object. Slots store the raw address, `0` is null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjRef(NonZeroUsize);

impl ObjRef {
    /// Build a reference from a raw slot value, `None` for null.
    ///
    /// ```
    /// use regiongc::types::ObjRef;
    ///
    /// assert!(ObjRef::from_raw(0).is_none());
    /// assert_eq!(ObjRef::from_raw(0x1000).map(ObjRef::addr), Some(0x1000));
    /// ```
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    pub fn addr(self) -> usize {
        self.0.get()
    }

    /// Raw slot encoding of an optional reference.
    pub fn encode(obj: Option<ObjRef>) -> usize {
        obj.map_or(0, ObjRef::addr)
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:#x})", self.addr())
    }
}

/// Heap operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeapMode {
    /// Single global generation.
    #[default]
    Satb,
    /// Young and old generations with a remembered set.
    Generational,
}

/// Logical partition a cycle collects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationMode {
    Young,
    Old,
    Global,
}

impl GenerationMode {
    pub fn name(self) -> &'static str {
        match self {
            GenerationMode::Young => "Young",
            GenerationMode::Old => "Old",
            GenerationMode::Global => "Global",
        }
    }

    pub fn is_young(self) -> bool {
        self == GenerationMode::Young
    }

    pub fn is_old(self) -> bool {
        self == GenerationMode::Old
    }

    pub fn is_global(self) -> bool {
        self == GenerationMode::Global
    }

    /// Whether a region with `affiliation` belongs to this generation.
    pub fn contains(self, affiliation: Affiliation) -> bool {
        match self {
            GenerationMode::Young => affiliation == Affiliation::Young,
            GenerationMode::Old => affiliation == Affiliation::Old,
            GenerationMode::Global => affiliation != Affiliation::Free,
        }
    }
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Generation a region currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Affiliation {
    #[default]
    Free,
    Young,
    Old,
}

/// Why a collection was requested or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    /// Mutator allocation could not be satisfied.
    AllocationFailure,
    /// Evacuation ran out of to-space.
    AllocationFailureEvac,
    /// Heuristics decided a cycle is due.
    Heuristics,
    /// Explicit request from the embedder.
    Explicit,
    /// Forced failure from the fault-injection hook.
    InjectedFailure,
    /// Stop requested while the collector shuts down.
    Shutdown,
}

impl GcCause {
    pub fn name(self) -> &'static str {
        match self {
            GcCause::AllocationFailure => "Allocation Failure",
            GcCause::AllocationFailureEvac => "Allocation Failure During Evacuation",
            GcCause::Heuristics => "Heuristics",
            GcCause::Explicit => "Explicit",
            GcCause::InjectedFailure => "Injected Allocation Failure",
            GcCause::Shutdown => "Shutdown",
        }
    }

    pub fn is_allocation_failure(self) -> bool {
        matches!(
            self,
            GcCause::AllocationFailure | GcCause::AllocationFailureEvac | GcCause::InjectedFailure
        )
    }
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Last phase boundary a concurrent cycle passed before it saw cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DegenPoint {
    #[default]
    Unset,
    OutsideCycle,
    Mark,
    Evac,
    UpdateRefs,
}

impl DegenPoint {
    pub fn name(self) -> &'static str {
        match self {
            DegenPoint::Unset => "<UNSET>",
            DegenPoint::OutsideCycle => "Outside of Cycle",
            DegenPoint::Mark => "Mark",
            DegenPoint::Evac => "Evacuation",
            DegenPoint::UpdateRefs => "Update References",
        }
    }
}

impl fmt::Display for DegenPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Collector state bits read by barriers and phase bodies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GcState: u8 {
        const HAS_FORWARDED = 1 << 0;
        const MARKING = 1 << 1;
        const EVACUATION = 1 << 2;
        const UPDATE_REFS = 1 << 3;
        const WEAK_ROOTS = 1 << 4;
        const YOUNG_MARKING = 1 << 5;
        const OLD_MARKING = 1 << 6;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_slot_decodes_to_none() {
        assert_eq!(ObjRef::from_raw(0), None);
        assert_eq!(ObjRef::encode(None), 0);
        let obj = ObjRef::from_raw(0x2000);
        assert_eq!(ObjRef::encode(obj), 0x2000);
    }

    #[test]
    fn generation_membership_follows_affiliation() {
        assert!(GenerationMode::Young.contains(Affiliation::Young));
        assert!(!GenerationMode::Young.contains(Affiliation::Old));
        assert!(GenerationMode::Global.contains(Affiliation::Old));
        assert!(!GenerationMode::Global.contains(Affiliation::Free));
        assert!(GenerationMode::Old.contains(Affiliation::Old));
    }

    #[test]
    fn evacuation_failure_counts_as_allocation_failure() {
        assert!(GcCause::AllocationFailureEvac.is_allocation_failure());
        assert!(GcCause::InjectedFailure.is_allocation_failure());
        assert!(!GcCause::Explicit.is_allocation_failure());
    }
}
