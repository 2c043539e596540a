//! Phase identities, timing and the phase event log.
//!
//! Every step of a cycle has a [`Phase`]. Pauses come in two flavours: the
//! gross phase timed by the submitter (safepoint entry included) and the
//! narrow phase timed inside the operation. [`PausePhase`] and
//! [`ConcurrentPhase`] are call scopes that log the phase, feed monitoring
//! and append begin/end records to the event log.

use std::{
    fmt,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use flume::{Receiver, Sender};
use log::info;
use parking_lot::Mutex;

use crate::{
    heap::Heap,
    types::{GcState, GenerationMode},
};

/// How a phase runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseClass {
    RequiresSafepoint,
    Concurrent,
    /// Runs instrumented on the driver alone.
    NoWorkers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    InitMarkGross,
    InitMark,
    FinalMarkGross,
    FinalMark,
    InitUpdateRefsGross,
    InitUpdateRefs,
    FinalUpdateRefsGross,
    FinalUpdateRefs,
    FinalRootsGross,
    FinalRoots,
    DegenGcGross,
    DegenGc,

    ConcReset,
    ConcScanRememberedSet,
    ConcMarkRoots,
    ConcMark,
    ConcThreadRoots,
    ConcWeakRefs,
    ConcWeakRoots,
    ConcCleanupEarly,
    ConcClassUnload,
    ConcStrongRoots,
    ConcCoalesceAndFill,
    ConcEvac,
    ConcUpdateRefs,
    ConcUpdateThreadRoots,
    ConcCleanupComplete,
}

impl Phase {
    pub const CONCURRENT: [Phase; 15] = [
        Phase::ConcReset,
        Phase::ConcScanRememberedSet,
        Phase::ConcMarkRoots,
        Phase::ConcMark,
        Phase::ConcThreadRoots,
        Phase::ConcWeakRefs,
        Phase::ConcWeakRoots,
        Phase::ConcCleanupEarly,
        Phase::ConcClassUnload,
        Phase::ConcStrongRoots,
        Phase::ConcCoalesceAndFill,
        Phase::ConcEvac,
        Phase::ConcUpdateRefs,
        Phase::ConcUpdateThreadRoots,
        Phase::ConcCleanupComplete,
    ];

    pub fn title(self) -> &'static str {
        match self {
            Phase::InitMarkGross => "Pause Init Mark (G)",
            Phase::InitMark => "Pause Init Mark",
            Phase::FinalMarkGross => "Pause Final Mark (G)",
            Phase::FinalMark => "Pause Final Mark",
            Phase::InitUpdateRefsGross => "Pause Init Update Refs (G)",
            Phase::InitUpdateRefs => "Pause Init Update Refs",
            Phase::FinalUpdateRefsGross => "Pause Final Update Refs (G)",
            Phase::FinalUpdateRefs => "Pause Final Update Refs",
            Phase::FinalRootsGross => "Pause Final Roots (G)",
            Phase::FinalRoots => "Pause Final Roots",
            Phase::DegenGcGross => "Pause Degenerated GC (G)",
            Phase::DegenGc => "Pause Degenerated GC",
            Phase::ConcReset => "Concurrent reset",
            Phase::ConcScanRememberedSet => "Concurrent remembered set scanning",
            Phase::ConcMarkRoots => "Concurrent marking roots",
            Phase::ConcMark => "Concurrent marking",
            Phase::ConcThreadRoots => "Concurrent thread roots",
            Phase::ConcWeakRefs => "Concurrent weak references",
            Phase::ConcWeakRoots => "Concurrent weak roots",
            Phase::ConcCleanupEarly => "Concurrent cleanup",
            Phase::ConcClassUnload => "Concurrent class unloading",
            Phase::ConcStrongRoots => "Concurrent strong roots",
            Phase::ConcCoalesceAndFill => "Concurrent coalescing unmarked objects",
            Phase::ConcEvac => "Concurrent evacuation",
            Phase::ConcUpdateRefs => "Concurrent update references",
            Phase::ConcUpdateThreadRoots => "Concurrent update thread roots",
            Phase::ConcCleanupComplete => "Concurrent final cleanup",
        }
    }

    pub fn class(self) -> PhaseClass {
        match self {
            Phase::InitUpdateRefs
            | Phase::FinalRoots
            | Phase::ConcCleanupEarly
            | Phase::ConcCleanupComplete
            | Phase::ConcUpdateThreadRoots => PhaseClass::NoWorkers,
            p if p.is_pause() => PhaseClass::RequiresSafepoint,
            _ => PhaseClass::Concurrent,
        }
    }

    pub fn is_pause(self) -> bool {
        matches!(
            self,
            Phase::InitMarkGross
                | Phase::InitMark
                | Phase::FinalMarkGross
                | Phase::FinalMark
                | Phase::InitUpdateRefsGross
                | Phase::InitUpdateRefs
                | Phase::FinalUpdateRefsGross
                | Phase::FinalUpdateRefs
                | Phase::FinalRootsGross
                | Phase::FinalRoots
                | Phase::DegenGcGross
                | Phase::DegenGc
        )
    }

    /// Pause or concurrent phase type reported to monitoring.
    pub fn event_name(self) -> &'static str {
        match self {
            Phase::InitMarkGross | Phase::InitMark => "InitMark",
            Phase::FinalMarkGross | Phase::FinalMark => "FinalMarkStartEvac",
            Phase::InitUpdateRefsGross | Phase::InitUpdateRefs => "InitUpdateRefs",
            Phase::FinalUpdateRefsGross | Phase::FinalUpdateRefs => "FinalUpdateRefs",
            Phase::FinalRootsGross | Phase::FinalRoots => "FinalRoots",
            Phase::DegenGcGross | Phase::DegenGc => "Degenerated",
            Phase::ConcReset => "Reset",
            Phase::ConcScanRememberedSet => "ScanRememberedSet",
            Phase::ConcMarkRoots => "MarkingRoots",
            Phase::ConcMark => "Marking",
            Phase::ConcThreadRoots => "ThreadRoots",
            Phase::ConcWeakRefs => "WeakReferences",
            Phase::ConcWeakRoots => "WeakRoots",
            Phase::ConcCleanupEarly => "CleanupEarly",
            Phase::ConcClassUnload => "ClassUnloading",
            Phase::ConcStrongRoots => "StrongRoots",
            Phase::ConcCoalesceAndFill => "CoalesceAndFill",
            Phase::ConcEvac => "Evacuation",
            Phase::ConcUpdateRefs => "ReferenceUpdate",
            Phase::ConcUpdateThreadRoots => "UpdateThreadRoots",
            Phase::ConcCleanupComplete => "CleanupComplete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEventKind {
    Begin,
    End,
}

/// One entry of the event log, with the heap flags seen at that moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseEvent {
    pub phase: Phase,
    pub kind: PhaseEventKind,
    pub generation: GenerationMode,
    pub gc_state: GcState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseStat {
    pub count: usize,
    pub total: Duration,
    pub max: Duration,
}

impl PhaseStat {
    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }
}

#[derive(Default)]
pub struct PhaseTimings {
    stats: DashMap<Phase, PhaseStat>,
    events: Mutex<Vec<PhaseEvent>>,
    subscribers: Mutex<Vec<Sender<PhaseEvent>>>,
}

impl PhaseTimings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, phase: Phase, elapsed: Duration) {
        let mut stat = self.stats.entry(phase).or_default();
        stat.count += 1;
        stat.total += elapsed;
        stat.max = stat.max.max(elapsed);
    }

    pub fn stat(&self, phase: Phase) -> PhaseStat {
        self.stats.get(&phase).map(|s| *s).unwrap_or_default()
    }

    pub fn record_event(&self, event: PhaseEvent) {
        self.events.lock().push(event);
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event).is_ok());
    }

    pub fn events(&self) -> Vec<PhaseEvent> {
        self.events.lock().clone()
    }

    pub fn take_events(&self) -> Vec<PhaseEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Completed phases, in order.
    pub fn completed_phases(&self) -> Vec<Phase> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == PhaseEventKind::End)
            .map(|e| e.phase)
            .collect()
    }

    pub fn subscribe(&self) -> Receiver<PhaseEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn clear(&self) {
        self.stats.clear();
        self.events.lock().clear();
    }
}

/// Records the elapsed time of `phase` when dropped.
pub struct TimingsTracker<'a> {
    timings: &'a PhaseTimings,
    phase: Phase,
    start: Instant,
}

impl<'a> TimingsTracker<'a> {
    pub fn new(timings: &'a PhaseTimings, phase: Phase) -> Self {
        Self {
            timings,
            phase,
            start: Instant::now(),
        }
    }
}

impl Drop for TimingsTracker<'_> {
    fn drop(&mut self) {
        self.timings.record(self.phase, self.start.elapsed());
    }
}

fn event(heap: &Heap, phase: Phase, kind: PhaseEventKind, generation: GenerationMode) -> PhaseEvent {
    PhaseEvent {
        phase,
        kind,
        generation,
        gc_state: heap.gc_state(),
    }
}

/// Scope of a narrow stop-the-world phase.
pub struct PausePhase<'a> {
    heap: &'a Heap,
    phase: Phase,
    generation: GenerationMode,
    _tracker: TimingsTracker<'a>,
    start: Instant,
}

impl<'a> PausePhase<'a> {
    pub fn new(heap: &'a Heap, phase: Phase, generation: GenerationMode) -> Self {
        debug_assert!(phase.is_pause(), "{phase:?} is not a pause");
        info!("{} ({})", phase.title(), generation.name());
        heap.monitoring().pause_begin(phase);
        heap.timings()
            .record_event(event(heap, phase, PhaseEventKind::Begin, generation));
        Self {
            heap,
            phase,
            generation,
            _tracker: TimingsTracker::new(heap.timings(), phase),
            start: Instant::now(),
        }
    }
}

impl Drop for PausePhase<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.heap.timings().record_event(event(
            self.heap,
            self.phase,
            PhaseEventKind::End,
            self.generation,
        ));
        self.heap.monitoring().pause_end(self.phase, elapsed);
        info!(
            "{} ({}) {:.3}ms",
            self.phase.title(),
            self.generation.name(),
            elapsed.as_secs_f64() * 1000.0
        );
    }
}

/// Scope of a concurrent phase.
pub struct ConcurrentPhase<'a> {
    heap: &'a Heap,
    phase: Phase,
    generation: GenerationMode,
    _tracker: TimingsTracker<'a>,
    start: Instant,
}

impl<'a> ConcurrentPhase<'a> {
    pub fn new(heap: &'a Heap, phase: Phase, generation: GenerationMode) -> Self {
        info!("{} ({})", phase.title(), generation.name());
        heap.monitoring().concurrent_phase_begin(phase);
        heap.timings()
            .record_event(event(heap, phase, PhaseEventKind::Begin, generation));
        Self {
            heap,
            phase,
            generation,
            _tracker: TimingsTracker::new(heap.timings(), phase),
            start: Instant::now(),
        }
    }
}

impl Drop for ConcurrentPhase<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.heap.timings().record_event(event(
            self.heap,
            self.phase,
            PhaseEventKind::End,
            self.generation,
        ));
        self.heap.monitoring().concurrent_phase_end(self.phase, elapsed);
        info!(
            "{} ({}) {:.3}ms",
            self.phase.title(),
            self.generation.name(),
            elapsed.as_secs_f64() * 1000.0
        );
    }
}
