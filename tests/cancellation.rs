//! Cancellation at every checkpoint, finished by the degenerated collector.

use regiongc::{
    control::{CycleOutcome, GcController},
    phase::Phase,
    test_utils::{test_options, TestFixture},
    types::{Affiliation, DegenPoint, GcCause, GenerationMode},
};

const SITES: [(Phase, Option<DegenPoint>); 16] = [
    (Phase::ConcReset, Some(DegenPoint::OutsideCycle)),
    (Phase::InitMark, Some(DegenPoint::OutsideCycle)),
    (Phase::ConcMarkRoots, Some(DegenPoint::OutsideCycle)),
    (Phase::ConcMark, Some(DegenPoint::Mark)),
    (Phase::FinalMark, Some(DegenPoint::Mark)),
    (Phase::ConcThreadRoots, Some(DegenPoint::Evac)),
    (Phase::ConcWeakRefs, Some(DegenPoint::Evac)),
    (Phase::ConcWeakRoots, Some(DegenPoint::Evac)),
    (Phase::ConcCleanupEarly, Some(DegenPoint::Evac)),
    (Phase::ConcStrongRoots, Some(DegenPoint::Evac)),
    (Phase::ConcEvac, Some(DegenPoint::Evac)),
    (Phase::InitUpdateRefs, Some(DegenPoint::UpdateRefs)),
    (Phase::ConcUpdateRefs, Some(DegenPoint::UpdateRefs)),
    (Phase::ConcUpdateThreadRoots, Some(DegenPoint::UpdateRefs)),
    // Nothing checks for cancellation after these.
    (Phase::FinalUpdateRefs, None),
    (Phase::ConcCleanupComplete, None),
];

fn verified_fixture() -> TestFixture {
    TestFixture::with_options(test_options().with_verify(true)).unwrap()
}

#[test]
fn every_site_ends_with_collected_heap() {
    for (site, expected) in SITES {
        let fixture = verified_fixture();
        let (handle, live) = fixture.evacuation_candidate(Affiliation::Young).unwrap();
        let thread = fixture.mutator(1, &[live]);
        fixture.heap().fault_injector().arm(site);
        let controller = GcController::new(fixture.heap().clone());

        let outcome = controller
            .run_cycle(GcCause::Heuristics, GenerationMode::Global)
            .unwrap();
        let expected = expected.map_or(CycleOutcome::Concurrent, CycleOutcome::Degenerated);
        assert_eq!(outcome, expected, "{site:?}");

        let heap = fixture.heap();
        assert!(heap.gc_state().is_empty(), "{site:?}: {:?}", heap.gc_state());
        assert!(!heap.cancelled_gc(), "{site:?}");
        let moved = fixture.root_value(handle).unwrap();
        assert!(fixture.moved(live, moved), "{site:?}: {live:?} -> {moved:?}");
        assert_eq!(thread.root(0), Some(moved), "{site:?}");
        assert_eq!(heap.fault_injector().fired(), 1, "{site:?}");
    }
}

#[test]
fn degenerated_cycle_is_reported_as_one_pause() {
    let fixture = verified_fixture();
    fixture.evacuation_candidate(Affiliation::Young).unwrap();
    fixture.heap().fault_injector().arm(Phase::ConcEvac);
    let rx = fixture.heap().monitoring().subscribe();
    let controller = GcController::new(fixture.heap().clone());

    controller
        .run_cycle(GcCause::Heuristics, GenerationMode::Global)
        .unwrap();

    let note = rx.try_recv().unwrap();
    let pauses: Vec<_> = note.info.pauses.iter().map(|p| p.name).collect();
    assert_eq!(pauses, ["InitMark", "FinalMarkStartEvac", "Degenerated"]);
    assert_eq!(fixture.heap().timings().stat(Phase::DegenGcGross).count, 1);
}

#[test]
fn failed_mutator_allocation_cancels_the_running_cycle() {
    let fixture = TestFixture::with_options(test_options().with_region_count(4)).unwrap();
    let heap = fixture.heap();
    fixture.evacuation_candidate(Affiliation::Young).unwrap();

    heap.set_concurrent_mark_in_progress(GenerationMode::Global, true);
    while heap.allocate(Affiliation::Young, 8).is_ok() {}
    assert_eq!(heap.cancelled_cause(), Some(GcCause::AllocationFailure));
    heap.set_concurrent_mark_in_progress(GenerationMode::Global, false);
    heap.clear_cancelled_gc(true);
}

#[test]
fn allocation_failure_outside_a_cycle_does_not_cancel() {
    let fixture = TestFixture::with_options(test_options().with_region_count(4)).unwrap();
    let heap = fixture.heap();
    while heap.allocate(Affiliation::Young, 8).is_ok() {}
    assert!(!heap.cancelled_gc());
}

#[test]
fn always_armed_site_degenerates_every_cycle() {
    let fixture = verified_fixture();
    fixture.heap().fault_injector().arm_always(Phase::ConcMark);
    let controller = GcController::new(fixture.heap().clone());

    for _ in 0..3 {
        fixture.evacuation_candidate(Affiliation::Young).unwrap();
        assert_eq!(
            controller.run_cycle(GcCause::Heuristics, GenerationMode::Global),
            Ok(CycleOutcome::Degenerated(DegenPoint::Mark))
        );
    }
    let stats = controller.stats();
    assert_eq!(stats.degenerated_cycles, 3);
    assert_eq!(stats.concurrent_cycles, 0);
}

#[test]
fn disabled_injection_never_fires() {
    let fixture =
        TestFixture::with_options(test_options().with_alloc_failure_injection(false)).unwrap();
    fixture.evacuation_candidate(Affiliation::Young).unwrap();
    fixture.heap().fault_injector().arm(Phase::ConcEvac);
    let controller = GcController::new(fixture.heap().clone());

    assert_eq!(
        controller.run_cycle(GcCause::Heuristics, GenerationMode::Global),
        Ok(CycleOutcome::Concurrent)
    );
    assert_eq!(fixture.heap().fault_injector().fired(), 0);
}
