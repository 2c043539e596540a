use std::sync::atomic::Ordering;

use crate::{
    phase::{Phase, PhaseEventKind},
    reference::ReferenceKind,
    test_utils::{test_options, TestFixture},
    types::{Affiliation, DegenPoint, GcCause, GcState, GenerationMode},
};

use super::ConcurrentGc;

fn state_at_end(fixture: &TestFixture, phase: Phase) -> GcState {
    fixture
        .heap()
        .timings()
        .events()
        .into_iter()
        .find(|e| e.phase == phase && e.kind == PhaseEventKind::End)
        .map(|e| e.gc_state)
        .unwrap_or_else(|| panic!("{phase:?} did not complete"))
}

fn evacuating_fixture() -> TestFixture {
    let fixture = TestFixture::new().unwrap();
    fixture.evacuation_candidate(Affiliation::Young).unwrap();
    fixture
}

/// Run a global cycle with `site` armed and report how it ended.
fn collect_with_fault(fixture: &TestFixture, site: Phase) -> (bool, DegenPoint) {
    fixture.heap().fault_injector().arm(site);
    let (ok, gc) = fixture.collect(GenerationMode::Global);
    (ok, gc.degen_point())
}

#[test]
fn evacuating_cycle_runs_full_sequence() {
    let fixture = evacuating_fixture();
    let (ok, gc) = fixture.collect(GenerationMode::Global);
    assert!(ok);
    assert!(!gc.abbreviated());
    assert_eq!(gc.degen_point(), DegenPoint::Unset);
    assert_eq!(
        fixture.heap().timings().completed_phases(),
        vec![
            Phase::ConcReset,
            Phase::InitMark,
            Phase::ConcMarkRoots,
            Phase::ConcMark,
            Phase::FinalMark,
            Phase::ConcThreadRoots,
            Phase::ConcWeakRefs,
            Phase::ConcWeakRoots,
            Phase::ConcCleanupEarly,
            Phase::ConcStrongRoots,
            Phase::ConcEvac,
            Phase::InitUpdateRefs,
            Phase::ConcUpdateRefs,
            Phase::ConcUpdateThreadRoots,
            Phase::FinalUpdateRefs,
            Phase::ConcCleanupComplete,
        ]
    );
    assert!(!fixture.heap().is_gc_in_progress());
}

#[test]
fn empty_collection_set_ends_with_final_roots() {
    let fixture = TestFixture::new().unwrap();
    let chain = fixture.alloc_chain(Affiliation::Young, 3).unwrap();
    fixture.root(chain[0]);

    let (ok, gc) = fixture.collect(GenerationMode::Global);
    assert!(ok);
    assert!(gc.abbreviated());
    assert_eq!(
        fixture.heap().timings().completed_phases(),
        vec![
            Phase::ConcReset,
            Phase::InitMark,
            Phase::ConcMarkRoots,
            Phase::ConcMark,
            Phase::FinalMark,
            Phase::ConcWeakRefs,
            Phase::ConcWeakRoots,
            Phase::ConcCleanupEarly,
            Phase::FinalRoots,
        ]
    );
    assert!(fixture.heap().gc_state().is_empty());
}

#[test]
fn live_objects_move_and_roots_follow() {
    let fixture = TestFixture::new().unwrap();
    let (handle, live) = fixture.evacuation_candidate(Affiliation::Young).unwrap();
    let tail = fixture.alloc(Affiliation::Young, 0).unwrap();
    fixture.heap().store_field(live, 0, Some(tail)).unwrap();
    let from_region = fixture.heap().region_for(live).index();

    let (ok, _) = fixture.collect(GenerationMode::Global);
    assert!(ok);

    let heap = fixture.heap();
    let moved = fixture.root_value(handle).unwrap();
    assert_ne!(moved, live);
    assert_ne!(heap.region_for(moved).index(), from_region);
    assert!(!heap.region(from_region).is_active());
    assert_eq!(heap.load_field(moved, 0).unwrap(), Some(tail));
}

#[test]
fn flags_follow_pause_boundaries() {
    let fixture = evacuating_fixture();
    assert!(fixture.collect(GenerationMode::Global).0);

    let init_mark = state_at_end(&fixture, Phase::InitMark);
    assert!(init_mark.contains(GcState::MARKING));
    assert!(!init_mark.contains(GcState::EVACUATION));

    let final_mark = state_at_end(&fixture, Phase::FinalMark);
    assert!(!final_mark.contains(GcState::MARKING));
    assert!(final_mark.contains(
        GcState::EVACUATION | GcState::HAS_FORWARDED | GcState::WEAK_ROOTS
    ));

    let init_update_refs = state_at_end(&fixture, Phase::InitUpdateRefs);
    assert!(init_update_refs.contains(GcState::UPDATE_REFS | GcState::HAS_FORWARDED));
    assert!(!init_update_refs.intersects(GcState::EVACUATION | GcState::WEAK_ROOTS));

    assert!(state_at_end(&fixture, Phase::FinalUpdateRefs).is_empty());
}

#[test]
fn cancellation_before_marking_degenerates_outside_cycle() {
    for site in [Phase::ConcReset, Phase::InitMark, Phase::ConcMarkRoots] {
        let fixture = evacuating_fixture();
        assert_eq!(
            collect_with_fault(&fixture, site),
            (false, DegenPoint::OutsideCycle),
            "{site:?}"
        );
    }
}

#[test]
fn cancellation_during_marking_degenerates_at_mark() {
    for site in [Phase::ConcMark, Phase::FinalMark] {
        let fixture = evacuating_fixture();
        assert_eq!(collect_with_fault(&fixture, site), (false, DegenPoint::Mark), "{site:?}");
        assert!(fixture.heap().is_concurrent_mark_in_progress());
        assert!(!fixture.heap().is_evacuation_in_progress());
    }
}

#[test]
fn cancellation_after_final_mark_degenerates_at_evac() {
    for site in [
        Phase::ConcThreadRoots,
        Phase::ConcWeakRefs,
        Phase::ConcWeakRoots,
        Phase::ConcCleanupEarly,
        Phase::ConcStrongRoots,
        Phase::ConcEvac,
    ] {
        let fixture = evacuating_fixture();
        assert_eq!(collect_with_fault(&fixture, site), (false, DegenPoint::Evac), "{site:?}");
        assert!(fixture.heap().is_evacuation_in_progress());
    }
}

#[test]
fn cancellation_during_update_refs_degenerates_at_update_refs() {
    for site in [
        Phase::InitUpdateRefs,
        Phase::ConcUpdateRefs,
        Phase::ConcUpdateThreadRoots,
    ] {
        let fixture = evacuating_fixture();
        assert_eq!(
            collect_with_fault(&fixture, site),
            (false, DegenPoint::UpdateRefs),
            "{site:?}"
        );
        assert!(fixture.heap().is_update_refs_in_progress());
    }
}

#[test]
fn late_cancellation_is_absorbed_by_final_update_refs() {
    let fixture = evacuating_fixture();
    assert_eq!(
        collect_with_fault(&fixture, Phase::FinalUpdateRefs),
        (true, DegenPoint::Unset)
    );
    assert!(!fixture.heap().cancelled_gc());
    assert!(!fixture.heap().is_gc_in_progress());
}

#[test]
fn abbreviated_cycle_ignores_cancellation_in_final_roots() {
    let fixture = TestFixture::new().unwrap();
    let obj = fixture.alloc(Affiliation::Young, 0).unwrap();
    fixture.root(obj);
    assert_eq!(
        collect_with_fault(&fixture, Phase::FinalRoots),
        (true, DegenPoint::Unset)
    );
    assert!(fixture.heap().gc_state().is_empty());
}

#[test]
#[should_panic(expected = "already set")]
fn degen_point_is_recorded_once() {
    let fixture = TestFixture::new().unwrap();
    let gc = fixture.concurrent_gc(GenerationMode::Global);
    fixture.heap().cancel_gc(GcCause::Explicit);
    assert!(gc.check_cancellation_and_abort(DegenPoint::Mark));
    gc.check_cancellation_and_abort(DegenPoint::Evac);
}

#[test]
fn uncancelled_checkpoint_records_nothing() {
    let fixture = TestFixture::new().unwrap();
    let gc = fixture.concurrent_gc(GenerationMode::Global);
    assert!(!gc.check_cancellation_and_abort(DegenPoint::Mark));
    assert_eq!(gc.degen_point(), DegenPoint::Unset);
}

#[test]
fn weak_roots_are_cleared_or_updated() {
    let fixture = TestFixture::new().unwrap();
    let (handle, live) = fixture.evacuation_candidate(Affiliation::Young).unwrap();
    let dead = fixture.alloc(Affiliation::Young, 0).unwrap();
    let to_live = fixture.weak_root(live);
    let to_dead = fixture.weak_root(dead);

    assert!(fixture.collect(GenerationMode::Global).0);

    assert_eq!(fixture.weak_root_value(to_dead), None);
    let updated = fixture.weak_root_value(to_live).unwrap();
    assert!(fixture.moved(live, updated));
    assert_eq!(fixture.root_value(handle), Some(updated));
    assert!(fixture.heap().roots().vm_weak().dead_reported() >= 1);
}

#[test]
fn dead_weak_reference_is_cleared_and_pending() {
    let fixture = TestFixture::new().unwrap();
    let heap = fixture.heap();
    let live = fixture.alloc(Affiliation::Young, 0).unwrap();
    let handle = fixture.root(live);
    let dead = fixture.alloc(Affiliation::Young, 0).unwrap();
    let softly_held = fixture.alloc(Affiliation::Young, 0).unwrap();
    let processor = heap.global_generation().ref_processor();
    let strong = processor.register(ReferenceKind::Weak, live);
    let weak = processor.register(ReferenceKind::Weak, dead);
    let soft = processor.register(ReferenceKind::Soft, softly_held);

    assert!(fixture.collect(GenerationMode::Global).0);

    // The region had garbage, so the rooted referent was evacuated.
    let moved = fixture.root_value(handle).unwrap();
    assert!(fixture.moved(live, moved));
    assert_eq!(strong.get(), Some(moved));
    assert_eq!(weak.get(), None);
    // Soft referents survive unless the policy clears them.
    let soft_now = soft.get().unwrap();
    assert!(fixture.moved(softly_held, soft_now));
    assert_eq!(processor.pending_count(), 1);
}

#[test]
fn thread_stacks_see_moved_objects() {
    let fixture = TestFixture::new().unwrap();
    let (_, live) = fixture.evacuation_candidate(Affiliation::Young).unwrap();
    let thread = fixture.mutator(1, &[live]);

    assert!(fixture.collect(GenerationMode::Global).0);

    let moved = thread.root(0).unwrap();
    assert!(fixture.moved(live, moved));
}

#[test]
fn global_cycle_over_both_generations_is_mixed() {
    let fixture = TestFixture::generational().unwrap();
    fixture.evacuation_candidate(Affiliation::Young).unwrap();
    fixture.evacuation_candidate(Affiliation::Old).unwrap();

    let (ok, gc) = fixture.collect(GenerationMode::Global);
    assert!(ok);
    assert!(gc.mixed_evac());
    assert!(fixture
        .heap()
        .timings()
        .completed_phases()
        .contains(&Phase::ConcCoalesceAndFill));
}

#[test]
fn young_cycle_scans_remembered_set_and_leaves_old_alone() {
    let fixture = TestFixture::generational().unwrap();
    let heap = fixture.heap();
    let (_, old) = fixture.evacuation_candidate(Affiliation::Old).unwrap();
    fixture.retire();
    let young = fixture.alloc(Affiliation::Young, 0).unwrap();
    fixture.garbage(Affiliation::Young, 1).unwrap();
    // Reachable only through the old object.
    heap.store_field(old, 0, Some(young)).unwrap();

    let (ok, gc) = fixture.collect(GenerationMode::Young);
    assert!(ok);
    assert!(!gc.mixed_evac());
    let phases = heap.timings().completed_phases();
    assert!(phases.contains(&Phase::ConcScanRememberedSet));
    assert!(!phases.contains(&Phase::ConcCoalesceAndFill));

    assert_eq!(heap.forwardee(old), None);
    let moved = heap.load_field(old, 0).unwrap().unwrap();
    assert!(fixture.moved(young, moved));
}

#[test]
fn old_cycle_resumes_bootstrapped_marking() {
    let fixture = TestFixture::generational().unwrap();
    let heap = fixture.heap();
    let old = fixture.alloc(Affiliation::Old, 0).unwrap();
    fixture.root(old);

    let bootstrap = ConcurrentGc::new(std::sync::Arc::clone(heap), GenerationMode::Young, true);
    assert!(bootstrap.collect(GcCause::Heuristics));
    assert!(heap.is_concurrent_old_mark_in_progress());
    assert!(!heap.is_concurrent_young_mark_in_progress());

    heap.timings().clear();
    let (ok, _) = fixture.resume_old();
    assert!(ok);
    let phases = heap.timings().completed_phases();
    assert!(!phases.contains(&Phase::ConcReset));
    assert!(!phases.contains(&Phase::InitMark));
    assert!(phases.contains(&Phase::FinalMark));
    assert!(!heap.is_concurrent_old_mark_in_progress());
    assert!(heap.is_marked(old));
}

#[test]
fn verified_cycle_passes_every_checkpoint() {
    let fixture = TestFixture::with_options(test_options().with_verify(true)).unwrap();
    let (_, live) = fixture.evacuation_candidate(Affiliation::Young).unwrap();
    let chain = fixture.alloc_chain(Affiliation::Young, 4).unwrap();
    fixture.heap().store_field(live, 0, Some(chain[0])).unwrap();
    assert!(fixture.collect(GenerationMode::Global).0);
}

#[test]
fn old_cycle_without_bootstrap_runs_from_reset() {
    let fixture = TestFixture::generational().unwrap();
    let heap = fixture.heap();
    let old = fixture.alloc(Affiliation::Old, 0).unwrap();
    fixture.root(old);
    assert!(!heap.is_concurrent_old_mark_in_progress());

    let (ok, _) = fixture.collect(GenerationMode::Old);
    assert!(ok);
    let phases = heap.timings().completed_phases();
    assert_eq!(phases[..2], [Phase::ConcReset, Phase::InitMark]);
    assert!(heap.is_marked(old));
}

#[test]
fn final_mark_on_cancelled_cycle_leaves_marking_to_degeneration() {
    let fixture = evacuating_fixture();
    let (ok, point) = collect_with_fault(&fixture, Phase::FinalMark);
    assert!(!ok);
    assert_eq!(point, DegenPoint::Mark);
    let phases = fixture.heap().timings().completed_phases();
    assert!(phases.contains(&Phase::FinalMark));
    assert!(!phases.contains(&Phase::ConcWeakRoots));
    assert!(fixture.heap().collection_set().is_empty());
}

#[test]
fn class_unloading_runs_only_when_enabled() {
    for unload in [false, true] {
        let fixture =
            TestFixture::with_options(test_options().with_unload_classes(unload)).unwrap();
        fixture.evacuation_candidate(Affiliation::Young).unwrap();
        assert!(fixture.collect(GenerationMode::Global).0);

        let phases = fixture.heap().timings().completed_phases();
        let at = |phase| phases.iter().position(|p| *p == phase);
        assert_eq!(at(Phase::ConcClassUnload).is_some(), unload, "unload={unload}");
        if unload {
            assert!(at(Phase::ConcCleanupEarly) < at(Phase::ConcClassUnload));
            assert!(at(Phase::ConcClassUnload) < at(Phase::ConcStrongRoots));
        }
    }
}

#[test]
fn abbreviated_cycle_still_unloads_classes() {
    let fixture = TestFixture::with_options(test_options().with_unload_classes(true)).unwrap();
    let obj = fixture.alloc(Affiliation::Young, 0).unwrap();
    fixture.root(obj);

    let (ok, gc) = fixture.collect(GenerationMode::Global);
    assert!(ok);
    assert!(gc.abbreviated());
    let phases = fixture.heap().timings().completed_phases();
    assert!(phases.contains(&Phase::ConcClassUnload));
    assert!(phases.contains(&Phase::FinalRoots));
}

#[test]
fn cancelled_marking_never_unloads_classes() {
    let fixture = TestFixture::with_options(test_options().with_unload_classes(true)).unwrap();
    fixture.evacuation_candidate(Affiliation::Young).unwrap();
    assert_eq!(
        collect_with_fault(&fixture, Phase::ConcMark),
        (false, DegenPoint::Mark)
    );
    assert!(!fixture
        .heap()
        .timings()
        .completed_phases()
        .contains(&Phase::ConcClassUnload));
}

#[test]
fn verified_cycle_unloads_dead_loader_and_its_code() {
    let fixture = TestFixture::with_options(
        test_options().with_unload_classes(true).with_verify(true),
    )
    .unwrap();
    let heap = fixture.heap();
    let (_, live_holder) = fixture.evacuation_candidate(Affiliation::Young).unwrap();
    let dead_holder = fixture.alloc(Affiliation::Young, 0).unwrap();
    let dead_target = fixture.alloc(Affiliation::Young, 0).unwrap();

    let roots = heap.roots();
    let live_cld = roots.class_loaders().register(Some(live_holder));
    let dead_cld = roots.class_loaders().register(Some(dead_holder));
    let live_unit = roots.code_cache().register(&[live_holder], Some(live_cld));
    roots.code_cache().register(&[dead_target], Some(dead_cld));

    assert!(fixture.collect(GenerationMode::Global).0);

    let counters = heap.counters();
    assert_eq!(counters.code_units_unloaded.load(Ordering::Relaxed), 1);
    assert_eq!(counters.class_loaders_unloaded.load(Ordering::Relaxed), 1);
    assert_eq!(roots.class_loaders().len(), 1);
    let units = roots.code_cache().units();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].id(), live_unit.id());
    // Final update refs healed the surviving unit.
    let healed = live_unit.oop(0).unwrap();
    assert!(fixture.moved(live_holder, healed));
}
