//! Tests for the safepoint executor

use super::*;
use crate::{
    error::GcError,
    thread::{MutatorThread, ThreadRegistry, ThreadState},
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn executor(threads: Arc<ThreadRegistry>, timeout: Duration) -> Arc<SafepointExecutor> {
    Arc::new(SafepointExecutor::start(threads, timeout).unwrap())
}

#[test]
fn operation_runs_on_the_vm_thread() {
    let exec = executor(Arc::new(ThreadRegistry::new()), Duration::from_secs(1));
    let on_vm = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&on_vm);
    let observer = Arc::clone(&exec);
    exec.execute("Observe", move || {
        flag.store(
            observer.is_vm_thread() && observer.is_at_safepoint(),
            Ordering::Release,
        );
    })
    .unwrap();
    assert!(on_vm.load(Ordering::Acquire));
    assert!(!exec.is_at_safepoint());
    assert!(!exec.is_vm_thread());
}

#[test]
fn operations_never_overlap() {
    let exec = executor(Arc::new(ThreadRegistry::new()), Duration::from_secs(1));
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let exec = Arc::clone(&exec);
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            thread::spawn(move || {
                for _ in 0..10 {
                    let inside = Arc::clone(&inside);
                    let overlaps = Arc::clone(&overlaps);
                    exec.execute("Overlap", move || {
                        if inside.fetch_add(1, Ordering::AcqRel) != 0 {
                            overlaps.fetch_add(1, Ordering::Relaxed);
                        }
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::AcqRel);
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for s in submitters {
        s.join().unwrap();
    }
    assert_eq!(overlaps.load(Ordering::Relaxed), 0);
    assert_eq!(exec.stats().total_operations, 40);
}

#[test]
fn panic_is_resumed_on_submitter() {
    let exec = executor(Arc::new(ThreadRegistry::new()), Duration::from_secs(1));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = exec.execute("Explode", || panic!("verification failed"));
    }));
    assert!(result.is_err());
    // The VM thread survives and accepts more work.
    exec.execute("After", || {}).unwrap();
}

#[test]
fn running_mutators_are_parked_during_operation() {
    let threads = Arc::new(ThreadRegistry::new());
    let mutator = MutatorThread::new(3);
    threads.register(mutator.clone());
    mutator.unblock();

    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let mutator = mutator.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                mutator.poll_safepoint();
                thread::yield_now();
            }
            mutator.block();
        })
    };

    let exec = executor(Arc::clone(&threads), Duration::from_secs(5));
    let observed = Arc::new(parking_lot::Mutex::new(None));
    let slot = Arc::clone(&observed);
    let watched = mutator.clone();
    exec.execute("Observe", move || {
        *slot.lock() = Some(watched.state());
    })
    .unwrap();
    stop.store(true, Ordering::Release);
    worker.join().unwrap();

    assert_eq!(*observed.lock(), Some(ThreadState::Parked));
}

#[test]
fn unresponsive_mutator_times_out() {
    let threads = Arc::new(ThreadRegistry::new());
    let mutator = MutatorThread::new(1);
    threads.register(mutator.clone());
    mutator.unblock();
    let exec = executor(threads, Duration::from_millis(20));
    assert_eq!(
        exec.execute("Stuck", || {}),
        Err(GcError::SafepointTimeout { operation: "Stuck" })
    );
    assert_eq!(exec.stats().timeouts, 1);
    mutator.block();
}

#[test]
fn shutdown_rejects_new_operations() {
    let exec = executor(Arc::new(ThreadRegistry::new()), Duration::from_secs(1));
    exec.shutdown();
    assert_eq!(exec.execute("Late", || {}), Err(GcError::SafepointExecutorGone));
}
