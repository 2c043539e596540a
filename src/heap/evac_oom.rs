//! Tracking of threads inside evacuation and to-space exhaustion.
//!
//! A thread that may copy objects enters an [`EvacOomScope`] first. When a copy
//! fails for lack of to-space the handler flips into OOM mode. The failing
//! thread, and every evacuator that sees the flag afterwards, leaves the count
//! and waits for the threads still inside to drain. Once the count reaches
//! zero no forwarding entry can be installed any more, so the forwardee read
//! after the wait is final.
//!
//! Code-unit locks are always taken before entering the scope. A thread
//! waiting for the drain must not hold a lock another evacuator needs.
//!
//! Scope state is per thread. A thread evacuates for one heap at a time.

use std::{
    cell::Cell,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crossbeam_utils::Backoff;

thread_local! {
    /// Nesting depth of scopes on this thread, and whether the outermost one
    /// still counts towards `threads_in_evac`.
    static SCOPE: Cell<(usize, bool)> = const { Cell::new((0, false)) };
}

#[derive(Debug, Default)]
pub struct EvacOomHandler {
    threads_in_evac: AtomicUsize,
    oom_during_evac: AtomicBool,
}

impl EvacOomHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the evacuation protocol. With OOM already raised this waits for
    /// the drain and the scope does not count.
    pub fn enter(&self) -> EvacOomScope<'_> {
        let (depth, registered) = SCOPE.get();
        if depth > 0 {
            SCOPE.set((depth + 1, registered));
            return EvacOomScope { handler: self };
        }
        self.threads_in_evac.fetch_add(1, Ordering::SeqCst);
        SCOPE.set((1, true));
        if self.is_oom() {
            self.unregister_and_wait();
        }
        EvacOomScope { handler: self }
    }

    pub fn threads_in_evac(&self) -> usize {
        self.threads_in_evac.load(Ordering::SeqCst)
    }

    /// Raise OOM and wait until no other thread can install a forwardee.
    /// Returns true for the thread that raised it first.
    pub fn handle_oom(&self) -> bool {
        let first = !self.oom_during_evac.swap(true, Ordering::SeqCst);
        self.unregister_and_wait();
        first
    }

    /// Called by an evacuator that observed OOM mode: leave the count and
    /// wait for the drain before trusting the forwarding table.
    pub fn wait_for_drain(&self) {
        debug_assert!(self.is_oom());
        self.unregister_and_wait();
    }

    pub fn is_oom(&self) -> bool {
        self.oom_during_evac.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        debug_assert_eq!(self.threads_in_evac(), 0, "clearing OOM state while evacuating");
        self.oom_during_evac.store(false, Ordering::SeqCst);
    }

    fn unregister_and_wait(&self) {
        let (depth, registered) = SCOPE.get();
        if registered {
            self.threads_in_evac.fetch_sub(1, Ordering::SeqCst);
            SCOPE.set((depth, false));
        }
        let backoff = Backoff::new();
        while self.threads_in_evac.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
    }
}

pub struct EvacOomScope<'a> {
    handler: &'a EvacOomHandler,
}

impl Drop for EvacOomScope<'_> {
    fn drop(&mut self) {
        let (depth, registered) = SCOPE.get();
        if depth > 1 {
            SCOPE.set((depth - 1, registered));
            return;
        }
        if registered {
            self.handler.threads_in_evac.fetch_sub(1, Ordering::SeqCst);
        }
        SCOPE.set((0, false));
    }
}
