//! Mutator thread registry and per-thread safepoint state.
//!
//! A mutator is either `Running` managed code (it must poll), `Blocked`
//! outside managed code (the collector may act on its behalf), or `Parked`
//! at a safepoint. New threads start blocked.
//!
//! # Examples
//!
//! ```
//! use regiongc::thread::{MutatorThread, ThreadRegistry, ThreadState};
//!
//! let registry = ThreadRegistry::new();
//! let thread = MutatorThread::new(1);
//! registry.register(thread.clone());
//! assert_eq!(thread.state(), ThreadState::Blocked);
//!
//! thread.unblock();
//! thread.poll_safepoint();
//! thread.block();
//!
//! let threads = registry.iter();
//! assert_eq!(threads.len(), 1);
//! assert_eq!(threads[0].id(), 1);
//! ```

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use flume::Sender;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::types::ObjRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Blocked,
    Parked,
}

/// Closure a handshake runs once per mutator, on the mutator or on its behalf.
pub type HandshakeOp = Arc<dyn Fn(&MutatorThread) + Send + Sync>;

struct PendingHandshake {
    op: HandshakeOp,
    done: Sender<()>,
}

struct MutatorInner {
    id: usize,
    safepoint_requested: AtomicBool,
    handshake_pending: AtomicBool,
    state: Mutex<ThreadState>,
    cv: Condvar,
    pending: Mutex<VecDeque<PendingHandshake>>,
    stack: RwLock<Vec<AtomicUsize>>,
}

impl MutatorInner {
    fn new(id: usize) -> Self {
        Self {
            id,
            safepoint_requested: AtomicBool::new(false),
            handshake_pending: AtomicBool::new(false),
            state: Mutex::new(ThreadState::Blocked),
            cv: Condvar::new(),
            pending: Mutex::new(VecDeque::new()),
            stack: RwLock::new(Vec::new()),
        }
    }
}

/// Handle to one mutator. Clones share state.
///
/// ```
/// use regiongc::thread::MutatorThread;
/// use regiongc::types::ObjRef;
///
/// let thread = MutatorThread::new(42);
/// let slot = thread.push_root(ObjRef::from_raw(0x1000_0000));
/// assert_eq!(thread.root(slot), ObjRef::from_raw(0x1000_0000));
/// assert_eq!(thread.clone().id(), 42);
/// ```
#[derive(Clone)]
pub struct MutatorThread {
    inner: Arc<MutatorInner>,
}

impl MutatorThread {
    pub fn new(id: usize) -> Self {
        Self {
            inner: Arc::new(MutatorInner::new(id)),
        }
    }

    fn from_inner(inner: Arc<MutatorInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn state(&self) -> ThreadState {
        *self.inner.state.lock()
    }

    /// Safepoint poll. Runs queued handshakes and parks while a safepoint is
    /// requested.
    pub fn poll_safepoint(&self) {
        if !self.inner.safepoint_requested.load(Ordering::Acquire)
            && !self.inner.handshake_pending.load(Ordering::Acquire)
        {
            return;
        }
        let mut state = self.inner.state.lock();
        self.run_pending_handshakes();
        if self.inner.safepoint_requested.load(Ordering::Acquire) {
            *state = ThreadState::Parked;
            self.inner.cv.notify_all();
            while self.inner.safepoint_requested.load(Ordering::Acquire) {
                self.inner.cv.wait(&mut state);
            }
            *state = ThreadState::Running;
        }
    }

    /// Leave managed code. The collector may now act on this thread's behalf.
    pub fn block(&self) {
        let mut state = self.inner.state.lock();
        self.run_pending_handshakes();
        *state = ThreadState::Blocked;
        self.inner.cv.notify_all();
    }

    /// Re-enter managed code, waiting out any safepoint in progress.
    pub fn unblock(&self) {
        let mut state = self.inner.state.lock();
        while self.inner.safepoint_requested.load(Ordering::Acquire) {
            self.inner.cv.wait(&mut state);
        }
        *state = ThreadState::Running;
    }

    fn run_pending_handshakes(&self) {
        let drained: Vec<PendingHandshake> = {
            let mut pending = self.inner.pending.lock();
            self.inner.handshake_pending.store(false, Ordering::Release);
            pending.drain(..).collect()
        };
        for handshake in drained {
            (handshake.op)(self);
            let _ = handshake.done.send(());
        }
    }

    /// Run `op` for this thread. A thread outside managed code has it run
    /// right here; a running thread gets it queued for its next poll and
    /// signals `done` when finished. Returns true when queued.
    pub(crate) fn handshake(&self, op: &HandshakeOp, done: &Sender<()>) -> bool {
        let state = self.inner.state.lock();
        match *state {
            ThreadState::Running => {
                self.inner.pending.lock().push_back(PendingHandshake {
                    op: Arc::clone(op),
                    done: done.clone(),
                });
                self.inner.handshake_pending.store(true, Ordering::Release);
                true
            }
            ThreadState::Blocked | ThreadState::Parked => {
                op(self);
                drop(state);
                false
            }
        }
    }

    pub(crate) fn request_safepoint(&self) {
        self.inner.safepoint_requested.store(true, Ordering::Release);
    }

    pub(crate) fn clear_safepoint(&self) {
        let _state = self.inner.state.lock();
        self.inner.safepoint_requested.store(false, Ordering::Release);
        self.inner.cv.notify_all();
    }

    /// Wait until the thread is parked or blocked. False on timeout.
    pub(crate) fn wait_until_safe(&self, deadline: Instant) -> bool {
        let mut state: MutexGuard<'_, ThreadState> = self.inner.state.lock();
        while *state == ThreadState::Running {
            if self.inner.cv.wait_until(&mut state, deadline).timed_out() {
                return *state != ThreadState::Running;
            }
        }
        true
    }

    // ---- stack roots ----

    /// Push a stack slot holding `obj` and return its index.
    pub fn push_root(&self, obj: Option<ObjRef>) -> usize {
        let mut stack = self.inner.stack.write();
        stack.push(AtomicUsize::new(ObjRef::encode(obj)));
        stack.len() - 1
    }

    pub fn root(&self, index: usize) -> Option<ObjRef> {
        self.inner
            .stack
            .read()
            .get(index)
            .and_then(|s| ObjRef::from_raw(s.load(Ordering::Acquire)))
    }

    pub fn set_root(&self, index: usize, obj: Option<ObjRef>) {
        if let Some(slot) = self.inner.stack.read().get(index) {
            slot.store(ObjRef::encode(obj), Ordering::Release);
        }
    }

    pub fn pop_root(&self) -> Option<ObjRef> {
        self.inner
            .stack
            .write()
            .pop()
            .and_then(|s| ObjRef::from_raw(s.into_inner()))
    }

    pub fn stack_roots(&self) -> Vec<ObjRef> {
        self.inner
            .stack
            .read()
            .iter()
            .filter_map(|s| ObjRef::from_raw(s.load(Ordering::Acquire)))
            .collect()
    }

    pub fn stack_slots_do(&self, mut f: impl FnMut(&AtomicUsize)) {
        for slot in self.inner.stack.read().iter() {
            f(slot);
        }
    }
}

impl fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MutatorThread").field(&self.id()).finish()
    }
}

#[derive(Clone, Default)]
pub struct ThreadRegistry {
    mutators: Arc<Mutex<Vec<Arc<MutatorInner>>>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, thread: MutatorThread) {
        let mut mutators = self.mutators.lock();
        if mutators
            .iter()
            .any(|existing| existing.id == thread.inner.id)
        {
            return;
        }
        mutators.push(thread.inner);
    }

    pub fn iter(&self) -> Vec<MutatorThread> {
        self.mutators
            .lock()
            .iter()
            .cloned()
            .map(MutatorThread::from_inner)
            .collect()
    }

    /// Remove a mutator. It runs any queued handshake first.
    pub fn unregister(&self, id: usize) {
        let removed = {
            let mut mutators = self.mutators.lock();
            let pos = mutators.iter().position(|inner| inner.id == id);
            pos.map(|pos| mutators.remove(pos))
        };
        if let Some(inner) = removed {
            MutatorThread::from_inner(inner).block();
        }
    }

    pub fn get(&self, id: usize) -> Option<MutatorThread> {
        self.mutators
            .lock()
            .iter()
            .find(|inner| inner.id == id)
            .cloned()
            .map(MutatorThread::from_inner)
    }

    pub fn len(&self) -> usize {
        self.mutators.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask every mutator to park and wait until all are safe.
    pub(crate) fn stop_all(&self, timeout: Duration) -> bool {
        let threads = self.iter();
        for thread in &threads {
            thread.request_safepoint();
        }
        let deadline = Instant::now() + timeout;
        threads.iter().all(|t| t.wait_until_safe(deadline))
    }

    pub(crate) fn resume_all(&self) {
        for thread in self.iter() {
            thread.clear_safepoint();
        }
    }
}

impl fmt::Debug for ThreadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadRegistry")
            .field("mutators", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn registering_twice_keeps_one_entry() {
        let registry = ThreadRegistry::new();
        let thread = MutatorThread::new(7);
        registry.register(thread.clone());
        registry.register(thread);
        assert_eq!(registry.len(), 1);
        registry.unregister(7);
        assert!(registry.get(7).is_none());
    }

    #[test]
    fn blocked_threads_count_as_stopped() {
        let registry = ThreadRegistry::new();
        registry.register(MutatorThread::new(1));
        assert!(registry.stop_all(Duration::from_millis(50)));
        registry.resume_all();
    }

    #[test]
    fn running_thread_parks_at_poll() {
        let registry = ThreadRegistry::new();
        let mutator = MutatorThread::new(1);
        registry.register(mutator.clone());
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

        assert!(registry.stop_all(Duration::from_secs(5)));
        assert_eq!(mutator.state(), ThreadState::Parked);
        registry.resume_all();
        stop.store(true, Ordering::Release);
        worker.join().unwrap();
        assert_eq!(mutator.state(), ThreadState::Blocked);
    }

    #[test]
    fn running_thread_without_poll_times_out() {
        let registry = ThreadRegistry::new();
        let mutator = MutatorThread::new(1);
        registry.register(mutator.clone());
        mutator.unblock();
        assert!(!registry.stop_all(Duration::from_millis(20)));
        registry.resume_all();
    }

    #[test]
    fn stack_roots_skip_null_slots() {
        let thread = MutatorThread::new(1);
        thread.push_root(ObjRef::from_raw(0x100));
        let idx = thread.push_root(None);
        assert_eq!(thread.stack_roots().len(), 1);
        thread.set_root(idx, ObjRef::from_raw(0x200));
        assert_eq!(thread.stack_roots().len(), 2);
        assert_eq!(thread.pop_root(), ObjRef::from_raw(0x200));
    }
}
