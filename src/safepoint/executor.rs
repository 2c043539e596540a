//! The VM thread and its submission channel.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use flume::{Receiver, Sender};
use log::{debug, error, trace};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use super::operation::{Completion, SafepointOperation};
use crate::{
    error::{GcError, GcResult},
    thread::ThreadRegistry,
};

/// Safepoint statistics
#[derive(Debug, Clone, Default)]
pub struct SafepointStats {
    pub total_operations: usize,
    /// Time spent bringing mutators to a stop.
    pub total_sync_time: Duration,
    /// Time spent inside operations.
    pub total_op_time: Duration,
    pub max_pause: Duration,
    pub timeouts: usize,
}

struct Shared {
    threads: Arc<ThreadRegistry>,
    timeout: Duration,
    at_safepoint: AtomicBool,
    vm_thread: OnceCell<ThreadId>,
    stats: Mutex<SafepointStats>,
}

pub struct SafepointExecutor {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<SafepointOperation>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SafepointExecutor {
    /// Spawn the VM thread.
    pub fn start(threads: Arc<ThreadRegistry>, timeout: Duration) -> GcResult<Self> {
        let shared = Arc::new(Shared {
            threads,
            timeout,
            at_safepoint: AtomicBool::new(false),
            vm_thread: OnceCell::new(),
            stats: Mutex::new(SafepointStats::default()),
        });
        let (sender, receiver) = flume::unbounded();
        let vm_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("vm-safepoint".into())
            .spawn(move || vm_loop(vm_shared, receiver))
            .map_err(|e| GcError::WorkerPool(format!("cannot spawn VM thread: {e}")))?;
        let _ = shared.vm_thread.set(handle.thread().id());
        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Run `op` at a safepoint and wait for it. A panic inside `op` is
    /// resumed on the caller.
    pub fn execute<F>(&self, name: &'static str, op: F) -> GcResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_vm_thread() {
            // Already stopped; nested operations run in place.
            op();
            return Ok(());
        }
        let (reply_tx, reply_rx) = flume::bounded(1);
        let request = SafepointOperation::new(name, Box::new(op), reply_tx);
        {
            let sender = self.sender.lock();
            let sender = sender.as_ref().ok_or(GcError::SafepointExecutorGone)?;
            sender
                .send(request)
                .map_err(|_| GcError::SafepointExecutorGone)?;
        }
        match reply_rx.recv() {
            Ok(Completion::Done) => Ok(()),
            Ok(Completion::TimedOut) => Err(GcError::SafepointTimeout { operation: name }),
            Ok(Completion::Panicked(payload)) => panic::resume_unwind(payload),
            Err(_) => Err(GcError::SafepointExecutorGone),
        }
    }

    /// True while a stop-the-world operation body runs.
    pub fn is_at_safepoint(&self) -> bool {
        self.shared.at_safepoint.load(Ordering::Acquire)
    }

    pub fn is_vm_thread(&self) -> bool {
        self.shared.vm_thread.get() == Some(&thread::current().id())
    }

    pub fn stats(&self) -> SafepointStats {
        self.shared.stats.lock().clone()
    }

    /// Stop accepting operations and join the VM thread.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        if self.is_vm_thread() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("VM thread exited with a panic");
            }
        }
    }
}

impl Drop for SafepointExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn vm_loop(shared: Arc<Shared>, receiver: Receiver<SafepointOperation>) {
    for request in receiver.iter() {
        let (name, body, reply) = request.into_parts();
        let completion = run_at_safepoint(&shared, name, body);
        let _ = reply.send(completion);
    }
    trace!("VM thread exiting");
}

fn run_at_safepoint(shared: &Shared, name: &'static str, body: Box<dyn FnOnce() + Send>) -> Completion {
    let sync_start = Instant::now();
    if !shared.threads.stop_all(shared.timeout) {
        shared.threads.resume_all();
        error!("Safepoint {name}: mutators did not stop within {:?}", shared.timeout);
        shared.stats.lock().timeouts += 1;
        return Completion::TimedOut;
    }
    let sync_time = sync_start.elapsed();

    shared.at_safepoint.store(true, Ordering::Release);
    let op_start = Instant::now();
    let result = panic::catch_unwind(AssertUnwindSafe(body));
    let op_time = op_start.elapsed();
    shared.at_safepoint.store(false, Ordering::Release);
    shared.threads.resume_all();

    {
        let mut stats = shared.stats.lock();
        stats.total_operations += 1;
        stats.total_sync_time += sync_time;
        stats.total_op_time += op_time;
        stats.max_pause = stats.max_pause.max(sync_time + op_time);
    }
    debug!("Safepoint {name}: sync {sync_time:?}, op {op_time:?}");

    match result {
        Ok(()) => Completion::Done,
        Err(payload) => Completion::Panicked(payload),
    }
}
