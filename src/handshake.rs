// Thread-local handshakes: run a closure once for every mutator without a
// global pause. Threads outside managed code have it run on their behalf;
// running threads run it at their next poll.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use flume::RecvTimeoutError;
use log::debug;

use crate::{
    error::{GcError, GcResult},
    thread::{HandshakeOp, MutatorThread, ThreadRegistry},
};

/// How a handshake reached each thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeStats {
    pub executed_by_requester: usize,
    pub executed_by_threads: usize,
}

impl HandshakeStats {
    pub fn total(&self) -> usize {
        self.executed_by_requester + self.executed_by_threads
    }
}

pub struct HandshakeCoordinator<'a> {
    threads: &'a ThreadRegistry,
    timeout: Duration,
}

impl<'a> HandshakeCoordinator<'a> {
    pub fn new(threads: &'a ThreadRegistry, timeout: Duration) -> Self {
        Self { threads, timeout }
    }

    /// Run `op` once for every registered mutator and wait for all of them.
    pub fn execute<F>(&self, name: &str, op: F) -> GcResult<HandshakeStats>
    where
        F: Fn(&MutatorThread) + Send + Sync + 'static,
    {
        let op: HandshakeOp = Arc::new(op);
        let (done_tx, done_rx) = flume::unbounded();
        let mut stats = HandshakeStats::default();

        for thread in self.threads.iter() {
            if thread.handshake(&op, &done_tx) {
                stats.executed_by_threads += 1;
            } else {
                stats.executed_by_requester += 1;
            }
        }
        drop(done_tx);

        let deadline = Instant::now() + self.timeout;
        for acknowledged in 0..stats.executed_by_threads {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match done_rx.recv_timeout(remaining) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => {
                    return Err(GcError::HandshakeFailed(format!(
                        "{name}: {acknowledged} of {} threads acknowledged",
                        stats.executed_by_threads
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(GcError::HandshakeFailed(format!(
                        "{name}: threads exited before acknowledging"
                    )));
                }
            }
        }

        debug!(
            "Handshake {name}: {} threads ({} on their behalf)",
            stats.total(),
            stats.executed_by_requester
        );
        Ok(stats)
    }

    /// Empty handshake. Returns once every mutator has passed a poll or is
    /// outside managed code, so none can still act on stale state.
    pub fn rendezvous(&self) -> GcResult<HandshakeStats> {
        self.execute("Rendezvous", |_| {})
    }
}
