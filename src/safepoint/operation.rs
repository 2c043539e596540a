//! Requests sent to the VM thread.

use std::{any::Any, fmt};

use flume::Sender;

pub(super) type PanicPayload = Box<dyn Any + Send + 'static>;

/// What the VM thread reports back for one operation.
pub(super) enum Completion {
    Done,
    TimedOut,
    Panicked(PanicPayload),
}

/// A named stop-the-world operation and the channel its completion goes to.
pub struct SafepointOperation {
    name: &'static str,
    body: Box<dyn FnOnce() + Send + 'static>,
    pub(super) reply: Sender<Completion>,
}

impl SafepointOperation {
    pub(super) fn new(
        name: &'static str,
        body: Box<dyn FnOnce() + Send + 'static>,
        reply: Sender<Completion>,
    ) -> Self {
        Self { name, body, reply }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(super) fn into_parts(self) -> (&'static str, Box<dyn FnOnce() + Send>, Sender<Completion>) {
        (self.name, self.body, self.reply)
    }
}

impl fmt::Debug for SafepointOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafepointOperation")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
