//! Stop-the-world execution.
//!
//! Every pause runs on one dedicated VM thread. A submitter hands a named
//! operation to [`SafepointExecutor::execute`] and blocks until the VM thread
//! has stopped all mutators, run the operation and resumed them. Operations
//! never overlap, and an operation that panics has its panic re-raised on the
//! submitting thread.
//!
//! ## Usage
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use regiongc::safepoint::SafepointExecutor;
//! use regiongc::thread::ThreadRegistry;
//!
//! let executor =
//!     SafepointExecutor::start(Arc::new(ThreadRegistry::new()), Duration::from_secs(1)).unwrap();
//! executor.execute("Noop", || {}).unwrap();
//! assert_eq!(executor.stats().total_operations, 1);
//! ```

mod executor;
mod operation;

#[cfg(test)]
mod tests;

pub use executor::{SafepointExecutor, SafepointStats};
pub use operation::SafepointOperation;
