//! Error types for the collector.

use thiserror::Error;

use crate::types::DegenPoint;

/// Errors that can occur while building or driving the collector.
///
/// Cancellation of a concurrent cycle is not an error: it is reported as a
/// degeneration point. These variants cover construction, configuration and
/// allocation failures.
///
/// # Examples
///
/// ```
/// use regiongc::error::{GcError, GcResult};
///
/// let oom: GcResult<()> = Err(GcError::OutOfMemory { requested: 64 });
/// assert!(oom.is_err());
/// assert_eq!(
///     GcError::OutOfMemory { requested: 64 }.to_string(),
///     "Out of memory allocating 64 bytes"
/// );
/// ```
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GcError {
    /// Allocation could not be satisfied from the free set
    #[error("Out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },
    /// Address does not name a live heap object
    #[error("Invalid object reference {0:#x}")]
    InvalidObject(usize),
    /// Field index outside the object
    #[error("Field {index} out of bounds for object {object:#x}")]
    FieldOutOfBounds { object: usize, index: usize },
    /// Configuration value rejected by validation
    #[error("Invalid option {name}={value}")]
    InvalidOption { name: &'static str, value: String },
    /// Worker pool could not be created
    #[error("Worker pool error: {0}")]
    WorkerPool(String),
    /// Safepoint executor thread is gone
    #[error("Safepoint executor is not running")]
    SafepointExecutorGone,
    /// Mutators did not reach the safepoint in time
    #[error("Safepoint {operation} timed out waiting for mutators")]
    SafepointTimeout { operation: &'static str },
    /// Thread handshake did not complete
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    /// Concurrent cycle cancelled and handed to fallback
    #[error("Cycle degenerated at {0}")]
    Degenerated(DegenPoint),
}

/// Result type for collector operations
pub type GcResult<T> = Result<T, GcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_readable_messages() {
        let cases = [
            (
                GcError::OutOfMemory { requested: 16 },
                "Out of memory allocating 16 bytes",
            ),
            (GcError::InvalidObject(0x10), "Invalid object reference 0x10"),
            (
                GcError::FieldOutOfBounds {
                    object: 0x20,
                    index: 3,
                },
                "Field 3 out of bounds for object 0x20",
            ),
            (
                GcError::InvalidOption {
                    name: "region_size",
                    value: "0".into(),
                },
                "Invalid option region_size=0",
            ),
            (
                GcError::WorkerPool("spawn".into()),
                "Worker pool error: spawn",
            ),
            (
                GcError::SafepointExecutorGone,
                "Safepoint executor is not running",
            ),
            (
                GcError::SafepointTimeout {
                    operation: "Init Mark",
                },
                "Safepoint Init Mark timed out waiting for mutators",
            ),
            (
                GcError::Degenerated(DegenPoint::Evac),
                "Cycle degenerated at Evacuation",
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn gc_result_alias_behaves_like_result() {
        fn take_result(value: GcResult<usize>) -> usize {
            value.unwrap_or_default()
        }

        assert_eq!(take_result(Ok(42)), 42);
        assert_eq!(take_result(Err(GcError::OutOfMemory { requested: 8 })), 0);
    }
}
