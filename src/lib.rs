//! Concurrent cycle orchestration for a region-based, concurrent-evacuating
//! garbage collector.
//!
//! A [`heap::Heap`] is collected one generation at a time by a
//! [`cycle::ConcurrentGc`], which marks, evacuates and updates references
//! while mutators keep running, stopping them only for five short pauses. A
//! cycle that gets cancelled records where it stopped and is finished by the
//! [`degenerated::DegeneratedGc`]. [`control::GcController`] ties the two
//! together and reports through [`monitoring`].
//!
//! ```
//! use regiongc::control::{CycleOutcome, GcController};
//! use regiongc::heap::HeapBuilder;
//! use regiongc::options::GcOptions;
//! use regiongc::types::{Affiliation, GcCause, GenerationMode};
//!
//! let heap = HeapBuilder::new(GcOptions::default().with_region_count(8))
//!     .build()
//!     .unwrap();
//! let obj = heap.allocate(Affiliation::Young, 1).unwrap();
//! let root = heap.roots().vm_strong().allocate(Some(obj));
//!
//! let controller = GcController::new(heap.clone());
//! let outcome = controller
//!     .run_cycle(GcCause::Explicit, GenerationMode::Global)
//!     .unwrap();
//! assert_eq!(outcome, CycleOutcome::Concurrent);
//! assert!(heap.roots().vm_strong().get(root).is_some());
//! ```

pub mod control;
pub mod cycle;
pub mod degenerated;
pub mod error;
pub mod fault;
pub mod generation;
pub mod handshake;
pub mod heap;
pub mod interfaces;
pub mod logger;
pub mod mark;
pub mod monitoring;
pub mod options;
pub mod phase;
pub mod reference;
pub mod roots;
pub mod safepoint;
pub mod test_utils;
pub mod thread;
pub mod types;
pub mod verifier;
pub mod workers;

pub use control::{CycleOutcome, GcController};
pub use cycle::ConcurrentGc;
pub use error::{GcError, GcResult};
pub use heap::{Heap, HeapBuilder};
pub use options::GcOptions;
