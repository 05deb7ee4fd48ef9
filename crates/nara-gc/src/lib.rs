//! Nara VM memory subsystem
//!
//! This crate is the runtime's garbage collector: immediate reference
//! counting reclaims acyclic garbage the moment its last stored reference
//! is dropped, and a lazy, incremental tracing pass reclaims the reference
//! cycles counting alone cannot free. Collection never stops the world;
//! each [`Collector::step`] performs one bounded unit of work, interleaved
//! with mutator progress.
//!
//! # Architecture
//!
//! The collector consists of several components:
//!
//! - **[`Handle`]**: generational reference to a cell in the slot arena
//! - **[`Trace`] / [`Visitor`]**: link enumeration, the one capability the
//!   embedder's object model must provide
//! - **[`CellState`]**: lifecycle stage, derived from interest-set
//!   membership
//! - **[`Collector`]**: the interest sets, the step algorithm, and the
//!   mutator-facing API
//!
//! # Interest sets
//!
//! Every live cell occupies exactly one set; the set is the cell's stage:
//!
//! ```text
//! Free             reclaimed, available for reuse
//! RootUnprocessed  locked root not yet traced this epoch
//! RootProcessed    locked root already traced this epoch
//! Boundary         referenced cell awaiting its children
//! Reachable        traced and confirmed reachable this epoch
//! Unprocessed      not yet proven reachable this epoch
//! FreePending      refcount hit zero; outgoing references still to release
//! ```
//!
//! The reachable/unprocessed roles alternate between two physical sets at
//! every epoch reset (the color flip), as do the two root sets, so ending
//! an epoch moves no cells.
//!
//! # Example
//!
//! ```
//! use nara_gc::{Collector, Handle, Trace, Visitor};
//!
//! enum Datum {
//!     Number(f64),
//!     Pair(Option<Handle>, Option<Handle>),
//! }
//!
//! impl Trace for Datum {
//!     fn trace(&self, visitor: &mut Visitor<'_>) {
//!         if let Datum::Pair(car, cdr) = self {
//!             for link in [car, cdr] {
//!                 if let Some(handle) = link {
//!                     visitor.visit(*handle);
//!                 }
//!             }
//!         }
//!     }
//! }
//!
//! let mut gc = Collector::new();
//!
//! // A pair the interpreter holds on its stack.
//! let head = gc.alloc(Datum::Pair(None, None))?;
//! gc.lock(head);
//!
//! // Store a number into its car, reporting the new link.
//! let n = gc.alloc(Datum::Number(42.0))?;
//! *gc.get_mut(head) = Datum::Pair(Some(n), None);
//! gc.advise_new_link(n);
//!
//! // Interleave collection work with mutator progress.
//! gc.step();
//!
//! // Dropping the stack slot lets the whole structure go.
//! gc.unlock(head);
//! gc.run_to_quiescence();
//! assert!(!gc.is_live(head));
//! assert!(!gc.is_live(n));
//! # Ok::<(), nara_gc::GcError>(())
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod collector;
mod header;
mod heap;
mod list;
mod trace;

pub use collector::{Collector, GcStats, HeapStats};
pub use header::{CellState, Handle};
pub use trace::{Trace, Visitor};

/// Memory subsystem errors.
///
/// Contract violations (unlocking a non-root, linking to a reclaimed cell,
/// tracing into a free slot) are not represented here: they are programmer
/// errors in the embedder and fail hard, because the collector does not
/// attempt to run on a corrupted heap. Exhausting the configured arena
/// limit is the one recoverable failure.
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    /// The arena reached its configured cell limit.
    #[error("heap exhausted: cell limit of {limit} reached")]
    OutOfMemory {
        /// The configured maximum number of cells.
        limit: usize,
    },
}

/// Result alias for collector operations.
pub type GcResult<T> = Result<T, GcError>;
