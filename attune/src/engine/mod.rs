//! The reconciliation engine: vertex state machines, edge semaphores, and
//! the executor that supervises them.
//!
//! Ordering guarantees, in channel terms:
//!
//! 1. Within one vertex, events are processed strictly sequentially by its
//!    process task.
//! 2. Between vertices, an edge semaphore imposes happens-before from a
//!    predecessor's apply completion to the successor's apply start.
//! 3. Acknowledged control events (Pause, Exit) are global fences: the
//!    sender observes that every target completed the transition.

mod executor;
mod semaphore;
mod vertex;

pub use executor::{EngineError, GraphExecutor, SwapReport};
pub use semaphore::EdgeSemaphore;
