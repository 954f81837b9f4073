//! Capacity-bounded FIFO buffers shared between the fetch orchestrator, the
//! block fetch task, and the dispatch loop.

pub mod bounded;

pub use bounded::{BoundedBuffer, BufferError};
