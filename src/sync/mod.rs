//! Synchronization and waiting support
//!
//! - [`CriticalSectionCell`]: ISR-safe interior mutability for every piece of
//!   state shared between tasks and the bus interrupt handler
//! - `BoundedQueue`: the per-device pending/completed FIFOs
//! - [`Timeout`]: how long a task-side call may block

mod primitives;
pub(crate) mod queue;
mod wait;

pub use primitives::CriticalSectionCell;
pub use wait::Timeout;

pub(crate) use queue::BoundedQueue;
pub(crate) use wait::wait_for;
