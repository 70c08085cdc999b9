//! Synchronization primitives shared by every stage of the acquisition
//! pipeline.
//!
//! Stages never share mutable state directly. They hand work to each other
//! through a [SynchronizedQueue] and guard shared objects (such as a camera
//! handle) with a [SynchronizedValue]. Long-lived stage threads are owned by a
//! [WorkerPool], which hands each task a [thread_control::Flag]. A stage is
//! shut down by stopping its flag and then waking the queue it may be parked
//! on with [SynchronizedQueue::signal_not_empty].

mod pool;
mod queue;
mod value;

pub use pool::{PoolError, WorkerPool};
pub use queue::{QueueGuard, SynchronizedQueue};
pub use value::SynchronizedValue;

/// Upper bound on the number of long-lived worker threads in one pool.
pub const MAX_THREAD_COUNT: usize = 16;
