//! Blocking synchronization primitives for tasks.
//!
//! Blocking suspends the calling task and frees its worker thread for other
//! tasks. Every blocking call can be bounded by a
//! [`Deadline`](crate::Deadline) and returns early when the calling task is
//! cancelled, unless it is explicitly uninterruptible.
mod condvar;
pub use condvar::{ConditionVariable, CvStatus};

mod event;
pub use event::SingleConsumerEvent;

mod future;
pub use future::{Future, FutureStatus, Promise};

mod mutex;
pub use mutex::{Mutex, MutexGuard};

mod semaphore;
pub use semaphore::{Semaphore, SemaphorePermit};

mod single_waiter;
pub use single_waiter::{SingleWaiterMutex, SingleWaiterMutexGuard};
