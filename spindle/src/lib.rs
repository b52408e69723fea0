//! A task processor running many cooperative tasks on stackful coroutines
//! over a few OS threads.
//!
//! Task bodies are plain closures. Blocking calls from a task (locking a
//! [`sync::Mutex`], waiting on a [`sync::ConditionVariable`], joining another
//! task, [`sleep_for`]) suspend the task and let its worker thread run other
//! tasks. Every blocking call takes a [`Deadline`] and observes cooperative
//! cancellation.
//!
//! ```no_run
//! use spindle::runtime::Builder;
//! use std::time::Duration;
//!
//! let processor = Builder::new().worker_threads(4).try_build().unwrap();
//!
//! let answer = processor.block_on(|| {
//!     let task = spindle::spawn(|| {
//!         spindle::sleep_for(Duration::from_millis(10)).unwrap();
//!         42
//!     });
//!     task.get().unwrap()
//! });
//! assert_eq!(answer, 42);
//! ```

#[doc(inline)]
pub use spindle_macros::main;

#[doc(inline)]
pub use spindle_macros::test;

mod coro;
pub use coro::CoroutinePoolStats;

pub mod current_task;

mod deadline;
pub use deadline::Deadline;

pub mod error;
pub use error::{
    EngineError, FutureError, IoError, JoinError, PanicPayload, WaitError, WaitInterrupted,
};

pub mod runtime;
pub use runtime::{TaskProcessor, spawn, spawn_builder, spawn_critical};

mod sleep;
pub use sleep::{
    sleep_for, sleep_until, uninterruptible_sleep_for, uninterruptible_sleep_until, yield_now,
};

pub mod sync;

pub mod task;
pub use task::{SharedTaskWithResult, TaskWithResult};

mod utils;

mod wait;

#[cfg(test)]
mod test_utils;
