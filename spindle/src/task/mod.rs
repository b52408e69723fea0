//! Tasks: logical units of work running on stackful coroutines.
//!
//! Most users only need [`TaskWithResult`], returned by every spawn function,
//! and the cancellation types. The functions acting on the *current* task
//! live in [`current_task`](crate::current_task).

// Public API
mod cancel;
pub use self::cancel::{CancellationBlocker, CancellationReason, TaskCancellationToken};
pub(crate) use self::cancel::unwind_cancelled;

mod handle;
pub use self::handle::TaskWithResult;

mod id;
pub use self::id::{TaskId, id, try_id};

mod local;
pub use self::local::TaskLocalKey;

mod shared;
pub use self::shared::SharedTaskWithResult;

mod state;
pub use self::state::TaskState;

pub use crate::error::JoinError;

// Internals
pub(crate) mod context;
pub(crate) use self::context::TaskContext;

pub(crate) mod current;

pub(crate) mod sleep_state;
