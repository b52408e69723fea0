use crate::task::current;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque ID that uniquely identifies a task for the lifetime of the
/// process.
///
/// # Notes
///
/// - Task IDs are allocated from a process-wide counter, they are unique
///   across all task processors.
/// - The ID of the running task can be obtained from inside the task via
///   [`task::id()`](crate::task::id()) and from outside via
///   [`TaskWithResult::id()`](crate::task::TaskWithResult::id()).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct TaskId(NonZeroU64);

/// Returns the [`TaskId`] of the currently running task.
///
/// # Panics
///
/// Panics if called from outside a task.
#[track_caller]
pub fn id() -> TaskId {
    try_id().expect("can't get a task id when not inside a task")
}

/// Returns the [`TaskId`] of the currently running task, or `None` if called
/// outside of a task.
pub fn try_id() -> Option<TaskId> {
    current::with_current(|ctx| ctx.id())
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl TaskId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // The mutex owner word stores `id << 1`, so the top bit must stay free.
        match NonZeroU64::new(id) {
            Some(id) if id.get() < (1 << 63) => Self(id),
            _ => Self::exhausted(),
        }
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0.get()
    }

    /// Get a unique task tracing Id to be used with tracing library.
    pub(crate) fn as_tracing_id(&self) -> tracing::Id {
        tracing::Id::from_non_zero_u64(self.0)
    }
}
