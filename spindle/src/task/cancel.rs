use crate::task::{TaskContext, TaskId, current};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Why a task was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CancellationReason {
    /// Not cancelled.
    #[default]
    None = 0,

    /// Explicit request through a task handle or token.
    UserRequest = 1,

    /// The task deadline was reached.
    Deadline = 2,

    /// The task processor shed load because its queue was full, or could not
    /// allocate a coroutine for the task.
    Overload = 3,

    /// The owning handle was dropped before the task finished.
    Abandoned = 4,

    /// The task processor is shutting down.
    Shutdown = 5,
}

impl CancellationReason {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => CancellationReason::None,
            1 => CancellationReason::UserRequest,
            2 => CancellationReason::Deadline,
            3 => CancellationReason::Overload,
            4 => CancellationReason::Abandoned,
            5 => CancellationReason::Shutdown,
            _ => unreachable!("invalid cancellation reason {val}"),
        }
    }

    pub fn is_cancelled(self) -> bool {
        self != CancellationReason::None
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancellationReason::None => "not cancelled",
            CancellationReason::UserRequest => "user request",
            CancellationReason::Deadline => "deadline",
            CancellationReason::Overload => "overload",
            CancellationReason::Abandoned => "task handle dropped",
            CancellationReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Holds the first cancellation reason ever set. Later requests are ignored.
#[derive(Debug)]
pub(crate) struct AtomicCancellationReason(AtomicU8);

impl AtomicCancellationReason {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(CancellationReason::None as u8))
    }

    #[inline]
    pub(crate) fn load(&self) -> CancellationReason {
        CancellationReason::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Returns `true` if this call recorded the reason.
    pub(crate) fn try_set(&self, reason: CancellationReason) -> bool {
        debug_assert!(reason.is_cancelled());
        self.0
            .compare_exchange(
                CancellationReason::None as u8,
                reason as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Panic payload used to unwind a cancelled task's stack. Caught by the
/// coroutine running the task, never observed by user code.
pub(crate) struct CoroUnwinder;

/// Unwinds the current task's stack. Destructors of every frame run.
pub(crate) fn unwind_cancelled() -> ! {
    std::panic::resume_unwind(Box::new(CoroUnwinder))
}

/// Makes the current task non-cancellable until dropped.
///
/// Cancellation requests arriving while the blocker is alive are latched: the
/// reason is recorded and delivered at the first cancellable suspension point
/// after the blocker is dropped. Blocking calls made under a blocker only wake
/// up on their own condition or deadline.
///
/// # Panics
///
/// Panics if created outside of a task.
#[must_use = "cancellation is only blocked while the guard is alive"]
pub struct CancellationBlocker {
    ctx: Arc<TaskContext>,
    was_cancellable: bool,
}

impl CancellationBlocker {
    #[track_caller]
    pub fn new() -> Self {
        let ctx = current::expect_current("CancellationBlocker::new");
        let was_cancellable = ctx.set_cancellable(false);
        Self {
            ctx,
            was_cancellable,
        }
    }
}

impl Default for CancellationBlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationBlocker {
    fn drop(&mut self) {
        self.ctx.set_cancellable(self.was_cancellable);
    }
}

impl fmt::Debug for CancellationBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationBlocker")
            .field("task_id", &self.ctx.id())
            .field("was_cancellable", &self.was_cancellable)
            .finish()
    }
}

/// A cloneable handle that can cancel a task without owning its result.
#[derive(Clone)]
pub struct TaskCancellationToken {
    ctx: Arc<TaskContext>,
}

impl TaskCancellationToken {
    pub(crate) fn new(ctx: Arc<TaskContext>) -> Self {
        Self { ctx }
    }

    pub fn task_id(&self) -> TaskId {
        self.ctx.id()
    }

    /// Requests cancellation with [`CancellationReason::UserRequest`].
    pub fn request_cancel(&self) {
        self.ctx.request_cancel(CancellationReason::UserRequest);
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.ctx.is_cancel_requested()
    }

    pub fn cancellation_reason(&self) -> CancellationReason {
        self.ctx.cancellation_reason()
    }
}

impl fmt::Debug for TaskCancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCancellationToken")
            .field("task_id", &self.ctx.id())
            .field("reason", &self.ctx.cancellation_reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    assert_impl_all!(TaskCancellationToken: Send, Sync, Clone);
    assert_not_impl_any!(CancellationBlocker: Clone);

    #[test]
    fn test_first_reason_wins() {
        let reason = AtomicCancellationReason::new();
        assert_eq!(reason.load(), CancellationReason::None);

        assert!(reason.try_set(CancellationReason::Deadline));
        assert!(!reason.try_set(CancellationReason::Shutdown));
        assert_eq!(reason.load(), CancellationReason::Deadline);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(CancellationReason::Abandoned.to_string(), "task handle dropped");
        assert!(!CancellationReason::None.is_cancelled());
        assert!(CancellationReason::Overload.is_cancelled());
    }
}
