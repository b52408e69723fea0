use crate::deadline::Deadline;
use crate::error::{JoinError, PanicPayload, WaitError, WaitInterrupted};
use crate::task::sleep_state::WakeupSource;
use crate::task::{
    CancellationBlocker, CancellationReason, SharedTaskWithResult, TaskCancellationToken,
    TaskContext, TaskId, TaskState, current,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// An owned permission to join a task and collect its result.
///
/// The task started running as soon as it was spawned, whether or not the
/// handle is ever waited on.
///
/// Dropping a `TaskWithResult` of an unfinished task requests its cancellation
/// with [`CancellationReason::Abandoned`]. Call [`TaskWithResult::detach`] to
/// let the task run to completion instead.
///
/// Waiting from a task suspends that task. Waiting from any other thread
/// blocks the thread.
///
/// # Examples
///
/// ```no_run
/// use spindle::runtime::Builder;
///
/// let processor = Builder::new().worker_threads(2).try_build().unwrap();
///
/// let sum = processor.block_on(|| {
///     let tasks = (0..4).map(|i| spindle::spawn(move || i * 10)).collect::<Vec<_>>();
///     tasks.into_iter().map(|t| t.get().unwrap()).sum::<i32>()
/// });
/// assert_eq!(sum, 60);
/// ```
///
/// A panic in the task body is delivered to the joiner:
///
/// ```no_run
/// # let processor = spindle::runtime::Builder::new().try_build().unwrap();
/// let err = processor.spawn(|| panic!("boom")).get().unwrap_err();
/// assert!(err.is_panic());
/// assert_eq!(err.panic_message(), Some("boom"));
/// ```
#[must_use = "dropping the handle of an unfinished task cancels it"]
pub struct TaskWithResult<T> {
    // Only `None` once detached.
    ctx: Option<Arc<TaskContext>>,
    result: Arc<Mutex<Option<T>>>,
}

impl<T> TaskWithResult<T> {
    pub(crate) fn new(ctx: Arc<TaskContext>, result: Arc<Mutex<Option<T>>>) -> Self {
        Self {
            ctx: Some(ctx),
            result,
        }
    }

    fn ctx(&self) -> &Arc<TaskContext> {
        match &self.ctx {
            Some(ctx) => ctx,
            None => unreachable!("task handle used after detach"),
        }
    }

    pub fn id(&self) -> TaskId {
        self.ctx().id()
    }

    pub fn state(&self) -> TaskState {
        self.ctx().state()
    }

    pub fn is_finished(&self) -> bool {
        self.ctx().is_finished()
    }

    pub fn cancellation_reason(&self) -> CancellationReason {
        self.ctx().cancellation_reason()
    }

    /// Requests cancellation with [`CancellationReason::UserRequest`]. Does
    /// not wait for the task to notice.
    pub fn request_cancel(&self) {
        self.ctx().request_cancel(CancellationReason::UserRequest);
    }

    /// A handle that can cancel the task without owning its result.
    pub fn cancellation_token(&self) -> TaskCancellationToken {
        TaskCancellationToken::new(Arc::clone(self.ctx()))
    }

    /// Requests cancellation and waits until the task finished, ignoring
    /// cancellation of the waiting task.
    pub fn sync_cancel(&self) {
        self.request_cancel();

        if current::is_inside_task() {
            let _blocker = CancellationBlocker::new();
            let res = self.wait_inner(Deadline::never());
            debug_assert!(res.is_ok(), "non-cancellable wait failed: {res:?}");
        } else {
            self.ctx().wait_finished_blocking(Deadline::never());
        }
    }

    /// Waits until the task finished.
    ///
    /// Returns an error if the *waiting* task was cancelled first.
    pub fn wait(&self) -> Result<(), WaitInterrupted> {
        self.wait_inner(Deadline::never()).map_err(|e| match e {
            WaitError::Cancelled(reason) => WaitInterrupted::new(reason),
            WaitError::Timeout => unreachable!("wait without deadline timed out"),
        })
    }

    /// Waits until the task finished or `deadline` is reached.
    pub fn wait_until(&self, deadline: Deadline) -> Result<(), WaitError> {
        self.wait_inner(deadline)
    }

    /// Same as `wait_until(Deadline::from_duration(timeout))`.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), WaitError> {
        self.wait_inner(Deadline::from_duration(timeout))
    }

    fn wait_inner(&self, deadline: Deadline) -> Result<(), WaitError> {
        let target = self.ctx();

        let Some(waiter) = current::current() else {
            return if target.wait_finished_blocking(deadline) {
                Ok(())
            } else {
                Err(WaitError::Timeout)
            };
        };

        while !target.is_finished() {
            match target.wait_finished(&waiter, deadline) {
                WakeupSource::DeadlineTimer if !target.is_finished() => {
                    return Err(WaitError::Timeout);
                }
                WakeupSource::CancelRequest if !target.is_finished() => {
                    return Err(WaitError::Cancelled(waiter.cancellation_reason()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Waits for the task and returns its result.
    ///
    /// # Errors
    ///
    /// - [`JoinError::Panic`] if the task body panicked.
    /// - [`JoinError::Cancelled`] if the task finished without producing a
    ///   value because it was cancelled.
    /// - [`JoinError::Interrupted`] if the waiting task was cancelled first.
    pub fn get(self) -> Result<T, JoinError> {
        self.wait()?;
        self.take_outcome()
    }

    /// Moves the outcome out of a finished task.
    pub(crate) fn take_outcome(&self) -> Result<T, JoinError> {
        debug_assert!(self.is_finished());

        let ctx = self.ctx();
        if let Some(payload) = ctx.take_panic() {
            return Err(JoinError::Panic(PanicPayload::new(payload)));
        }

        match (ctx.state(), self.result.lock().take()) {
            (TaskState::Completed, Some(value)) => Ok(value),
            _ => Err(JoinError::Cancelled(ctx.cancellation_reason())),
        }
    }

    /// Turns the handle into one that can be cloned and joined by several
    /// tasks.
    pub fn share(self) -> SharedTaskWithResult<T> {
        SharedTaskWithResult::new(self)
    }

    /// Lets the task run to completion without a handle. Its result is
    /// dropped.
    pub fn detach(mut self) {
        self.ctx.take();
    }
}

impl<T> Drop for TaskWithResult<T> {
    fn drop(&mut self) {
        let Some(ctx) = self.ctx.take() else {
            return;
        };

        if !ctx.is_finished() {
            ctx.request_cancel(CancellationReason::Abandoned);
        } else if ctx.has_panic() {
            debug!(task_id = %ctx.id(), "task panicked and its handle was dropped without observing it");
        }
    }
}

impl<T> fmt::Debug for TaskWithResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("TaskWithResult");
        match &self.ctx {
            Some(ctx) => s
                .field("id", &ctx.id())
                .field("state", &ctx.state())
                .field("cancellation_reason", &ctx.cancellation_reason()),
            None => s.field("detached", &true),
        };
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(TaskWithResult<u32>: Send, Sync);
    assert_impl_all!(TaskWithResult<std::cell::Cell<u32>>: Send);
}
