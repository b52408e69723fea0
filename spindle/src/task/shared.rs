use crate::deadline::Deadline;
use crate::error::{JoinError, PanicPayload, WaitError, WaitInterrupted};
use crate::task::{CancellationReason, TaskCancellationToken, TaskId, TaskState, TaskWithResult};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Outcome of a task that did not produce a value, kept so every joiner
/// observes it.
enum Failure {
    Cancelled(CancellationReason),
    Panic(Option<String>),
}

impl From<JoinError> for Failure {
    fn from(e: JoinError) -> Self {
        match e {
            JoinError::Cancelled(reason) | JoinError::Interrupted(reason) => {
                Failure::Cancelled(reason)
            }
            JoinError::Panic(payload) => Failure::Panic(payload.as_str().map(str::to_owned)),
        }
    }
}

impl Failure {
    fn to_join_error(&self) -> JoinError {
        match self {
            Failure::Cancelled(reason) => JoinError::Cancelled(*reason),
            Failure::Panic(message) => {
                let payload: Box<dyn Any + Send> = match message {
                    Some(message) => Box::new(message.clone()),
                    None => Box::new(()),
                };
                JoinError::Panic(PanicPayload::new(payload))
            }
        }
    }
}

struct Shared<T> {
    task: TaskWithResult<T>,
    outcome: OnceLock<Result<T, Failure>>,
}

/// A clonable handle to a task, joined by any number of tasks.
///
/// Created with [`TaskWithResult::share`]. Every clone observes the same
/// result through [`SharedTaskWithResult::get`], which borrows it instead of
/// moving it out. A panic of the task body is reported to every joiner with
/// the original message.
///
/// The task is cancelled with [`CancellationReason::Abandoned`] when the last
/// clone is dropped before it finished.
///
/// # Examples
///
/// ```no_run
/// # let processor = spindle::runtime::Builder::new().try_build().unwrap();
/// processor.block_on(|| {
///     let config = spindle::spawn(|| String::from("loaded")).share();
///
///     let readers: Vec<_> = (0..4)
///         .map(|_| {
///             let config = config.clone();
///             spindle::spawn(move || config.get().map(String::len).unwrap())
///         })
///         .collect();
///
///     for reader in readers {
///         assert_eq!(reader.get().unwrap(), 6);
///     }
/// });
/// ```
pub struct SharedTaskWithResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> SharedTaskWithResult<T> {
    pub(crate) fn new(task: TaskWithResult<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                task,
                outcome: OnceLock::new(),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.shared.task.id()
    }

    pub fn state(&self) -> TaskState {
        self.shared.task.state()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.task.is_finished()
    }

    pub fn cancellation_reason(&self) -> CancellationReason {
        self.shared.task.cancellation_reason()
    }

    /// Requests cancellation on behalf of every clone.
    pub fn request_cancel(&self) {
        self.shared.task.request_cancel();
    }

    pub fn cancellation_token(&self) -> TaskCancellationToken {
        self.shared.task.cancellation_token()
    }

    /// See [`TaskWithResult::sync_cancel`].
    pub fn sync_cancel(&self) {
        self.shared.task.sync_cancel();
    }

    pub fn wait(&self) -> Result<(), WaitInterrupted> {
        self.shared.task.wait()
    }

    pub fn wait_until(&self, deadline: Deadline) -> Result<(), WaitError> {
        self.shared.task.wait_until(deadline)
    }

    pub fn wait_for(&self, timeout: Duration) -> Result<(), WaitError> {
        self.shared.task.wait_for(timeout)
    }

    /// Waits for the task and borrows its result.
    ///
    /// # Errors
    ///
    /// Same as [`TaskWithResult::get`], repeated on every call. An
    /// [`JoinError::Interrupted`] leaves the task running.
    pub fn get(&self) -> Result<&T, JoinError> {
        self.shared.task.wait()?;

        self.shared
            .outcome
            .get_or_init(|| self.shared.task.take_outcome().map_err(Failure::from))
            .as_ref()
            .map_err(Failure::to_join_error)
    }

    /// Number of live clones of this handle.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }
}

impl<T> Clone for SharedTaskWithResult<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> From<TaskWithResult<T>> for SharedTaskWithResult<T> {
    fn from(task: TaskWithResult<T>) -> Self {
        Self::new(task)
    }
}

impl<T> fmt::Debug for SharedTaskWithResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTaskWithResult")
            .field("task", &self.shared.task)
            .field("handles", &self.handle_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use std::cell::Cell;

    assert_impl_all!(SharedTaskWithResult<String>: Send, Sync, Clone);
    assert_not_impl_any!(SharedTaskWithResult<Cell<u32>>: Sync);

    #[test]
    fn test_failure_keeps_panic_message() {
        let failure = Failure::from(JoinError::Panic(PanicPayload::new(Box::new("boom"))));

        for _ in 0..2 {
            let e = failure.to_join_error();
            assert!(e.is_panic());
            assert_eq!(e.panic_message(), Some("boom"));
        }
    }

    #[test]
    fn test_failure_keeps_cancellation_reason() {
        let failure = Failure::from(JoinError::Cancelled(CancellationReason::Shutdown));
        assert!(matches!(
            failure.to_join_error(),
            JoinError::Cancelled(CancellationReason::Shutdown)
        ));
    }
}
