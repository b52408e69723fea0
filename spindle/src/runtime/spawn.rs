//! Provides functions and types for spawning new tasks.
//!
//! From inside a task, [`spawn()`] and friends target the processor running
//! the current task. From any other thread, go through a
//! [`TaskProcessor`](crate::runtime::TaskProcessor) handle.
//!
//! Use [`SpawnBuilder`] to set a task deadline or mark a task critical.
use crate::deadline::Deadline;
use crate::error::EngineError;
use crate::runtime::ProcessorShared;
use crate::task::context::Importance;
use crate::task::{TaskWithResult, current};
use std::sync::Arc;
use std::time::Duration;

/// Spawns a new task on the current task's processor.
///
/// # Panics
///
/// Panics if called from outside a task.
#[track_caller]
pub fn spawn<F, T>(f: F) -> TaskWithResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn_builder().spawn(f)
}

/// Spawns a new critical task on the current task's processor.
///
/// A critical task runs its body even if it is cancelled before its first
/// step, and is never cancelled because the processor is overloaded.
///
/// # Panics
///
/// Panics if called from outside a task.
#[track_caller]
pub fn spawn_critical<F, T>(f: F) -> TaskWithResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    spawn_builder().critical().spawn(f)
}

/// Creates a new [`SpawnBuilder`] targeting the current task's processor.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
///
/// # fn handler() {
/// let task = spindle::spawn_builder()
///     .timeout(Duration::from_millis(100))
///     .spawn(|| 6 * 7);
/// # }
/// ```
pub fn spawn_builder() -> SpawnBuilder {
    SpawnBuilder::default()
}

/// A builder for configuring and spawning a new task.
///
/// Created by calling [`spawn_builder()`] or
/// [`TaskProcessor::spawn_builder`](crate::runtime::TaskProcessor::spawn_builder).
#[derive(Debug, Default)]
pub struct SpawnBuilder {
    importance: Importance,

    deadline: Deadline,

    /// `None` targets the processor of the current task.
    processor: Option<Arc<ProcessorShared>>,
}

impl SpawnBuilder {
    pub(crate) fn with_processor(processor: Arc<ProcessorShared>) -> Self {
        Self {
            processor: Some(processor),
            ..Default::default()
        }
    }

    /// Marks the task critical, see [`spawn_critical`].
    pub fn critical(mut self) -> Self {
        self.importance = Importance::Critical;
        self
    }

    /// Cancels the task with
    /// [`CancellationReason::Deadline`](crate::task::CancellationReason::Deadline)
    /// once `deadline` is reached.
    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Same as `deadline(Deadline::from_duration(timeout))`.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.deadline(Deadline::from_duration(timeout))
    }

    /// Spawns the task with the configured options.
    ///
    /// # Panics
    ///
    /// Panics if the builder was not created from a processor handle and is
    /// used outside of a task.
    #[track_caller]
    pub fn spawn<F, T>(self, f: F) -> TaskWithResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let processor = self.target();
        processor.spawn(self.importance, self.deadline, f)
    }

    /// Same as [`SpawnBuilder::spawn`], but returns an error instead of
    /// spawning a task that would be cancelled right away.
    #[track_caller]
    pub fn try_spawn<F, T>(self, f: F) -> Result<TaskWithResult<T>, EngineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let processor = self.target();
        processor.try_spawn(self.importance, self.deadline, f)
    }

    #[track_caller]
    fn target(&self) -> Arc<ProcessorShared> {
        match &self.processor {
            Some(processor) => Arc::clone(processor),
            None => Arc::clone(current::expect_current("spawn").processor()),
        }
    }
}
