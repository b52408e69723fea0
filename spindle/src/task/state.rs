use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Observable lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Created, not yet scheduled.
    New = 0,

    /// Waiting in a run queue.
    Queued = 1,

    /// Executing on a worker thread.
    Running = 2,

    /// Parked in a blocking primitive.
    Suspended = 3,

    /// The body returned or panicked.
    Completed = 4,

    /// The body was not run, or unwound because of cancellation.
    Cancelled = 5,
}

impl TaskState {
    #[inline]
    pub fn is_finished(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }

    fn from_u8(val: u8) -> TaskState {
        match val {
            0 => TaskState::New,
            1 => TaskState::Queued,
            2 => TaskState::Running,
            3 => TaskState::Suspended,
            4 => TaskState::Completed,
            5 => TaskState::Cancelled,
            _ => unreachable!("invalid task state {val}"),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::New => "new",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Suspended => "suspended",
            TaskState::Completed => "completed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub(crate) struct AtomicTaskState(AtomicU8);

impl AtomicTaskState {
    pub(crate) fn new(state: TaskState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[inline]
    pub(crate) fn load(&self) -> TaskState {
        TaskState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Transitions to `new`. Finished states are terminal: once set they are
    /// never overwritten.
    pub(crate) fn set(&self, new: TaskState) {
        let mut current = self.0.load(Ordering::Relaxed);
        loop {
            let prev = TaskState::from_u8(current);
            if prev.is_finished() {
                debug_assert!(false, "task state transition {prev} -> {new} after finish");
                return;
            }

            match self.0.compare_exchange_weak(
                current,
                new as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}
