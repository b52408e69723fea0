use crate::coro::CoroutinePoolStats;
use crate::task::TaskState;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Point-in-time statistics of a task processor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub worker_threads: usize,

    /// Tasks spawned since the processor started.
    pub tasks_created: usize,

    /// Tasks not finished yet.
    pub tasks_alive: usize,

    /// Tasks waiting in a run queue.
    pub tasks_queued: usize,

    pub tasks_completed: usize,

    pub tasks_cancelled: usize,

    /// Tasks cancelled because the queue length limit was exceeded.
    pub tasks_overloaded: usize,

    pub coro_pool: CoroutinePoolStats,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    created: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
    overloaded: AtomicUsize,
}

impl Counters {
    pub(crate) fn on_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the queue length before the push.
    pub(crate) fn on_queued(&self) -> usize {
        self.queued.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub(crate) fn on_dequeued(&self) {
        self.queued.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn on_overloaded(&self) {
        self.overloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_finished(&self, state: TaskState) {
        match state {
            TaskState::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            _ => self.cancelled.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn snapshot(
        &self,
        worker_threads: usize,
        tasks_alive: usize,
        coro_pool: CoroutinePoolStats,
    ) -> ProcessorStats {
        ProcessorStats {
            worker_threads,
            tasks_created: self.created.load(Ordering::Relaxed),
            tasks_alive,
            tasks_queued: self.queued.load(Ordering::Relaxed),
            tasks_completed: self.completed.load(Ordering::Relaxed),
            tasks_cancelled: self.cancelled.load(Ordering::Relaxed),
            tasks_overloaded: self.overloaded.load(Ordering::Relaxed),
            coro_pool,
        }
    }
}
