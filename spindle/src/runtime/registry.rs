use crate::task::{CancellationReason, TaskContext, TaskId};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::debug;

// Every alive task of a processor, keyed by id. The registry holds the strong
// reference that keeps a task running after its handle was dropped, until the
// task finishes. It is also how shutdown reaches tasks nobody waits for.
#[derive(Debug)]
pub(crate) struct TaskRegistry {
    tasks: DashMap<TaskId, Arc<TaskContext>>,

    // Keep track of size separately because DashMap impl for len iterates over
    // all shards.
    size: AtomicUsize,

    // Closed when shutting down, tasks inserted afterwards are rejected.
    closed: AtomicBool,

    // Signalled when the last task is removed.
    drained: Mutex<()>,
    drained_cond: Condvar,
}

impl TaskRegistry {
    pub(crate) fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            size: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            drained: Mutex::new(()),
            drained_cond: Condvar::new(),
        }
    }

    /// Returns `false` if the registry is closed, the task was not inserted.
    pub(crate) fn insert(&self, ctx: &Arc<TaskContext>) -> bool {
        if self.is_closed() {
            return false;
        }

        self.size.fetch_add(1, Ordering::AcqRel);
        self.tasks.insert(ctx.id(), Arc::clone(ctx));

        // Shutdown may have drained the map between our check and insert.
        if self.is_closed() {
            ctx.request_cancel(CancellationReason::Shutdown);
        }
        true
    }

    pub(crate) fn remove(&self, id: &TaskId) -> Option<Arc<TaskContext>> {
        let removed = self.tasks.remove(id).map(|(_id, ctx)| ctx);

        if removed.is_some() && self.size.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.drained.lock();
            self.drained_cond.notify_all();
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Rejects new tasks and requests cancellation of every alive task.
    /// Returns `false` if the registry was already closed.
    pub(crate) fn close_and_cancel_all(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        // Collected first, a cancel request may finish a task and re-enter
        // `remove` on the same shard.
        let alive = self
            .tasks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect::<Vec<_>>();

        debug!(tasks = alive.len(), "cancelling all tasks");
        for ctx in alive {
            ctx.request_cancel(CancellationReason::Shutdown);
        }
        true
    }

    /// Blocks the calling OS thread until every task finished or `deadline`
    /// passes. Returns `true` if the registry drained.
    pub(crate) fn wait_drained(&self, deadline: Instant) -> bool {
        let mut guard = self.drained.lock();
        while !self.is_empty() {
            if self.drained_cond.wait_until(&mut guard, deadline).timed_out() {
                return self.is_empty();
            }
        }
        true
    }

    /// Forgets every remaining task. Returns how many there were.
    pub(crate) fn drain(&self) -> usize {
        let ids = self.tasks.iter().map(|entry| *entry.key()).collect::<Vec<_>>();
        ids.iter().filter_map(|id| self.remove(id)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::time::Duration;

    assert_impl_all!(TaskRegistry: Send, Sync);

    #[test]
    fn test_empty_registry_is_drained() {
        let registry = TaskRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.wait_drained(Instant::now()));
    }

    #[test]
    fn test_close_once() {
        let registry = TaskRegistry::new();
        assert!(registry.close_and_cancel_all());
        assert!(!registry.close_and_cancel_all());
        assert!(registry.is_closed());
        assert!(registry.wait_drained(Instant::now() + Duration::from_millis(1)));
    }
}
