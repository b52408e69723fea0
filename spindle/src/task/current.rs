//! Thread-local pointer to the task being stepped on this thread.
//!
//! Only the worker's resume transition writes it. A task body may migrate
//! between threads at every suspension point, so accessors re-read the thread
//! local on each call and are never inlined into task code.
use crate::task::TaskContext;
use std::cell::Cell;
use std::ptr;
use std::sync::Arc;

thread_local! {
    static CURRENT: Cell<*const TaskContext> = const { Cell::new(ptr::null()) };
}

#[inline(never)]
fn current_ptr() -> *const TaskContext {
    CURRENT.with(Cell::get)
}

/// Runs `f` with the current task, `None` outside of a task.
pub(crate) fn with_current<R>(f: impl FnOnce(&TaskContext) -> R) -> Option<R> {
    let ptr = current_ptr();

    // Safety: the worker stepping this task holds a strong reference for the
    // whole step, and the pointer is cleared before that reference is dropped.
    unsafe { ptr.as_ref() }.map(f)
}

/// Strong reference to the current task, `None` outside of a task.
pub(crate) fn current() -> Option<Arc<TaskContext>> {
    with_current(TaskContext::arc).flatten()
}

/// Same as [`current()`] for APIs that can only be used from a task.
#[track_caller]
pub(crate) fn expect_current(api: &str) -> Arc<TaskContext> {
    match current() {
        Some(ctx) => ctx,
        None => panic!("{api} must be called from a task running on a task processor"),
    }
}

pub(crate) fn is_inside_task() -> bool {
    !current_ptr().is_null()
}

/// Publishes a task as current for the duration of one step.
pub(crate) struct CurrentTaskGuard {
    prev: *const TaskContext,
}

impl CurrentTaskGuard {
    pub(crate) fn enter(ctx: &Arc<TaskContext>) -> Self {
        let prev = CURRENT.with(|c| c.replace(Arc::as_ptr(ctx)));
        debug_assert!(prev.is_null(), "nested task steps on one thread");
        Self { prev }
    }
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.prev));
    }
}
