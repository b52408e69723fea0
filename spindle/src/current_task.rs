//! Operations on the task running the caller.
//!
//! Every function panics when called from outside a task, except
//! [`is_inside_task`] and [`try_id`].
use crate::deadline::Deadline;
use crate::task::{CancellationReason, TaskContext, current};
use std::sync::Arc;

pub use crate::task::{CancellationBlocker, TaskId, id, try_id};

#[track_caller]
fn expect(api: &str) -> Arc<TaskContext> {
    current::expect_current(api)
}

pub fn is_inside_task() -> bool {
    current::is_inside_task()
}

/// Whether the current task has a cancellation request it must act on now,
/// that is one that is not blocked by a [`CancellationBlocker`].
#[track_caller]
pub fn should_cancel() -> bool {
    expect("current_task::should_cancel").should_cancel()
}

/// Whether cancellation of the current task was requested, blocked or not.
#[track_caller]
pub fn is_cancel_requested() -> bool {
    expect("current_task::is_cancel_requested").is_cancel_requested()
}

#[track_caller]
pub fn cancellation_reason() -> CancellationReason {
    expect("current_task::cancellation_reason").cancellation_reason()
}

/// Unwinds the current task if it [should cancel](should_cancel).
///
/// Destructors of every frame of the task run, the task then finishes as
/// cancelled and its joiner gets
/// [`JoinError::Cancelled`](crate::task::JoinError::Cancelled).
#[track_caller]
pub fn cancellation_point() {
    if should_cancel() {
        crate::task::unwind_cancelled();
    }
}

/// Requests cancellation of the current task with
/// [`CancellationReason::UserRequest`].
#[track_caller]
pub fn request_cancel() {
    expect("current_task::request_cancel").request_cancel(CancellationReason::UserRequest);
}

/// Replaces the deadline of the current task. Once reached the task is
/// cancelled with [`CancellationReason::Deadline`].
#[track_caller]
pub fn set_deadline(deadline: Deadline) {
    expect("current_task::set_deadline").set_deadline(deadline);
}

#[track_caller]
pub fn deadline() -> Deadline {
    expect("current_task::deadline").deadline()
}
