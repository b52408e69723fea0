//! Suspending the current task for a while.
use crate::deadline::Deadline;
use crate::error::WaitInterrupted;
use crate::task::current;
use crate::task::sleep_state::WakeupSource;
use crate::wait::{EarlyWakeup, WaitStrategy};
use std::time::Duration;

/// Nothing but the deadline or a cancellation ends the sleep.
struct NoWakeups;

impl WaitStrategy for NoWakeups {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {}
}

/// Suspends the current task until `deadline`.
///
/// Returns early with an error if the task is cancelled, including by its
/// own task deadline.
///
/// # Panics
///
/// Panics if called from outside a task.
#[track_caller]
pub fn sleep_until(deadline: impl Into<Deadline>) -> Result<(), WaitInterrupted> {
    let deadline = deadline.into();
    let ctx = current::expect_current("sleep_until");

    loop {
        match ctx.sleep(&mut NoWakeups, deadline) {
            WakeupSource::CancelRequest => {
                return Err(WaitInterrupted::new(ctx.cancellation_reason()));
            }
            _ if deadline.is_reached() => return Ok(()),
            _ => {}
        }
    }
}

/// Suspends the current task for `duration`, see [`sleep_until`].
#[track_caller]
pub fn sleep_for(duration: Duration) -> Result<(), WaitInterrupted> {
    sleep_until(Deadline::from_duration(duration))
}

/// Suspends the current task until `deadline`, ignoring cancellation.
#[track_caller]
pub fn uninterruptible_sleep_until(deadline: impl Into<Deadline>) {
    let deadline = deadline.into();
    let ctx = current::expect_current("uninterruptible_sleep_until");

    if !deadline.is_reachable() {
        panic!("uninterruptible sleep without a deadline never returns");
    }

    let was_cancellable = ctx.set_cancellable(false);
    while !deadline.is_reached() {
        ctx.sleep(&mut NoWakeups, deadline);
    }
    ctx.set_cancellable(was_cancellable);
}

/// Suspends the current task for `duration`, ignoring cancellation.
#[track_caller]
pub fn uninterruptible_sleep_for(duration: Duration) {
    uninterruptible_sleep_until(Deadline::from_duration(duration))
}

/// Lets every other ready task of the processor run before continuing.
///
/// # Panics
///
/// Panics if called from outside a task.
#[track_caller]
pub fn yield_now() {
    current::expect_current("yield_now").yield_now();
}
