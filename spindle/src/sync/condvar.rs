use crate::deadline::Deadline;
use crate::sync::MutexGuard;
use crate::sync::mutex::RawMutex;
use crate::task::sleep_state::WakeupSource;
use crate::task::{TaskContext, TaskId, current};
use crate::wait::{EarlyWakeup, WaitList, WaitStrategy, WaiterKey};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a [`ConditionVariable`] wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CvStatus {
    /// Woken by a notification, or spuriously.
    NoTimeout,

    /// The deadline was reached.
    Timeout,

    /// The waiting task was cancelled.
    Cancelled,
}

/// A condition variable for tasks, used together with a
/// [`Mutex`](crate::sync::Mutex).
///
/// The mutex is released while the task is parked and re-acquired before any
/// wait returns, ignoring cancellation, so the guard handed back is always
/// valid.
///
/// Waits may return [`CvStatus::NoTimeout`] without a matching notification:
/// always re-check the condition, or use [`ConditionVariable::wait_while`].
///
/// # Examples
///
/// ```no_run
/// use spindle::sync::{ConditionVariable, Mutex};
/// use std::sync::Arc;
///
/// # fn doc() {
/// let pair = Arc::new((Mutex::new(false), ConditionVariable::new()));
///
/// let pair2 = Arc::clone(&pair);
/// let notifier = spindle::spawn(move || {
///     let (ready, cv) = &*pair2;
///     *ready.lock().unwrap() = true;
///     cv.notify_one();
/// });
///
/// let (ready, cv) = &*pair;
/// let (_guard, satisfied) = cv.wait_while(ready.lock().unwrap(), |ready| !*ready);
/// assert!(satisfied);
/// notifier.get().unwrap();
/// # }
/// ```
#[derive(Default)]
pub struct ConditionVariable {
    waiters: WaitList,
}

impl ConditionVariable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks the current task until notified or cancelled.
    #[track_caller]
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> (MutexGuard<'a, T>, CvStatus) {
        self.wait_until(guard, Deadline::never())
    }

    /// Parks the current task until notified, `deadline` is reached or the
    /// task is cancelled.
    ///
    /// # Panics
    ///
    /// Panics if called from outside a task.
    #[track_caller]
    pub fn wait_until<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        deadline: Deadline,
    ) -> (MutexGuard<'a, T>, CvStatus) {
        let ctx = current::expect_current("ConditionVariable::wait_until");
        debug_assert_eq!(guard.owner(), ctx.id(), "guard locked by another task");

        let mut strategy = CvWaitStrategy {
            waiters: &self.waiters,
            mutex: guard.raw(),
            owner: guard.owner(),
            ctx: &ctx,
            key: None,
            released: false,
        };
        let source = ctx.sleep(&mut strategy, deadline);

        if strategy.released {
            guard.raw().lock_uninterruptible(&ctx);
        }

        let status = match source {
            WakeupSource::DeadlineTimer => CvStatus::Timeout,
            WakeupSource::CancelRequest => CvStatus::Cancelled,
            _ => CvStatus::NoTimeout,
        };
        (guard, status)
    }

    /// Same as `wait_until(guard, Deadline::from_duration(timeout))`.
    #[track_caller]
    pub fn wait_for<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, CvStatus) {
        self.wait_until(guard, Deadline::from_duration(timeout))
    }

    /// Waits as long as `condition` holds.
    ///
    /// Returns `false` if the wait was cancelled while the condition still
    /// held.
    #[track_caller]
    pub fn wait_while<'a, T: ?Sized, F>(
        &self,
        guard: MutexGuard<'a, T>,
        condition: F,
    ) -> (MutexGuard<'a, T>, bool)
    where
        F: FnMut(&mut T) -> bool,
    {
        self.wait_until_while(guard, Deadline::never(), condition)
    }

    /// Waits as long as `condition` holds, at most until `deadline`.
    ///
    /// Returns `false` if the wait timed out or was cancelled while the
    /// condition still held.
    #[track_caller]
    pub fn wait_until_while<'a, T: ?Sized, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        deadline: Deadline,
        mut condition: F,
    ) -> (MutexGuard<'a, T>, bool)
    where
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            let (g, status) = self.wait_until(guard, deadline);
            guard = g;

            if status != CvStatus::NoTimeout {
                let satisfied = !condition(&mut *guard);
                return (guard, satisfied);
            }
        }
        (guard, true)
    }

    /// Same as `wait_until_while(guard, Deadline::from_duration(timeout), condition)`.
    #[track_caller]
    pub fn wait_for_while<'a, T: ?Sized, F>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
        condition: F,
    ) -> (MutexGuard<'a, T>, bool)
    where
        F: FnMut(&mut T) -> bool,
    {
        self.wait_until_while(guard, Deadline::from_duration(timeout), condition)
    }

    /// Wakes the longest waiting task, if any.
    pub fn notify_one(&self) {
        self.waiters.lock().wakeup_one();
    }

    pub fn notify_all(&self) {
        self.waiters.lock().wakeup_all();
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("waiters", &self.waiters.lock().len())
            .finish()
    }
}

struct CvWaitStrategy<'a> {
    waiters: &'a WaitList,
    mutex: &'a RawMutex,
    owner: TaskId,
    ctx: &'a Arc<TaskContext>,
    key: Option<WaiterKey>,

    /// Whether the mutex was released, the sleep may return before setting
    /// up wakeups.
    released: bool,
}

impl WaitStrategy for CvWaitStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut waiters = self.waiters.lock();
        self.key = Some(waiters.append(self.ctx));

        // Released once parked: a notification sent after this point finds us
        // in the list.
        self.mutex.unlock(self.owner);
        self.released = true;
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.waiters.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(ConditionVariable: Send, Sync);
    assert_impl_all!(CvStatus: Send, Sync, Copy);

    #[test]
    fn test_notify_without_waiters_is_noop() {
        let cv = ConditionVariable::new();
        cv.notify_one();
        cv.notify_all();
        assert_eq!(format!("{cv:?}"), "ConditionVariable { waiters: 0 }");
    }
}
