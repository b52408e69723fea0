use crate::deadline::Deadline;
use crate::error::{WaitError, WaitInterrupted};
use crate::task::sleep_state::WakeupSource;
use crate::task::{TaskContext, current};
use crate::wait::{EarlyWakeup, WaitList, WaitStrategy, WaiterKey};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A counting semaphore for tasks.
///
/// Permits are returned when the [`SemaphorePermit`] drops. Permits are not
/// tied to a task and may be moved to another task before being released.
pub struct Semaphore {
    available: AtomicUsize,
    waiters: WaitList,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            available: AtomicUsize::new(permits),
            waiters: WaitList::new(),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }

    fn try_take(&self) -> bool {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    fn acquire_inner(&self, ctx: &Arc<TaskContext>, deadline: Deadline) -> Result<(), WaitError> {
        while !self.try_take() {
            let mut strategy = AcquireWaitStrategy {
                semaphore: self,
                ctx,
                key: None,
                acquired: false,
            };

            let res = match ctx.sleep(&mut strategy, deadline) {
                _ if strategy.acquired => return Ok(()),
                WakeupSource::DeadlineTimer => Err(WaitError::Timeout),
                WakeupSource::CancelRequest => Err(WaitError::Cancelled(ctx.cancellation_reason())),
                _ => continue,
            };

            if self.try_take() {
                return Ok(());
            }

            // We may have consumed a release wakeup meant for the next waiter.
            if self.available_permits() > 0 {
                self.waiters.lock().wakeup_one();
            }
            return res;
        }
        Ok(())
    }

    /// Takes one permit, suspending the current task until one is available.
    ///
    /// # Panics
    ///
    /// Panics if called from outside a task.
    #[track_caller]
    pub fn acquire(&self) -> Result<SemaphorePermit<'_>, WaitInterrupted> {
        let ctx = current::expect_current("Semaphore::acquire");
        match self.acquire_inner(&ctx, Deadline::never()) {
            Ok(()) => Ok(SemaphorePermit { semaphore: self }),
            Err(WaitError::Cancelled(reason)) => Err(WaitInterrupted::new(reason)),
            Err(WaitError::Timeout) => unreachable!("acquire without deadline timed out"),
        }
    }

    /// Takes one permit if one is available. Usable from any thread.
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        self.try_take().then(|| SemaphorePermit { semaphore: self })
    }

    #[track_caller]
    pub fn try_acquire_until(&self, deadline: Deadline) -> Result<SemaphorePermit<'_>, WaitError> {
        let ctx = current::expect_current("Semaphore::try_acquire_until");
        self.acquire_inner(&ctx, deadline)?;
        Ok(SemaphorePermit { semaphore: self })
    }

    #[track_caller]
    pub fn try_acquire_for(&self, timeout: Duration) -> Result<SemaphorePermit<'_>, WaitError> {
        self.try_acquire_until(Deadline::from_duration(timeout))
    }

    /// Adds `n` permits, waking up to `n` waiting tasks.
    pub fn release(&self, n: usize) {
        if n == 0 {
            return;
        }

        self.available.fetch_add(n, Ordering::AcqRel);

        let mut waiters = self.waiters.lock();
        for _ in 0..n {
            if !waiters.wakeup_one() {
                break;
            }
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available_permits())
            .finish_non_exhaustive()
    }
}

struct AcquireWaitStrategy<'a> {
    semaphore: &'a Semaphore,
    ctx: &'a Arc<TaskContext>,
    key: Option<WaiterKey>,
    acquired: bool,
}

impl WaitStrategy for AcquireWaitStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut waiters = self.semaphore.waiters.lock();
        if self.semaphore.try_take() {
            self.acquired = true;
            return EarlyWakeup(true);
        }

        self.key = Some(waiters.append(self.ctx));
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.semaphore.waiters.remove(key);
        }
    }
}

/// One permit of a [`Semaphore`], released on drop.
#[must_use = "the permit is released immediately if unused"]
pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl SemaphorePermit<'_> {
    /// Consumes the permit without returning it to the semaphore.
    pub fn forget(self) {
        std::mem::forget(self);
    }
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release(1);
    }
}

impl fmt::Debug for SemaphorePermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphorePermit").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Semaphore: Send, Sync);
    assert_impl_all!(SemaphorePermit<'static>: Send, Sync);

    #[test]
    fn test_try_acquire_counts_permits() {
        let sem = Semaphore::new(2);

        let a = sem.try_acquire();
        let b = sem.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(sem.try_acquire().is_none());
        assert_eq!(sem.available_permits(), 0);

        drop(a);
        assert_eq!(sem.available_permits(), 1);

        b.into_iter().for_each(SemaphorePermit::forget);
        assert_eq!(sem.available_permits(), 1);
    }

    #[test]
    fn test_release_adds_permits() {
        let sem = Semaphore::new(0);
        assert!(sem.try_acquire().is_none());

        sem.release(3);
        assert_eq!(sem.available_permits(), 3);
        sem.release(0);
        assert_eq!(sem.available_permits(), 3);
    }

    #[test]
    fn test_failed_try_acquire_leaves_count_unchanged() {
        let sem = Semaphore::new(0);

        for _ in 0..5 {
            assert!(sem.try_acquire().is_none());
        }
        assert_eq!(sem.available_permits(), 0);

        sem.release(1);
        let permit = sem.try_acquire();
        assert!(permit.is_some());
        assert!(sem.try_acquire().is_none());
        assert_eq!(sem.available_permits(), 0);
    }
}
