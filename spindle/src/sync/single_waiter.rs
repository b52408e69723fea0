use crate::deadline::Deadline;
use crate::error::{WaitError, WaitInterrupted};
use crate::sync::mutex::owner_word;
use crate::task::sleep_state::WakeupSource;
use crate::task::{TaskContext, TaskId, current};
use crate::wait::{EarlyWakeup, LightWaiterKey, WaitListLight, WaitStrategy};
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A mutex for data contended by at most two tasks at a time: one holder and
/// one waiter.
///
/// Parking needs no lock and no allocation beyond one waiter slot. A second
/// task blocking while another one already waits panics.
///
/// Unlike [`Mutex`](crate::sync::Mutex) there is no hand-off: the woken waiter
/// competes for the lock again.
pub struct SingleWaiterMutex<T: ?Sized> {
    /// `owner_word(holder)`, zero when unlocked.
    owner: AtomicU64,
    waiter: WaitListLight,
    data: UnsafeCell<T>,
}

// Safety: the data is only reachable through a guard, and guards are
// mutually exclusive.
unsafe impl<T: ?Sized + Send> Send for SingleWaiterMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for SingleWaiterMutex<T> {}

impl<T> SingleWaiterMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicU64::new(0),
            waiter: WaitListLight::new(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SingleWaiterMutex<T> {
    fn try_lock_owner(&self, id: TaskId) -> bool {
        self.owner
            .compare_exchange(0, owner_word(id), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    #[track_caller]
    fn lock_inner(&self, ctx: &Arc<TaskContext>, deadline: Deadline) -> Result<(), WaitError> {
        let id = ctx.id();
        assert_ne!(
            self.owner.load(Ordering::Acquire),
            owner_word(id),
            "recursive lock of a mutex already owned by task {id}"
        );

        while !self.try_lock_owner(id) {
            let mut strategy = LightLockWaitStrategy {
                mutex: self,
                ctx,
                key: None,
                acquired: false,
            };

            match ctx.sleep(&mut strategy, deadline) {
                WakeupSource::WaitList if strategy.acquired => return Ok(()),
                WakeupSource::DeadlineTimer => {
                    return if self.try_lock_owner(id) {
                        Ok(())
                    } else {
                        Err(WaitError::Timeout)
                    };
                }
                WakeupSource::CancelRequest => {
                    return Err(WaitError::Cancelled(ctx.cancellation_reason()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Locks the mutex, suspending the current task while it is held
    /// elsewhere.
    ///
    /// # Panics
    ///
    /// Panics if called from outside a task, if the current task already holds
    /// the mutex, or if another task is already waiting for it.
    #[track_caller]
    pub fn lock(&self) -> Result<SingleWaiterMutexGuard<'_, T>, WaitInterrupted> {
        let ctx = current::expect_current("SingleWaiterMutex::lock");
        match self.lock_inner(&ctx, Deadline::never()) {
            Ok(()) => Ok(SingleWaiterMutexGuard::new(self, ctx.id())),
            Err(WaitError::Cancelled(reason)) => Err(WaitInterrupted::new(reason)),
            Err(WaitError::Timeout) => unreachable!("lock without deadline timed out"),
        }
    }

    /// Locks the mutex, ignoring cancellation of the current task.
    #[track_caller]
    pub fn lock_uninterruptible(&self) -> SingleWaiterMutexGuard<'_, T> {
        let ctx = current::expect_current("SingleWaiterMutex::lock_uninterruptible");

        let was_cancellable = ctx.set_cancellable(false);
        let res = self.lock_inner(&ctx, Deadline::never());
        ctx.set_cancellable(was_cancellable);

        match res {
            Ok(()) => SingleWaiterMutexGuard::new(self, ctx.id()),
            Err(e) => unreachable!("uninterruptible lock without deadline failed: {e}"),
        }
    }

    #[track_caller]
    pub fn try_lock(&self) -> Option<SingleWaiterMutexGuard<'_, T>> {
        let id = crate::task::id();
        self.try_lock_owner(id)
            .then(|| SingleWaiterMutexGuard::new(self, id))
    }

    #[track_caller]
    pub fn try_lock_until(
        &self,
        deadline: Deadline,
    ) -> Result<SingleWaiterMutexGuard<'_, T>, WaitError> {
        let ctx = current::expect_current("SingleWaiterMutex::try_lock_until");
        self.lock_inner(&ctx, deadline)?;
        Ok(SingleWaiterMutexGuard::new(self, ctx.id()))
    }

    #[track_caller]
    pub fn try_lock_for(
        &self,
        timeout: Duration,
    ) -> Result<SingleWaiterMutexGuard<'_, T>, WaitError> {
        self.try_lock_until(Deadline::from_duration(timeout))
    }

    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != 0
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self, id: TaskId) {
        let prev = self.owner.swap(0, Ordering::SeqCst);
        debug_assert_eq!(
            prev,
            owner_word(id),
            "mutex unlocked by task {id} which does not own it"
        );
        self.waiter.wakeup_one();
    }
}

struct LightLockWaitStrategy<'a, T: ?Sized> {
    mutex: &'a SingleWaiterMutex<T>,
    ctx: &'a Arc<TaskContext>,
    key: Option<LightWaiterKey>,
    acquired: bool,
}

impl<T: ?Sized> WaitStrategy for LightLockWaitStrategy<'_, T> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let key = self.mutex.waiter.set_waiter(self.ctx);

        // The unlock may have happened before the waiter was published.
        if self.mutex.try_lock_owner(self.ctx.id()) {
            self.mutex.waiter.remove(key);
            self.acquired = true;
            return EarlyWakeup(true);
        }

        self.key = Some(key);
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.mutex.waiter.remove(key);
        }
    }
}

impl<T: Default> Default for SingleWaiterMutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized> fmt::Debug for SingleWaiterMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleWaiterMutex")
            .field("locked", &self.is_locked())
            .field("waiter", &self.waiter)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the data of a [`SingleWaiterMutex`], unlocking it on
/// drop.
#[must_use = "if unused the SingleWaiterMutex will immediately unlock"]
pub struct SingleWaiterMutexGuard<'a, T: ?Sized> {
    mutex: &'a SingleWaiterMutex<T>,
    owner: TaskId,
    _not_send: PhantomData<*const ()>,
}

// Safety: sharing `&SingleWaiterMutexGuard` only gives out `&T`.
unsafe impl<T: ?Sized + Sync> Sync for SingleWaiterMutexGuard<'_, T> {}

impl<'a, T: ?Sized> SingleWaiterMutexGuard<'a, T> {
    fn new(mutex: &'a SingleWaiterMutex<T>, owner: TaskId) -> Self {
        Self {
            mutex,
            owner,
            _not_send: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for SingleWaiterMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves the mutex is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SingleWaiterMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves the mutex is held, and we borrow it mutably.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for SingleWaiterMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock(self.owner);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SingleWaiterMutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    assert_impl_all!(SingleWaiterMutex<Vec<u8>>: Send, Sync);
    assert_not_impl_any!(SingleWaiterMutexGuard<'static, u32>: Send);

    #[test]
    fn test_unlocked_by_default() {
        let mutex = SingleWaiterMutex::new(5);
        assert!(!mutex.is_locked());
        assert_eq!(mutex.into_inner(), 5);
    }
}
