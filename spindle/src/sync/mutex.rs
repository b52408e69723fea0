use crate::deadline::Deadline;
use crate::error::{WaitError, WaitInterrupted};
use crate::task::sleep_state::WakeupSource;
use crate::task::{TaskContext, TaskId, current};
use crate::wait::{EarlyWakeup, WaitList, WaitStrategy, WaiterKey};
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Set in the owner word while at least one task is parked in the wait list.
const HAS_WAITERS: u64 = 1;

#[inline]
pub(super) fn owner_word(id: TaskId) -> u64 {
    id.as_u64() << 1
}

/// Lock state of a [`Mutex`]: the owner word and the parked waiters.
///
/// Unlocking with waiters hands ownership to the oldest waiter without ever
/// going through the unlocked state, so a contended mutex is granted in FIFO
/// order and a late locker cannot barge ahead of parked tasks.
#[derive(Debug, Default)]
pub(super) struct RawMutex {
    /// `owner_word(holder) | HAS_WAITERS`, zero when unlocked.
    owner: AtomicU64,
    waiters: WaitList,
}

impl RawMutex {
    pub(super) fn try_lock(&self, id: TaskId) -> bool {
        self.owner
            .compare_exchange(0, owner_word(id), Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(super) fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != 0
    }

    pub(super) fn is_owned_by(&self, id: TaskId) -> bool {
        self.owner.load(Ordering::Acquire) & !HAS_WAITERS == owner_word(id)
    }

    #[track_caller]
    fn assert_not_owner(&self, id: TaskId) {
        assert!(
            !self.is_owned_by(id),
            "recursive lock of a mutex already owned by task {id}"
        );
    }

    #[track_caller]
    pub(super) fn lock(&self, ctx: &Arc<TaskContext>, deadline: Deadline) -> Result<(), WaitError> {
        self.assert_not_owner(ctx.id());
        if self.try_lock(ctx.id()) {
            return Ok(());
        }
        self.lock_slow(ctx, deadline)
    }

    /// Locks the mutex ignoring cancellation requests.
    #[track_caller]
    pub(super) fn lock_uninterruptible(&self, ctx: &Arc<TaskContext>) {
        self.assert_not_owner(ctx.id());
        if self.try_lock(ctx.id()) {
            return;
        }

        let was_cancellable = ctx.set_cancellable(false);
        let res = self.lock_slow(ctx, Deadline::never());
        ctx.set_cancellable(was_cancellable);

        if let Err(e) = res {
            unreachable!("uninterruptible lock without deadline failed: {e}");
        }
    }

    #[cold]
    fn lock_slow(&self, ctx: &Arc<TaskContext>, deadline: Deadline) -> Result<(), WaitError> {
        let id = ctx.id();

        loop {
            let mut strategy = LockWaitStrategy {
                mutex: self,
                ctx,
                key: None,
            };
            let source = ctx.sleep(&mut strategy, deadline);

            // Ownership may have been handed over while a timeout or a
            // cancellation was racing with the unlock.
            if self.is_owned_by(id) {
                return Ok(());
            }

            match source {
                WakeupSource::DeadlineTimer => return Err(WaitError::Timeout),
                WakeupSource::CancelRequest => {
                    return Err(WaitError::Cancelled(ctx.cancellation_reason()));
                }
                _ => {}
            }
        }
    }

    pub(super) fn unlock(&self, id: TaskId) {
        debug_assert!(
            self.is_owned_by(id),
            "mutex unlocked by task {id} which does not own it"
        );

        if self
            .owner
            .compare_exchange(owner_word(id), 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }

        let mut waiters = self.waiters.lock();
        match waiters.pop_front() {
            Some(next) => {
                let mut word = owner_word(next.ctx().id());
                if !waiters.is_empty() {
                    word |= HAS_WAITERS;
                }
                self.owner.store(word, Ordering::Release);
                next.wakeup();
            }
            None => self.owner.store(0, Ordering::Release),
        }
    }
}

struct LockWaitStrategy<'a> {
    mutex: &'a RawMutex,
    ctx: &'a Arc<TaskContext>,
    key: Option<WaiterKey>,
}

impl WaitStrategy for LockWaitStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let owner = &self.mutex.owner;
        let mut waiters = self.mutex.waiters.lock();

        let mut cur = owner.load(Ordering::Acquire);
        loop {
            let res = if cur == 0 {
                owner.compare_exchange_weak(
                    0,
                    owner_word(self.ctx.id()),
                    Ordering::Acquire,
                    Ordering::Acquire,
                )
            } else if cur & HAS_WAITERS != 0 {
                break;
            } else {
                owner.compare_exchange_weak(
                    cur,
                    cur | HAS_WAITERS,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
            };

            match res {
                Ok(0) => return EarlyWakeup(true),
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }

        self.key = Some(waiters.append(self.ctx));
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };

        let mut waiters = self.mutex.waiters.lock();
        if waiters.remove(key) && waiters.is_empty() {
            self.mutex.owner.fetch_and(!HAS_WAITERS, Ordering::AcqRel);
        }
    }
}

/// A mutual exclusion primitive for tasks.
///
/// Blocking in [`Mutex::lock`] suspends the calling task, never the worker
/// thread. Contended unlocks hand the lock to the longest waiting task.
///
/// Locking requires a task, the owner of the mutex is the task holding the
/// [`MutexGuard`], which unlocks on drop.
///
/// # Examples
///
/// ```no_run
/// use spindle::sync::Mutex;
/// use std::sync::Arc;
///
/// # let processor = spindle::runtime::Builder::new().try_build().unwrap();
/// let total = processor.block_on(|| {
///     let counter = Arc::new(Mutex::new(0));
///
///     let tasks = (0..8)
///         .map(|_| {
///             let counter = Arc::clone(&counter);
///             spindle::spawn(move || {
///                 *counter.lock().unwrap() += 1;
///             })
///         })
///         .collect::<Vec<_>>();
///     tasks.into_iter().for_each(|t| t.get().unwrap());
///
///     let total = *counter.lock().unwrap();
///     total
/// });
/// assert_eq!(total, 8);
/// ```
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

// Safety: the data is only reachable through a guard, and guards are
// mutually exclusive.
unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            raw: RawMutex::default(),
            data: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Locks the mutex, suspending the current task while it is held
    /// elsewhere.
    ///
    /// Returns an error if the current task is cancelled before the lock is
    /// acquired.
    ///
    /// # Panics
    ///
    /// Panics if called from outside a task, or if the current task already
    /// holds the mutex.
    #[track_caller]
    pub fn lock(&self) -> Result<MutexGuard<'_, T>, WaitInterrupted> {
        let ctx = current::expect_current("Mutex::lock");
        match self.raw.lock(&ctx, Deadline::never()) {
            Ok(()) => Ok(MutexGuard::new(self, ctx.id())),
            Err(WaitError::Cancelled(reason)) => Err(WaitInterrupted::new(reason)),
            Err(WaitError::Timeout) => unreachable!("lock without deadline timed out"),
        }
    }

    /// Locks the mutex, ignoring cancellation of the current task.
    #[track_caller]
    pub fn lock_uninterruptible(&self) -> MutexGuard<'_, T> {
        let ctx = current::expect_current("Mutex::lock_uninterruptible");
        self.raw.lock_uninterruptible(&ctx);
        MutexGuard::new(self, ctx.id())
    }

    /// Locks the mutex if it is free, without suspending.
    #[track_caller]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let id = crate::task::id();
        self.raw
            .try_lock(id)
            .then(|| MutexGuard::new(self, id))
    }

    /// Locks the mutex, giving up once `deadline` is reached or the current
    /// task is cancelled.
    #[track_caller]
    pub fn try_lock_until(&self, deadline: Deadline) -> Result<MutexGuard<'_, T>, WaitError> {
        let ctx = current::expect_current("Mutex::try_lock_until");
        self.raw.lock(&ctx, deadline)?;
        Ok(MutexGuard::new(self, ctx.id()))
    }

    /// Same as `try_lock_until(Deadline::from_duration(timeout))`.
    #[track_caller]
    pub fn try_lock_for(&self, timeout: Duration) -> Result<MutexGuard<'_, T>, WaitError> {
        self.try_lock_until(Deadline::from_duration(timeout))
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// No locking is needed, the borrow guarantees exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> From<T> for Mutex<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the data of a [`Mutex`], unlocking it on drop.
///
/// Guards are not `Send`: the mutex must be unlocked by the task that locked
/// it.
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    owner: TaskId,
    _not_send: PhantomData<*const ()>,
}

// Safety: sharing `&MutexGuard` only gives out `&T`.
unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    fn new(mutex: &'a Mutex<T>, owner: TaskId) -> Self {
        Self {
            mutex,
            owner,
            _not_send: PhantomData,
        }
    }

    pub(super) fn raw(&self) -> &'a RawMutex {
        &self.mutex.raw
    }

    pub(super) fn owner(&self) -> TaskId {
        self.owner
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves the mutex is held.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves the mutex is held, and we borrow it mutably.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock(self.owner);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    assert_impl_all!(Mutex<u32>: Send, Sync);
    assert_impl_all!(Mutex<std::cell::Cell<u32>>: Send, Sync);
    assert_not_impl_any!(MutexGuard<'static, u32>: Send);

    #[test]
    fn test_owner_word_leaves_waiters_bit_free() {
        let id = TaskId::next();
        assert_eq!(owner_word(id) & HAS_WAITERS, 0);
        assert_eq!(owner_word(id) >> 1, id.as_u64());
    }

    #[test]
    fn test_raw_try_lock_and_unlock() {
        let raw = RawMutex::default();
        let (a, b) = (TaskId::next(), TaskId::next());

        assert!(raw.try_lock(a));
        assert!(raw.is_owned_by(a));
        assert!(!raw.try_lock(b));

        raw.unlock(a);
        assert!(!raw.is_locked());
        assert!(raw.try_lock(b));
        assert!(raw.is_owned_by(b));
    }

    #[test]
    fn test_get_mut_and_into_inner() {
        let mut mutex = Mutex::new(vec![1]);
        mutex.get_mut().push(2);
        assert!(!mutex.is_locked());
        assert_eq!(mutex.into_inner(), vec![1, 2]);
    }
}
