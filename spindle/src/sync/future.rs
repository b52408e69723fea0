use crate::deadline::Deadline;
use crate::error::{FutureError, WaitInterrupted};
use crate::task::sleep_state::WakeupSource;
use crate::task::{TaskContext, current};
use crate::wait::{EarlyWakeup, WaitList, WaitStrategy, WaiterKey};
use parking_lot::Mutex;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Result of waiting on a [`Future`] without consuming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
    /// The promise was fulfilled or dropped, [`Future::get`] will not block.
    Ready,
    Timeout,
    /// The waiting task was cancelled first.
    Cancelled,
}

enum Slot<T> {
    Pending,
    Value(T),
    Broken,
    Taken,
}

struct SharedState<T> {
    slot: Mutex<Slot<T>>,
    ready: AtomicBool,
    waiters: WaitList,
}

impl<T> SharedState<T> {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn complete(&self, slot: Slot<T>) {
        *self.slot.lock() = slot;

        // Waiters check `ready` under the wait list lock before parking.
        let mut waiters = self.waiters.lock();
        self.ready.store(true, Ordering::Release);
        waiters.wakeup_all();
    }
}

/// The producing side of a single value handed to a [`Future`].
///
/// Dropping a promise without calling [`Promise::set_value`] breaks it: the
/// future becomes ready and [`Future::get`] returns
/// [`FutureError::BrokenPromise`].
///
/// Fallible producers use a `Promise<Result<T, E>>`.
///
/// # Examples
///
/// ```no_run
/// use spindle::sync::Promise;
///
/// # let processor = spindle::runtime::Builder::new().try_build().unwrap();
/// let value = processor.block_on(|| {
///     let mut promise = Promise::new();
///     let future = promise.get_future().unwrap();
///
///     spindle::spawn(move || promise.set_value(42)).detach();
///     future.get().unwrap()
/// });
/// assert_eq!(value, 42);
/// ```
pub struct Promise<T> {
    state: Arc<SharedState<T>>,
    retrieved: bool,
    satisfied: bool,
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SharedState {
                slot: Mutex::new(Slot::Pending),
                ready: AtomicBool::new(false),
                waiters: WaitList::new(),
            }),
            retrieved: false,
            satisfied: false,
        }
    }

    /// Returns the consuming side. Only one future exists per promise.
    pub fn get_future(&mut self) -> Result<Future<T>, FutureError> {
        if mem::replace(&mut self.retrieved, true) {
            return Err(FutureError::AlreadyRetrieved);
        }
        Ok(Future {
            state: Arc::clone(&self.state),
        })
    }

    /// Stores the value and wakes the waiting task. Usable from any thread.
    pub fn set_value(mut self, value: T) {
        self.satisfied = true;
        self.state.complete(Slot::Value(value));
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.satisfied {
            self.state.complete(Slot::Broken);
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("retrieved", &self.retrieved)
            .field("ready", &self.state.is_ready())
            .finish()
    }
}

/// The consuming side of a [`Promise`].
pub struct Future<T> {
    state: Arc<SharedState<T>>,
}

impl<T> Future<T> {
    /// Whether [`Future::get`] would return without suspending.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    fn wait_inner(&self, ctx: &Arc<TaskContext>, deadline: Deadline) -> FutureStatus {
        while !self.state.is_ready() {
            let mut strategy = FutureWaitStrategy {
                state: &self.state,
                ctx,
                key: None,
            };

            match ctx.sleep(&mut strategy, deadline) {
                _ if self.state.is_ready() => break,
                WakeupSource::DeadlineTimer => return FutureStatus::Timeout,
                WakeupSource::CancelRequest => return FutureStatus::Cancelled,
                _ => {}
            }
        }
        FutureStatus::Ready
    }

    /// Waits until the promise is fulfilled or broken.
    ///
    /// # Panics
    ///
    /// Panics if called from outside a task.
    #[track_caller]
    pub fn wait(&self) -> FutureStatus {
        let ctx = current::expect_current("Future::wait");
        self.wait_inner(&ctx, Deadline::never())
    }

    #[track_caller]
    pub fn wait_until(&self, deadline: Deadline) -> FutureStatus {
        let ctx = current::expect_current("Future::wait_until");
        self.wait_inner(&ctx, deadline)
    }

    #[track_caller]
    pub fn wait_for(&self, timeout: Duration) -> FutureStatus {
        self.wait_until(Deadline::from_duration(timeout))
    }

    /// Waits for the value and takes it.
    ///
    /// # Errors
    ///
    /// - [`FutureError::BrokenPromise`] if the promise was dropped unfulfilled.
    /// - [`FutureError::Interrupted`] if the waiting task was cancelled first.
    #[track_caller]
    pub fn get(self) -> Result<T, FutureError> {
        let ctx = current::expect_current("Future::get");
        match self.wait_inner(&ctx, Deadline::never()) {
            FutureStatus::Ready => {}
            FutureStatus::Cancelled => {
                return Err(WaitInterrupted::new(ctx.cancellation_reason()).into());
            }
            FutureStatus::Timeout => unreachable!("wait without deadline timed out"),
        }

        match mem::replace(&mut *self.state.slot.lock(), Slot::Taken) {
            Slot::Value(value) => Ok(value),
            Slot::Broken => Err(FutureError::BrokenPromise),
            Slot::Pending | Slot::Taken => unreachable!("ready future without a value"),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.is_ready())
            .finish()
    }
}

struct FutureWaitStrategy<'a, T> {
    state: &'a SharedState<T>,
    ctx: &'a Arc<TaskContext>,
    key: Option<WaiterKey>,
}

impl<T> WaitStrategy for FutureWaitStrategy<'_, T> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut waiters = self.state.waiters.lock();
        if self.state.is_ready() {
            return EarlyWakeup(true);
        }

        self.key = Some(waiters.append(self.ctx));
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.state.waiters.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use std::cell::Cell;

    assert_impl_all!(Promise<Vec<u8>>: Send, Sync);
    assert_impl_all!(Future<Vec<u8>>: Send, Sync);
    assert_not_impl_any!(Future<std::rc::Rc<u8>>: Send);
    assert_impl_all!(Future<Cell<u8>>: Send);

    #[test]
    fn test_future_retrieved_once() {
        let mut promise = Promise::<u32>::new();
        assert!(promise.get_future().is_ok());
        assert_eq!(
            promise.get_future().unwrap_err(),
            FutureError::AlreadyRetrieved
        );
    }

    #[test]
    fn test_ready_once_set() {
        let mut promise = Promise::new();
        let future = promise.get_future().unwrap();
        assert!(!future.is_ready());

        promise.set_value("done");
        assert!(future.is_ready());
        assert!(matches!(*future.state.slot.lock(), Slot::Value("done")));
    }

    #[test]
    fn test_dropped_promise_is_broken() {
        let mut promise = Promise::<u32>::new();
        let future = promise.get_future().unwrap();

        drop(promise);
        assert!(future.is_ready());
        assert!(matches!(*future.state.slot.lock(), Slot::Broken));
    }
}
