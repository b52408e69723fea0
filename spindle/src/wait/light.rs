use crate::task::TaskContext;
use crate::task::sleep_state::{Epoch, WakeupSource};
use std::fmt;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Slot {
    ctx: Arc<TaskContext>,
    epoch: Epoch,
}

/// Handle to the waiter registered by [`WaitListLight::set_waiter`], needed
/// to unregister it.
#[derive(Debug)]
pub(crate) struct LightWaiterKey(*mut Slot);

// Safety: only compared against the slot pointer, never dereferenced by the
// key holder.
unsafe impl Send for LightWaiterKey {}

/// A wait list holding at most one waiter, in a single atomic word.
///
/// No lock is taken on any path. Registering a second waiter while one is
/// parked is a programming error.
pub(crate) struct WaitListLight {
    waiter: AtomicPtr<Slot>,
}

impl WaitListLight {
    pub(crate) const fn new() -> Self {
        Self {
            waiter: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Parks `ctx` for its current sleep.
    #[track_caller]
    pub(crate) fn set_waiter(&self, ctx: &Arc<TaskContext>) -> LightWaiterKey {
        let slot = Box::into_raw(Box::new(Slot {
            ctx: Arc::clone(ctx),
            epoch: ctx.epoch(),
        }));

        if self
            .waiter
            .compare_exchange(ptr::null_mut(), slot, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Safety: `slot` was never published.
            drop(unsafe { Box::from_raw(slot) });
            panic!(
                "task {} waits on a single-waiter list that already has a waiter",
                ctx.id()
            );
        }

        LightWaiterKey(slot)
    }

    /// Wakes the waiter, if any.
    pub(crate) fn wakeup_one(&self) -> bool {
        let slot = self.waiter.swap(ptr::null_mut(), Ordering::AcqRel);
        if slot.is_null() {
            return false;
        }

        // Safety: the swap transferred ownership of the slot to us.
        let slot = unsafe { Box::from_raw(slot) };
        slot.ctx.wakeup(WakeupSource::WaitList, slot.epoch);
        true
    }

    /// Unregisters a waiter that stopped waiting. A no-op if it was already
    /// woken.
    pub(crate) fn remove(&self, key: LightWaiterKey) -> bool {
        let removed = self
            .waiter
            .compare_exchange(key.0, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

        if removed {
            // Safety: the exchange transferred ownership of the slot to us.
            drop(unsafe { Box::from_raw(key.0) });
        }
        removed
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiter.load(Ordering::Acquire).is_null()
    }
}

impl Default for WaitListLight {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitListLight {
    fn drop(&mut self) {
        let slot = *self.waiter.get_mut();
        if !slot.is_null() {
            // Safety: nobody else can reach the slot through `&mut self`.
            drop(unsafe { Box::from_raw(slot) });
        }
    }
}

impl fmt::Debug for WaitListLight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitListLight")
            .field("has_waiter", &!self.is_empty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::current;
    use crate::test_utils::init_processor;
    use anyhow::Result;
    use static_assertions::assert_impl_all;
    use std::panic::{self, AssertUnwindSafe};

    assert_impl_all!(WaitListLight: Send, Sync);

    #[test]
    fn test_empty_wakeup_is_noop() {
        let list = WaitListLight::new();
        assert!(list.is_empty());
        assert!(!list.wakeup_one());
    }

    #[test]
    fn test_remove_after_wakeup_is_noop() -> Result<()> {
        let processor = init_processor(1)?;

        processor.block_on(|| {
            let ctx = current::expect_current("test");
            let list = WaitListLight::new();

            let stale = list.set_waiter(&ctx);
            assert!(!list.is_empty());
            assert!(list.wakeup_one());
            assert!(!list.remove(stale));
            assert!(list.is_empty());

            let key = list.set_waiter(&ctx);
            assert!(list.remove(key));
            assert!(!list.wakeup_one());
        });

        processor.shutdown()
    }

    #[test]
    fn test_second_waiter_panics() -> Result<()> {
        let processor = init_processor(1)?;

        let message = processor.block_on(|| {
            let ctx = current::expect_current("test");
            let list = WaitListLight::new();
            let key = list.set_waiter(&ctx);

            let res = panic::catch_unwind(AssertUnwindSafe(|| list.set_waiter(&ctx)));
            let message = res
                .err()
                .and_then(|p| p.downcast::<String>().ok())
                .map(|s| *s);

            // The first waiter is still registered.
            assert!(list.remove(key));
            message
        });

        assert!(message.is_some_and(|m| m.contains("already has a waiter")));
        processor.shutdown()
    }
}
