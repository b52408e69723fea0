use crate::deadline::Deadline;
use crate::error::{WaitError, WaitInterrupted};
use crate::task::sleep_state::WakeupSource;
use crate::task::{TaskContext, current};
use crate::wait::{EarlyWakeup, LightWaiterKey, WaitListLight, WaitStrategy};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// An auto-reset event with one consumer task and any number of senders.
///
/// A successful wait consumes the signal. Signals sent while nobody waits
/// are kept, several of them collapse into one.
///
/// Two tasks waiting at the same time is a programming error and panics.
pub struct SingleConsumerEvent {
    signal: AtomicBool,
    waiter: WaitListLight,
}

impl SingleConsumerEvent {
    pub const fn new() -> Self {
        Self {
            signal: AtomicBool::new(false),
            waiter: WaitListLight::new(),
        }
    }

    /// Sets the signal and wakes the consumer. Usable from any thread.
    pub fn send(&self) {
        self.signal.store(true, Ordering::SeqCst);
        self.waiter.wakeup_one();
    }

    pub fn is_ready(&self) -> bool {
        self.signal.load(Ordering::SeqCst)
    }

    /// Clears a pending signal.
    pub fn reset(&self) {
        self.signal.store(false, Ordering::SeqCst);
    }

    fn try_consume(&self) -> bool {
        self.signal.swap(false, Ordering::SeqCst)
    }

    fn wait_inner(&self, ctx: &Arc<TaskContext>, deadline: Deadline) -> Result<(), WaitError> {
        while !self.try_consume() {
            let mut strategy = EventWaitStrategy {
                event: self,
                ctx,
                key: None,
            };

            match ctx.sleep(&mut strategy, deadline) {
                WakeupSource::DeadlineTimer if !self.try_consume() => {
                    return Err(WaitError::Timeout);
                }
                WakeupSource::CancelRequest => {
                    return Err(WaitError::Cancelled(ctx.cancellation_reason()));
                }
                WakeupSource::DeadlineTimer => return Ok(()),
                _ => {}
            }
        }
        Ok(())
    }

    /// Waits for the signal and consumes it.
    ///
    /// # Panics
    ///
    /// Panics if called from outside a task, or if another task is already
    /// waiting.
    #[track_caller]
    pub fn wait(&self) -> Result<(), WaitInterrupted> {
        let ctx = current::expect_current("SingleConsumerEvent::wait");
        self.wait_inner(&ctx, Deadline::never()).map_err(|e| match e {
            WaitError::Cancelled(reason) => WaitInterrupted::new(reason),
            WaitError::Timeout => unreachable!("wait without deadline timed out"),
        })
    }

    #[track_caller]
    pub fn wait_until(&self, deadline: Deadline) -> Result<(), WaitError> {
        let ctx = current::expect_current("SingleConsumerEvent::wait_until");
        self.wait_inner(&ctx, deadline)
    }

    #[track_caller]
    pub fn wait_for(&self, timeout: Duration) -> Result<(), WaitError> {
        self.wait_until(Deadline::from_duration(timeout))
    }
}

impl Default for SingleConsumerEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SingleConsumerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleConsumerEvent")
            .field("ready", &self.is_ready())
            .field("waiter", &self.waiter)
            .finish()
    }
}

struct EventWaitStrategy<'a> {
    event: &'a SingleConsumerEvent,
    ctx: &'a Arc<TaskContext>,
    key: Option<LightWaiterKey>,
}

impl WaitStrategy for EventWaitStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let key = self.event.waiter.set_waiter(self.ctx);

        // The signal may have been sent before the waiter was published.
        if self.event.is_ready() {
            self.event.waiter.remove(key);
            return EarlyWakeup(true);
        }

        self.key = Some(key);
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.event.waiter.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(SingleConsumerEvent: Send, Sync);

    #[test]
    fn test_signals_collapse() {
        let event = SingleConsumerEvent::new();
        assert!(!event.is_ready());

        event.send();
        event.send();
        assert!(event.is_ready());
        assert!(event.try_consume());
        assert!(!event.try_consume());

        event.send();
        event.reset();
        assert!(!event.is_ready());
    }
}
