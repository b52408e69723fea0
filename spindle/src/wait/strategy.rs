/// Result of [`WaitStrategy::setup_wakeups`].
///
/// `EarlyWakeup(true)` means the awaited condition already holds and the task
/// must not suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EarlyWakeup(pub(crate) bool);

/// How a blocking primitive registers and unregisters its waiter around a
/// task sleep.
///
/// `setup_wakeups` runs after the sleep epoch is recorded and before the task
/// suspends, typically linking the task into a wait list under the
/// primitive's lock after re-checking the condition. `disable_wakeups` runs
/// once the task resumed, whatever woke it, and must unlink the task if it is
/// still linked.
pub(crate) trait WaitStrategy {
    fn setup_wakeups(&mut self) -> EarlyWakeup;

    fn disable_wakeups(&mut self);
}
