use crate::coro::{CoroInput, CoroYielder, Coroutine};
use crate::deadline::Deadline;
use crate::runtime::{AddMode, ProcessorShared};
use crate::task::cancel::{AtomicCancellationReason, CoroUnwinder};
use crate::task::current::{self, CurrentTaskGuard};
use crate::task::local::LocalStorage;
use crate::task::sleep_state::{AtomicSleepState, Epoch, SleepFlags, SleepState, WakeupSource};
use crate::task::state::AtomicTaskState;
use crate::task::{CancellationReason, TaskId, TaskState};
use crate::utils::ScopeGuard;
use crate::wait::{EarlyWakeup, WaitList, WaitStrategy, WaiterKey};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, trace_span};

pub(crate) type Payload = Box<dyn FnOnce() + Send + 'static>;

/// Whether a task may be shed before it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Importance {
    #[default]
    Normal,

    /// Runs its body even if cancelled before the first step, never shed on
    /// overload.
    Critical,
}

/// Why the coroutine switched back to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum YieldReason {
    None,
    Waiting,
    Yield,
    Finished(TaskState),
}

/// Fields only touched by the thread currently stepping the task, from the
/// worker side of `do_step` or from the task body itself.
struct ExecState {
    coro: Option<Coroutine>,
    payload: Option<Payload>,

    /// Valid while `run_body` is on the coroutine stack.
    yielder: *const CoroYielder<'static>,
    yield_reason: YieldReason,
    is_cancellable: bool,
    within_sleep: bool,
    local_storage: LocalStorage,
}

/// State of one logical task.
///
/// Cross-thread state is limited to the sleep-state word, the cancellation
/// reason, the task state and the lock-protected slots. Everything in
/// `ExecState` is single-writer: a task is stepped by at most one worker at a
/// time, and the run queues order consecutive steps.
pub(crate) struct TaskContext {
    id: TaskId,
    importance: Importance,
    processor: Arc<ProcessorShared>,
    self_ref: Weak<TaskContext>,

    state: AtomicTaskState,
    sleep_state: AtomicSleepState,
    cancellation_reason: AtomicCancellationReason,

    /// Task deadline, cancels the task with `Deadline` once reached.
    deadline: Mutex<Deadline>,

    finish_waiters: WaitList,

    /// Finish notification for OS threads outside of any task.
    finish_signal: Mutex<bool>,
    finish_cond: Condvar,

    panic: Mutex<Option<Box<dyn Any + Send + 'static>>>,

    exec: UnsafeCell<ExecState>,
}

// Safety: see `ExecState`.
unsafe impl Send for TaskContext {}
unsafe impl Sync for TaskContext {}

impl TaskContext {
    pub(crate) fn new(
        processor: Arc<ProcessorShared>,
        importance: Importance,
        deadline: Deadline,
        payload: Payload,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: TaskId::next(),
            importance,
            processor,
            self_ref: self_ref.clone(),
            state: AtomicTaskState::new(TaskState::New),
            // Cancel wakeups are ignored until the first step, only the
            // bootstrap wakeup schedules a new task.
            sleep_state: AtomicSleepState::new(SleepState::new(
                Epoch::ZERO,
                SleepFlags::SLEEPING | SleepFlags::NON_CANCELLABLE,
            )),
            cancellation_reason: AtomicCancellationReason::new(),
            deadline: Mutex::new(deadline),
            finish_waiters: WaitList::new(),
            finish_signal: Mutex::new(false),
            finish_cond: Condvar::new(),
            panic: Mutex::new(None),
            exec: UnsafeCell::new(ExecState {
                coro: None,
                payload: Some(payload),
                yielder: ptr::null(),
                yield_reason: YieldReason::None,
                is_cancellable: true,
                within_sleep: false,
                local_storage: LocalStorage::default(),
            }),
        })
    }

    /// # Safety
    ///
    /// Caller must be the thread stepping this task and must not keep the
    /// reference across a suspension or a call that may re-enter `exec`.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    unsafe fn exec(&self) -> &mut ExecState {
        unsafe { &mut *self.exec.get() }
    }

    #[inline]
    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn arc(&self) -> Option<Arc<TaskContext>> {
        self.self_ref.upgrade()
    }

    pub(crate) fn processor(&self) -> &Arc<ProcessorShared> {
        &self.processor
    }

    pub(crate) fn is_critical(&self) -> bool {
        self.importance == Importance::Critical
    }

    #[inline]
    pub(crate) fn state(&self) -> TaskState {
        self.state.load()
    }

    #[inline]
    pub(crate) fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    pub(crate) fn is_current(&self) -> bool {
        current::with_current(|ctx| ptr::eq(ctx, self)).unwrap_or(false)
    }

    #[inline]
    pub(crate) fn epoch(&self) -> Epoch {
        self.sleep_state.load().epoch
    }

    pub(crate) fn take_panic(&self) -> Option<Box<dyn Any + Send + 'static>> {
        self.panic.lock().take()
    }

    pub(crate) fn has_panic(&self) -> bool {
        self.panic.lock().is_some()
    }

    // --- Cancellation ---

    pub(crate) fn cancellation_reason(&self) -> CancellationReason {
        self.cancellation_reason.load()
    }

    #[inline]
    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancellation_reason().is_cancelled()
    }

    /// Only meaningful from the task itself.
    pub(crate) fn is_cancellable(&self) -> bool {
        debug_assert!(self.is_current());
        // Safety: called from the task body.
        unsafe { self.exec() }.is_cancellable
    }

    /// Pending cancellation the task must react to.
    pub(crate) fn should_cancel(&self) -> bool {
        self.is_cancel_requested() && self.is_cancellable()
    }

    /// Returns the previous value.
    pub(crate) fn set_cancellable(&self, value: bool) -> bool {
        debug_assert!(self.is_current());
        // Safety: called from the task body.
        mem::replace(&mut unsafe { self.exec() }.is_cancellable, value)
    }

    /// Records `reason` if no reason was recorded yet and wakes the task if it
    /// sleeps cancellably. Safe to call from any thread.
    pub(crate) fn request_cancel(&self, reason: CancellationReason) {
        if self.cancellation_reason.try_set(reason) {
            trace!(task_id = %self.id, %reason, "cancellation requested");
            self.wakeup(WakeupSource::CancelRequest, self.epoch());
        }
    }

    pub(crate) fn deadline(&self) -> Deadline {
        *self.deadline.lock()
    }

    /// Replaces the task deadline. Only called from the task itself.
    pub(crate) fn set_deadline(&self, deadline: Deadline) {
        debug_assert!(self.is_current());
        *self.deadline.lock() = deadline;
        self.arm_cancellation_timer();
    }

    fn arm_cancellation_timer(&self) {
        let deadline = self.deadline();
        let Some(at) = deadline.instant() else {
            return;
        };

        if deadline.is_reached() {
            self.request_cancel(CancellationReason::Deadline);
        } else {
            self.processor
                .timers()
                .arm_cancel_deadline(at, self.self_ref.clone());
        }
    }

    /// Timer callback for the task deadline. The deadline may have been moved
    /// since the timer was armed.
    pub(crate) fn on_cancel_deadline(&self) {
        if !self.is_finished() && self.deadline().is_reached() {
            self.request_cancel(CancellationReason::Deadline);
        }
    }

    pub(crate) fn with_local_storage<R>(&self, f: impl FnOnce(&mut LocalStorage) -> R) -> R {
        debug_assert!(self.is_current());
        // Safety: called from the task body, `f` only manipulates the map.
        f(&mut unsafe { self.exec() }.local_storage)
    }

    // --- Sleep and wakeup ---

    /// Suspends the current task until a wakeup, the deadline or a
    /// cancellation request. Returns what woke the task up.
    pub(crate) fn sleep(
        &self,
        strategy: &mut dyn WaitStrategy,
        deadline: Deadline,
    ) -> WakeupSource {
        debug_assert!(self.is_current(), "sleep called from another task");
        debug_assert!(
            !mem::replace(&mut unsafe { self.exec() }.within_sleep, true),
            "recursive sleep"
        );
        // Safety: the sleeping task is the current task.
        let _within_sleep = ScopeGuard::new(|| unsafe { self.exec() }.within_sleep = false);

        // A previous sleep woken by both the wait list and a cancellation
        // request only reported the wait list.
        if self.should_cancel() {
            return WakeupSource::CancelRequest;
        }

        let sleep_epoch = self.sleep_state.load().epoch;

        if let EarlyWakeup(true) = strategy.setup_wakeups() {
            self.sleep_state
                .store(SleepState::new(sleep_epoch.next(), SleepFlags::empty()));
            return WakeupSource::WaitList;
        }

        let has_deadline = deadline.is_reachable()
            && (!self.is_cancellable() || deadline < self.deadline());

        if has_deadline && deadline.is_reached() {
            strategy.disable_wakeups();
            let prev = self
                .sleep_state
                .exchange(SleepState::new(sleep_epoch.next(), SleepFlags::empty()));
            return WakeupSource::primary(prev.flags | SleepFlags::WAKEUP_BY_DEADLINE_TIMER);
        }

        if let (true, Some(at)) = (has_deadline, deadline.instant()) {
            self.processor
                .timers()
                .arm_wakeup(at, self.self_ref.clone(), sleep_epoch);
        }

        self.suspend(YieldReason::Waiting);

        strategy.disable_wakeups();

        let prev = self
            .sleep_state
            .exchange(SleepState::new(sleep_epoch.next(), SleepFlags::empty()));
        let source = WakeupSource::primary(prev.flags);
        debug_assert_ne!(source, WakeupSource::None, "no wakeup source for {prev:?}");
        source
    }

    /// Lets other ready tasks run before continuing.
    pub(crate) fn yield_now(&self) {
        debug_assert!(self.is_current());
        self.suspend(YieldReason::Yield);
    }

    fn suspend(&self, reason: YieldReason) {
        let yielder = {
            // Safety: called from the task body.
            let exec = unsafe { self.exec() };
            exec.yield_reason = reason;
            exec.yielder
        };
        debug_assert!(!yielder.is_null());

        // Safety: `run_body` set the yielder and is below us on this stack.
        let input = unsafe { &*yielder }.suspend();
        debug_assert!(matches!(input, CoroInput::Resume));
    }

    /// Delivers a wakeup for the sleep session identified by `epoch`. Only the
    /// first wakeup of a session schedules the task.
    pub(crate) fn wakeup(&self, source: WakeupSource, epoch: Epoch) {
        debug_assert_ne!(source, WakeupSource::Bootstrap);
        if self.is_finished() {
            return;
        }

        let mut prev = self.sleep_state.load();
        loop {
            if prev.epoch != epoch {
                return;
            }
            if source == WakeupSource::CancelRequest
                && prev.flags.contains(SleepFlags::NON_CANCELLABLE)
            {
                return;
            }

            let new = SleepState::new(epoch, prev.flags | source.as_flag());
            match self.sleep_state.compare_exchange(prev, new) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }

        if Self::should_schedule(prev.flags, source) {
            self.schedule(AddMode::Lifo);
        }
    }

    /// First schedule after spawn.
    pub(crate) fn bootstrap(&self) {
        let prev = self
            .sleep_state
            .fetch_or_flags(SleepFlags::WAKEUP_BY_BOOTSTRAP);
        if Self::should_schedule(prev.flags, WakeupSource::Bootstrap) {
            self.schedule(AddMode::Fifo);
        }
    }

    fn should_schedule(mut prev: SleepFlags, source: WakeupSource) -> bool {
        if !prev.contains(SleepFlags::SLEEPING) {
            return false;
        }

        match source {
            // Loses against a non-cancellable sleep and against any other
            // wakeup already delivered.
            WakeupSource::CancelRequest => prev == SleepFlags::SLEEPING,
            WakeupSource::Bootstrap => true,
            _ => {
                if prev.contains(SleepFlags::NON_CANCELLABLE) {
                    prev.remove(SleepFlags::NON_CANCELLABLE | SleepFlags::WAKEUP_BY_CANCEL_REQUEST);
                }
                prev == SleepFlags::SLEEPING
            }
        }
    }

    fn schedule(&self, mode: AddMode) {
        debug_assert_ne!(self.state(), TaskState::Queued);
        let Some(this) = self.arc() else {
            return;
        };

        self.state.set(TaskState::Queued);
        self.processor.schedule(this, mode);
    }

    // --- Execution ---

    /// Runs the task until its next suspension point. Called by workers only.
    pub(crate) fn do_step(self: &Arc<Self>) {
        if self.is_finished() {
            return;
        }

        // Safety: we are the stepping thread and the coroutine is not running.
        let first_step = unsafe { self.exec() }.coro.is_none();
        let mut clear = SleepFlags::SLEEPING;
        if first_step {
            clear |= SleepFlags::WAKEUP_BY_BOOTSTRAP | SleepFlags::NON_CANCELLABLE;
        }
        self.sleep_state.clear_flags(clear);

        let mut coro = if first_step {
            if self.is_cancel_requested() && !self.is_critical() {
                self.finish_without_running();
                return;
            }

            match self.processor.coro_pool().acquire() {
                Ok(coro) => coro,
                Err(e) => {
                    error!(task_id = %self.id, error = %e, "cannot start task");
                    self.cancellation_reason.try_set(CancellationReason::Overload);
                    self.finish_without_running();
                    return;
                }
            }
        } else {
            match unsafe { self.exec() }.coro.take() {
                Some(coro) => coro,
                None => unreachable!("suspended task {} without coroutine", self.id),
            }
        };

        if first_step {
            self.arm_cancellation_timer();
        }

        self.state.set(TaskState::Running);
        {
            let span = trace_span!("step", task_id = %self.id);
            span.follows_from(self.id.as_tracing_id());
            let _entered = span.enter();

            let _current = CurrentTaskGuard::enter(self);
            let input = if first_step {
                CoroInput::Run(NonNull::from(&**self))
            } else {
                CoroInput::Resume
            };
            coro.resume(input);
        }

        // Safety: the coroutine suspended, nothing else touches `exec`.
        let exec = unsafe { self.exec() };
        match mem::replace(&mut exec.yield_reason, YieldReason::None) {
            YieldReason::Finished(state) => {
                self.processor.coro_pool().release(coro);
                self.finish(state);
            }
            YieldReason::Waiting => {
                let cancellable = exec.is_cancellable;
                exec.coro = Some(coro);
                self.state.set(TaskState::Suspended);

                let mut new_flags = SleepFlags::SLEEPING;
                if !cancellable {
                    new_flags |= SleepFlags::NON_CANCELLABLE;
                }

                // From here on another worker may step the task.
                let mut prev = self.sleep_state.fetch_or_flags(new_flags).flags;
                debug_assert!(!prev.contains(SleepFlags::SLEEPING));

                // Wakeup flags delivered before we set `SLEEPING` are kept, so a
                // cancellation request also cancels the next sleep session.
                if !cancellable {
                    prev.remove(SleepFlags::WAKEUP_BY_CANCEL_REQUEST | SleepFlags::NON_CANCELLABLE);
                }
                if !prev.is_empty() {
                    self.schedule(AddMode::Lifo);
                }
            }
            YieldReason::Yield => {
                exec.coro = Some(coro);
                self.schedule(AddMode::Fifo);
            }
            YieldReason::None => {
                unreachable!("task {} switched out without a yield reason", self.id)
            }
        }
    }

    /// Body of the task, running on its coroutine.
    pub(crate) fn run_body(&self, yielder: &CoroYielder<'_>) {
        let payload = {
            // Safety: running on the task's own coroutine.
            let exec = unsafe { self.exec() };
            exec.yielder = (yielder as *const CoroYielder<'_>).cast();
            exec.payload.take()
        };

        let state = match payload {
            Some(payload) if self.is_cancel_requested() && !self.is_critical() => {
                self.set_cancellable(false);
                self.drop_shielded(payload);
                TaskState::Cancelled
            }
            Some(payload) => match panic::catch_unwind(AssertUnwindSafe(payload)) {
                Ok(()) => TaskState::Completed,
                Err(p) if p.is::<CoroUnwinder>() => TaskState::Cancelled,
                Err(p) => {
                    debug!(task_id = %self.id, "task body panicked");
                    *self.panic.lock() = Some(p);
                    TaskState::Completed
                }
            },
            None => {
                debug_assert!(false, "task {} started twice", self.id);
                TaskState::Cancelled
            }
        };

        // Task locals may block in their destructors, they must not be
        // interrupted.
        self.set_cancellable(false);
        let locals = self.with_local_storage(LocalStorage::clear);
        self.drop_shielded(locals);

        // Safety: running on the task's own coroutine.
        let exec = unsafe { self.exec() };
        exec.yield_reason = YieldReason::Finished(state);
        exec.yielder = ptr::null();
    }

    /// Drops values owned by the task body, swallowing panics so they cannot
    /// escape the coroutine.
    fn drop_shielded<T>(&self, value: T) {
        if panic::catch_unwind(AssertUnwindSafe(move || drop(value))).is_err() {
            error!(task_id = %self.id, "panic while dropping task resources");
        }
    }

    /// Finishes a task cancelled before it acquired a coroutine.
    fn finish_without_running(self: &Arc<Self>) {
        // Safety: the task never ran, we are the stepping thread.
        if let Some(payload) = unsafe { self.exec() }.payload.take() {
            self.drop_shielded(payload);
        }
        self.finish(TaskState::Cancelled);
    }

    fn finish(self: &Arc<Self>, state: TaskState) {
        self.state.set(state);
        trace!(task_id = %self.id, %state, reason = %self.cancellation_reason(), "task finished");

        self.processor.on_task_finished(self, state);

        self.finish_waiters.lock().wakeup_all();

        *self.finish_signal.lock() = true;
        self.finish_cond.notify_all();
    }

    /// Finishes a task that will never be scheduled, because its processor
    /// rejected it.
    pub(crate) fn cancel_unstarted(self: &Arc<Self>, reason: CancellationReason) {
        debug_assert_eq!(self.state(), TaskState::New);
        self.cancellation_reason.try_set(reason);
        self.finish_without_running();
    }

    // --- Joining ---

    /// Parks `waiter` until this task finishes, the deadline or cancellation.
    pub(crate) fn wait_finished(&self, waiter: &Arc<TaskContext>, deadline: Deadline) -> WakeupSource {
        assert!(
            !ptr::eq(self, Arc::as_ptr(waiter)),
            "task {} waits for itself, deadlock",
            self.id
        );

        let mut strategy = FinishWaitStrategy {
            target: self,
            waiter,
            key: None,
        };
        waiter.sleep(&mut strategy, deadline)
    }
}

impl TaskContext {
    /// Blocks the calling OS thread until this task finishes or `deadline`
    /// passes. Returns `true` if the task finished.
    pub(crate) fn wait_finished_blocking(&self, deadline: Deadline) -> bool {
        let mut finished = self.finish_signal.lock();
        while !*finished {
            match deadline.instant() {
                Some(at) => {
                    if self.finish_cond.wait_until(&mut finished, at).timed_out() {
                        return *finished;
                    }
                }
                None => self.finish_cond.wait(&mut finished),
            }
        }
        true
    }
}

struct FinishWaitStrategy<'a> {
    target: &'a TaskContext,
    waiter: &'a Arc<TaskContext>,
    key: Option<WaiterKey>,
}

impl WaitStrategy for FinishWaitStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut waiters = self.target.finish_waiters.lock();
        if self.target.is_finished() {
            return EarlyWakeup(true);
        }

        self.key = Some(waiters.append(self.waiter));
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        if let Some(key) = self.key.take() {
            self.target.finish_waiters.remove(key);
        }
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        let exec = self.exec.get_mut();

        // A body suspended mid-way cannot be unwound from here, its stack is
        // leaked instead of being reused while frames still reference it.
        if let Some(coro) = exec.coro.take() {
            error!(
                task_id = %self.id,
                state = %self.state.load(),
                "task destroyed while suspended, leaking its coroutine"
            );
            self.processor.coro_pool().forget_active();
            mem::forget(coro);
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("importance", &self.importance)
            .field("sleep_state", &self.sleep_state.load())
            .field("cancellation_reason", &self.cancellation_reason())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(TaskContext: Send, Sync);

    #[test]
    fn test_should_schedule_first_wakeup_only() {
        let sleeping = SleepFlags::SLEEPING;
        assert!(TaskContext::should_schedule(sleeping, WakeupSource::WaitList));
        assert!(TaskContext::should_schedule(sleeping, WakeupSource::CancelRequest));

        let woken = SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_DEADLINE_TIMER;
        assert!(!TaskContext::should_schedule(woken, WakeupSource::WaitList));
        assert!(!TaskContext::should_schedule(woken, WakeupSource::CancelRequest));
    }

    #[test]
    fn test_should_schedule_requires_sleeping() {
        assert!(!TaskContext::should_schedule(SleepFlags::empty(), WakeupSource::WaitList));
        assert!(!TaskContext::should_schedule(SleepFlags::empty(), WakeupSource::Bootstrap));
    }

    #[test]
    fn test_should_schedule_non_cancellable() {
        let blocked = SleepFlags::SLEEPING | SleepFlags::NON_CANCELLABLE;
        assert!(!TaskContext::should_schedule(blocked, WakeupSource::CancelRequest));

        // A latched cancellation does not count as a previous wakeup.
        let latched = blocked | SleepFlags::WAKEUP_BY_CANCEL_REQUEST;
        assert!(TaskContext::should_schedule(latched, WakeupSource::WaitList));
        assert!(TaskContext::should_schedule(latched, WakeupSource::DeadlineTimer));
    }

    #[test]
    fn test_should_schedule_bootstrap_ignores_cancel() {
        let cancelled_early = SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_CANCEL_REQUEST;
        assert!(TaskContext::should_schedule(cancelled_early, WakeupSource::Bootstrap));
    }
}
