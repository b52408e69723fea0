use crate::coro::{CoroutinePool, PoolConfig};
use crate::deadline::Deadline;
use crate::error::EngineError;
use crate::runtime::counter::Counters;
use crate::runtime::parking::Parking;
use crate::runtime::pool::ThreadPool;
use crate::runtime::registry::TaskRegistry;
use crate::runtime::timer::{TimerQueue, spawn_timer_thread};
use crate::runtime::{AddMode, Builder, ProcessorConfig, ProcessorStats, SpawnBuilder, worker};
use crate::task::context::{Importance, Payload};
use crate::task::{CancellationReason, TaskContext, TaskState, TaskWithResult, current};
use anyhow::{Result, anyhow};
use crossbeam_deque::Injector;
use parking_lot::Mutex;
use std::fmt;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// State of a task processor shared by its workers, its timer thread and
/// every task it runs.
pub(crate) struct ProcessorShared {
    cfg: ProcessorConfig,

    /// The global injector queue for new, yielding and externally woken tasks.
    injector: Injector<Arc<TaskContext>>,

    parking: Parking,

    tasks: TaskRegistry,

    coro_pool: CoroutinePool,

    timers: Arc<TimerQueue>,

    counters: Counters,

    /// Workers leave their loop once set.
    shutdown: AtomicBool,
}

impl ProcessorShared {
    fn new(cfg: ProcessorConfig) -> Result<Self, EngineError> {
        let coro_pool = CoroutinePool::new(PoolConfig {
            initial_size: cfg.initial_coro_pool_size,
            max_size: cfg.max_coro_pool_size,
            stack_size: cfg.coro_stack_size,
        })?;

        Ok(Self {
            parking: Parking::new(cfg.worker_threads),
            cfg,
            injector: Injector::new(),
            tasks: TaskRegistry::new(),
            coro_pool,
            timers: Arc::new(TimerQueue::new()),
            counters: Counters::default(),
            shutdown: AtomicBool::new(false),
        })
    }

    pub(crate) fn cfg(&self) -> &ProcessorConfig {
        &self.cfg
    }

    pub(crate) fn name(&self) -> &str {
        &self.cfg.name
    }

    pub(crate) fn coro_pool(&self) -> &CoroutinePool {
        &self.coro_pool
    }

    pub(crate) fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub(super) fn injector(&self) -> &Injector<Arc<TaskContext>> {
        &self.injector
    }

    pub(super) fn parking(&self) -> &Parking {
        &self.parking
    }

    pub(super) fn shutdown_flag(&self) -> &AtomicBool {
        &self.shutdown
    }

    pub(super) fn on_dequeued(&self) {
        self.counters.on_dequeued();
    }

    fn is_current(self: &Arc<Self>) -> bool {
        current::with_current(|ctx| Arc::ptr_eq(ctx.processor(), self)).unwrap_or(false)
    }

    fn is_overloaded(&self, queued: usize) -> bool {
        self.cfg
            .task_queue_length_limit
            .is_some_and(|limit| queued >= limit)
    }

    /// Queues a task that became ready.
    pub(crate) fn schedule(&self, ctx: Arc<TaskContext>, mode: AddMode) {
        if self.tasks.is_closed() {
            ctx.request_cancel(CancellationReason::Shutdown);
        }

        let queued = self.counters.on_queued();
        if self.is_overloaded(queued) && !ctx.is_critical() && !ctx.is_cancel_requested() {
            self.counters.on_overloaded();
            trace!(task_id = %ctx.id(), queued, "queue length limit exceeded, cancelling task");
            ctx.request_cancel(CancellationReason::Overload);
        }

        let ctx = match mode {
            AddMode::Lifo => match worker::try_push_local(self, ctx) {
                Ok(()) => {
                    self.parking.unpark_one();
                    return;
                }
                Err(ctx) => ctx,
            },
            AddMode::Fifo => ctx,
        };

        self.injector.push(ctx);
        self.parking.unpark_one();
    }

    pub(crate) fn on_task_finished(&self, ctx: &Arc<TaskContext>, state: TaskState) {
        self.counters.on_finished(state);
        self.tasks.remove(&ctx.id());
    }

    pub(crate) fn spawn<F, T>(
        self: &Arc<Self>,
        importance: Importance,
        deadline: Deadline,
        f: F,
    ) -> TaskWithResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        let payload: Payload = Box::new(move || {
            let value = f();
            *slot.lock() = Some(value);
        });

        let ctx = TaskContext::new(Arc::clone(self), importance, deadline, payload);
        self.counters.on_created();

        if self.tasks.insert(&ctx) {
            trace!(task_id = %ctx.id(), processor = %self.name(), "task spawned");
            ctx.bootstrap();
        } else {
            ctx.cancel_unstarted(CancellationReason::Shutdown);
        }

        TaskWithResult::new(ctx, result)
    }

    pub(crate) fn try_spawn<F, T>(
        self: &Arc<Self>,
        importance: Importance,
        deadline: Deadline,
        f: F,
    ) -> Result<TaskWithResult<T>, EngineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.tasks.is_closed() {
            return Err(EngineError::ShuttingDown);
        }
        if importance != Importance::Critical && self.is_overloaded(self.counters.queued()) {
            self.counters.on_overloaded();
            return Err(EngineError::Overloaded);
        }

        Ok(self.spawn(importance, deadline, f))
    }

    /// Makes workers leave their loop, whatever is still queued.
    pub(super) fn stop_workers(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.parking.unpark_all();
    }

    fn stats(&self) -> ProcessorStats {
        self.counters.snapshot(
            self.cfg.worker_threads,
            self.tasks.len(),
            self.coro_pool.stats(),
        )
    }
}

impl fmt::Debug for ProcessorShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessorShared")
            .field("name", &self.cfg.name)
            .field("worker_threads", &self.cfg.worker_threads)
            .field("tasks", &self.tasks.len())
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A named pool of worker threads running tasks.
///
/// Dropping the processor shuts it down, see [`TaskProcessor::shutdown`].
#[derive(Debug)]
pub struct TaskProcessor {
    shared: Arc<ProcessorShared>,
    pool: ThreadPool,
    timer_thread: Mutex<Option<thread::JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl TaskProcessor {
    /// Same as `Builder::new()`.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn start(cfg: ProcessorConfig) -> Result<Self> {
        let shared = Arc::new(ProcessorShared::new(cfg)?);

        let timer_thread =
            spawn_timer_thread(format!("{}-timer", shared.name()), Arc::clone(&shared.timers))?;

        let pool = match ThreadPool::start(&shared) {
            Ok(pool) => pool,
            Err(e) => {
                shared.timers.stop();
                if timer_thread.join().is_err() {
                    error!("timer thread panicked");
                }
                return Err(e);
            }
        };

        info!(
            processor = %shared.name(),
            worker_threads = shared.cfg.worker_threads,
            "task processor started"
        );

        Ok(Self {
            shared,
            pool,
            timer_thread: Mutex::new(Some(timer_thread)),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Spawns `f` as a new task.
    ///
    /// Tasks spawned after shutdown began finish immediately as cancelled with
    /// [`CancellationReason::Shutdown`].
    pub fn spawn<F, T>(&self, f: F) -> TaskWithResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.shared.spawn(Importance::Normal, Deadline::never(), f)
    }

    /// Spawns a task that runs its body even if cancelled before its first
    /// step and is never shed on overload.
    pub fn spawn_critical<F, T>(&self, f: F) -> TaskWithResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.shared.spawn(Importance::Critical, Deadline::never(), f)
    }

    pub fn spawn_builder(&self) -> SpawnBuilder {
        SpawnBuilder::with_processor(Arc::clone(&self.shared))
    }

    /// Like [`TaskProcessor::spawn`], but sheds load instead of queueing a task
    /// doomed to be cancelled.
    pub fn try_spawn<F, T>(&self, f: F) -> Result<TaskWithResult<T>, EngineError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.shared
            .try_spawn(Importance::Normal, Deadline::never(), f)
    }

    /// Runs `f` as a task and blocks the calling OS thread until it finishes.
    ///
    /// A panic in `f` is resumed on the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if called from a task, or if the task was cancelled before
    /// producing a value.
    #[track_caller]
    pub fn block_on<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        assert!(
            !current::is_inside_task(),
            "block_on must not be called from a task, it would block a worker thread"
        );

        match self.spawn_critical(f).get() {
            Ok(value) => value,
            Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
            Err(e) => panic!("block_on task did not complete: {e}"),
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        self.shared.stats()
    }

    /// Stops the processor.
    ///
    /// New tasks are rejected, every alive task is cancelled with
    /// [`CancellationReason::Shutdown`] and the calling thread blocks until they
    /// all finished or `shutdown_timeout` passed, then workers are joined.
    /// Tasks still alive after the timeout are reported as an error and
    /// destroyed without being resumed.
    pub fn shutdown(self) -> Result<()> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        assert!(
            !self.shared.is_current(),
            "task processor shut down from one of its own tasks"
        );

        let shared = &self.shared;
        debug!(processor = %shared.name(), tasks = shared.tasks.len(), "shutting down");

        shared.tasks.close_and_cancel_all();
        let deadline = Instant::now() + shared.cfg.shutdown_timeout;
        let drained = shared.tasks.wait_drained(deadline);
        if !drained {
            warn!(
                processor = %shared.name(),
                tasks = shared.tasks.len(),
                timeout = ?shared.cfg.shutdown_timeout,
                "tasks still alive after shutdown timeout"
            );
        }

        shared.stop_workers();
        let joined = self.pool.join_all();

        shared.timers.stop();
        if let Some(handle) = self.timer_thread.lock().take()
            && handle.join().is_err()
        {
            error!(processor = %shared.name(), "timer thread panicked");
        }

        // Break the task <-> processor reference cycle of leftover tasks.
        let leftover = shared.tasks.drain();
        while shared.injector.steal().is_success() {}

        info!(processor = %shared.name(), "task processor stopped");

        joined?;
        if drained {
            Ok(())
        } else {
            Err(anyhow!(
                "{} task(s) did not finish within {:?} of shutdown",
                leftover,
                shared.cfg.shutdown_timeout
            ))
        }
    }
}

impl Drop for TaskProcessor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_inner() {
            error!(processor = %self.shared.name(), error = %e, "error during shutdown");
            debug_assert!(false, "error during task processor shutdown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_processor;
    use std::time::Duration;
    use static_assertions::assert_impl_all;

    assert_impl_all!(ProcessorShared: Send, Sync);
    assert_impl_all!(TaskProcessor: Send, Sync);

    #[test]
    fn test_block_on_returns_value() -> Result<()> {
        let processor = init_processor(2)?;
        assert_eq!(processor.block_on(|| 6 * 7), 42);
        processor.shutdown()
    }

    #[test]
    fn test_spawn_from_foreign_thread() -> Result<()> {
        let processor = init_processor(2)?;

        let tasks = (0..16)
            .map(|i| processor.spawn(move || i * 2))
            .collect::<Vec<_>>();
        let sum = tasks
            .into_iter()
            .map(|t| t.get())
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .sum::<usize>();

        assert_eq!(sum, (0..16).map(|i| i * 2).sum());
        processor.shutdown()
    }

    #[test]
    fn test_stats_track_finished_tasks() -> Result<()> {
        let processor = init_processor(1)?;

        processor.spawn(|| ()).get()?;
        let cancelled = processor.spawn(|| {
            let _ = crate::sleep_for(Duration::from_secs(60));
            crate::current_task::cancellation_point();
        });
        cancelled.sync_cancel();

        let stats = processor.stats();
        assert_eq!(stats.worker_threads, 1);
        assert_eq!(stats.tasks_created, 2);
        assert_eq!(stats.tasks_completed, 1);
        assert_eq!(stats.tasks_cancelled, 1);
        assert_eq!(stats.tasks_alive, 0);
        assert_eq!(stats.coro_pool.active, 0);
        processor.shutdown()
    }

    #[test]
    fn test_shutdown_cancels_sleeping_tasks() -> Result<()> {
        let processor = init_processor(2)?;

        let sleeper = processor.spawn(|| crate::sleep_for(Duration::from_secs(60)));
        let token = sleeper.cancellation_token();
        sleeper.detach();

        processor.shutdown()?;
        assert_eq!(token.cancellation_reason(), CancellationReason::Shutdown);
        Ok(())
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_worker_threads_are_named() -> Result<()> {
        let processor = init_processor(1)?;

        let name = processor.block_on(|| {
            crate::utils::thread::get_current_thread_name()
        })?;
        assert_eq!(name, "test-0");
        processor.shutdown()
    }
}
