use crate::error::EngineError;
use crate::runtime::TaskProcessor;
use crate::utils::sys::get_page_size;
use anyhow::Result;
use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Default name of a task processor.
const PROCESSOR_NAME: &str = "main";

/// Stack reserved for each coroutine.
const CORO_STACK_SIZE: usize = 256 * 1024;

/// Smallest coroutine stack we accept, below this even the task prologue
/// overflows.
const MIN_CORO_STACK_SIZE: usize = 16 * 1024;

/// Coroutines allocated when the processor starts.
const INITIAL_CORO_POOL_SIZE: usize = 64;

/// Idle coroutines kept for reuse.
const MAX_CORO_POOL_SIZE: usize = 4096;

/// Global queue interval default value.
const GLOBAL_QUEUE_INTERVAL: u32 = 31;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

/// How long shutdown waits for cancelled tasks to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn(processor: &str) -> ThreadNameFn {
    let worker_count = Arc::new(AtomicUsize::new(0));
    let processor = processor.to_owned();

    ThreadNameFn(Arc::new(move || {
        let id = worker_count.fetch_add(1, Ordering::Relaxed);
        format!("{processor}-{id}")
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

/// Configures and starts a [`TaskProcessor`].
///
/// ```no_run
/// use spindle::runtime::Builder;
///
/// let processor = Builder::new()
///     .name("fs")
///     .worker_threads(4)
///     .task_queue_length_limit(10_000)
///     .try_build()
///     .unwrap();
///
/// let answer = processor.block_on(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
#[derive(Debug)]
pub struct Builder {
    name: String,

    /// Defaults to 1 worker per core.
    worker_threads: Option<usize>,

    /// `None` derives worker names from the processor name.
    thread_name: Option<ThreadNameFn>,

    thread_stack_size: Option<usize>,

    coro_stack_size: usize,

    initial_coro_pool_size: usize,

    max_coro_pool_size: usize,

    /// How many ticks before pulling a task from the global injector queue.
    global_queue_interval: u32,

    /// How many times a worker will loop over the global injector queue and
    /// other stealable queues to try and find work, before parking.
    max_steal_retries: usize,

    task_queue_length_limit: Option<usize>,

    shutdown_timeout: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            name: PROCESSOR_NAME.to_owned(),
            worker_threads: None,
            thread_name: None,
            thread_stack_size: None,
            coro_stack_size: CORO_STACK_SIZE,
            initial_coro_pool_size: INITIAL_CORO_POOL_SIZE,
            max_coro_pool_size: MAX_CORO_POOL_SIZE,
            global_queue_interval: GLOBAL_QUEUE_INTERVAL,
            max_steal_retries: MAX_STEAL_RETRIES,
            task_queue_length_limit: None,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }

    /// Name of the processor, used in logs and in default thread names.
    #[track_caller]
    pub fn name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        assert!(!val.is_empty(), "name must not be empty");
        self.name = val;
        self
    }

    /// Defaults to 1 worker per CPU core.
    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    /// Sets name of worker threads.
    ///
    /// The default name is "{processor}-{id}", where id is monotonically
    /// increasing.
    ///
    /// Thread names are truncated beyond 15 bytes according to pthread
    /// limitations.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = Some(ThreadNameFn(Arc::new(move || val.clone())));
        self
    }

    /// Sets a function used to generate the name of worker threads.
    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = Some(ThreadNameFn(Arc::new(f)));
        self
    }

    /// Sets the stack size (in bytes) for worker threads. Task bodies run on
    /// coroutine stacks, see [`Builder::coro_stack_size`].
    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Stack size of every coroutine. Deep recursion in a task body overflows
    /// into a guard page and aborts the process.
    #[track_caller]
    pub fn coro_stack_size(mut self, val: usize) -> Self {
        assert!(
            val >= MIN_CORO_STACK_SIZE,
            "coro_stack_size must be at least {MIN_CORO_STACK_SIZE}"
        );
        self.coro_stack_size = val;
        self
    }

    /// Coroutines allocated up front, so the first tasks do not pay for stack
    /// allocation.
    pub fn initial_coro_pool_size(mut self, val: usize) -> Self {
        self.initial_coro_pool_size = val;
        self
    }

    /// Upper bound on idle coroutines kept for reuse. More coroutines may be
    /// alive at once, the surplus is freed when their tasks finish.
    #[track_caller]
    pub fn max_coro_pool_size(mut self, val: usize) -> Self {
        assert!(val > 0, "max_coro_pool_size must be greater than 0");
        self.max_coro_pool_size = val;
        self
    }

    /// Sets the number of scheduler ticks after which a worker takes its next
    /// task from the global injector queue instead of its local queue.
    ///
    /// A tick corresponds to one task step. Smaller values favour newly
    /// spawned and yielding tasks over local work, at the cost of more
    /// synchronization.
    #[track_caller]
    pub fn global_queue_interval(mut self, val: u32) -> Self {
        assert!(val > 0, "global_queue_interval must be greater than 0");
        self.global_queue_interval = val;
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    /// Non-critical tasks scheduled while more than `val` tasks are queued
    /// are cancelled with [`Overload`](crate::task::CancellationReason::Overload).
    #[track_caller]
    pub fn task_queue_length_limit(mut self, val: usize) -> Self {
        assert!(val > 0, "task_queue_length_limit must be greater than 0");
        self.task_queue_length_limit = Some(val);
        self
    }

    /// How long shutdown waits for cancelled tasks to finish before giving up.
    pub fn shutdown_timeout(mut self, val: Duration) -> Self {
        self.shutdown_timeout = val;
        self
    }

    /// Creates the configured [`TaskProcessor`], with its workers running.
    pub fn try_build(self) -> Result<TaskProcessor> {
        let cfg = ProcessorConfig::try_from(self)?;
        TaskProcessor::start(cfg)
    }
}

// Export builder as a ProcessorConfig object to be consumed by the processor
// and its workers.
#[derive(Debug, Clone)]
pub(crate) struct ProcessorConfig {
    pub(crate) name: String,
    pub(crate) worker_threads: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) coro_stack_size: usize,
    pub(crate) initial_coro_pool_size: usize,
    pub(crate) max_coro_pool_size: usize,
    pub(crate) global_queue_interval: u32,
    pub(crate) max_steal_retries: usize,
    pub(crate) task_queue_length_limit: Option<usize>,
    pub(crate) shutdown_timeout: Duration,
}

impl ProcessorConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.initial_coro_pool_size > self.max_coro_pool_size {
            return Err(EngineError::InvalidConfig(format!(
                "initial_coro_pool_size ({}) exceeds max_coro_pool_size ({})",
                self.initial_coro_pool_size, self.max_coro_pool_size
            )));
        }

        let page_size = get_page_size();
        if !self.coro_stack_size.is_multiple_of(page_size) {
            return Err(EngineError::InvalidConfig(format!(
                "coro_stack_size ({}) is not a multiple of the page size ({page_size})",
                self.coro_stack_size
            )));
        }

        let reserved = self
            .max_coro_pool_size
            .saturating_mul(self.coro_stack_size);
        check_address_space_limit(reserved)
    }
}

impl TryFrom<Builder> for ProcessorConfig {
    type Error = anyhow::Error;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let worker_threads = match builder.worker_threads {
            Some(n) => n,
            None => thread::available_parallelism()?.get(),
        };

        let thread_name = builder
            .thread_name
            .unwrap_or_else(|| default_thread_name_fn(&builder.name));

        let cfg = ProcessorConfig {
            name: builder.name,
            worker_threads,
            thread_name,
            thread_stack_size: builder.thread_stack_size,
            coro_stack_size: builder.coro_stack_size,
            initial_coro_pool_size: builder.initial_coro_pool_size,
            max_coro_pool_size: builder.max_coro_pool_size,
            global_queue_interval: builder.global_queue_interval,
            max_steal_retries: builder.max_steal_retries,
            task_queue_length_limit: builder.task_queue_length_limit,
            shutdown_timeout: builder.shutdown_timeout,
        };

        cfg.validate()?;

        Ok(cfg)
    }
}

/// Checks that reserving `desired_bytes` of coroutine stacks fits the soft
/// address-space limit of the process.
fn check_address_space_limit(desired_bytes: usize) -> Result<(), EngineError> {
    let mut rlimit = std::mem::MaybeUninit::<libc::rlimit>::uninit();
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_AS, rlimit.as_mut_ptr()) };

    if ret != 0 {
        return Err(EngineError::InvalidConfig(format!(
            "getrlimit failed: {}",
            io::Error::last_os_error()
        )));
    }

    let rlimit = unsafe { rlimit.assume_init() };
    if rlimit.rlim_cur == libc::RLIM_INFINITY {
        return Ok(());
    }

    let current_limit = usize::try_from(rlimit.rlim_cur).unwrap_or(usize::MAX);
    if desired_bytes > current_limit {
        Err(EngineError::InvalidConfig(format!(
            "Coroutine stacks may reserve {desired_bytes} bytes, above the address space \
             limit ({current_limit}). Lower max_coro_pool_size or coro_stack_size, or raise \
             the limit with '$ ulimit -v unlimited'."
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(ProcessorConfig: Send, Sync, Clone);
    assert_impl_all!(Builder: Send, Sync);

    #[test]
    fn test_defaults() -> Result<()> {
        let cfg = ProcessorConfig::try_from(Builder::new().worker_threads(2))?;

        assert_eq!(cfg.name, "main");
        assert_eq!(cfg.worker_threads, 2);
        assert_eq!(cfg.coro_stack_size, 256 * 1024);
        assert_eq!(cfg.initial_coro_pool_size, 64);
        assert_eq!(cfg.max_coro_pool_size, 4096);
        assert_eq!(cfg.global_queue_interval, 31);
        assert_eq!(cfg.max_steal_retries, 3);
        assert_eq!(cfg.task_queue_length_limit, None);
        assert_eq!(cfg.shutdown_timeout, Duration::from_secs(10));
        Ok(())
    }

    #[test]
    fn test_default_thread_names_follow_processor_name() -> Result<()> {
        let cfg = ProcessorConfig::try_from(Builder::new().name("fs").worker_threads(1))?;

        assert_eq!(cfg.thread_name.0(), "fs-0");
        assert_eq!(cfg.thread_name.0(), "fs-1");
        Ok(())
    }

    #[test]
    fn test_initial_pool_above_max_is_rejected() {
        let res = ProcessorConfig::try_from(
            Builder::new()
                .worker_threads(1)
                .initial_coro_pool_size(10)
                .max_coro_pool_size(5),
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_unaligned_coro_stack_is_rejected() {
        let res = ProcessorConfig::try_from(
            Builder::new()
                .worker_threads(1)
                .coro_stack_size(64 * 1024 + 1),
        );
        assert!(res.is_err_and(|e| e.to_string().contains("page size")));
    }

    #[rstest]
    #[case::zero_workers(|b: Builder| b.worker_threads(0))]
    #[case::zero_interval(|b: Builder| b.global_queue_interval(0))]
    #[case::tiny_stack(|b: Builder| b.coro_stack_size(1024))]
    #[case::zero_queue_limit(|b: Builder| b.task_queue_length_limit(0))]
    #[should_panic]
    fn test_invalid_setters_panic(#[case] f: fn(Builder) -> Builder) {
        f(Builder::new());
    }
}
