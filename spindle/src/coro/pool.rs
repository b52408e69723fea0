use crate::coro::Coroutine;
use crate::error::EngineError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolConfig {
    /// Coroutines allocated up front.
    pub(crate) initial_size: usize,

    /// Upper bound on idle coroutines kept for reuse.
    pub(crate) max_size: usize,

    pub(crate) stack_size: usize,
}

/// Point-in-time counters of a [`CoroutinePool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoroutinePoolStats {
    /// Coroutines currently running a task body.
    pub active: usize,

    /// Coroutines alive, active or idle.
    pub total: usize,

    /// Stack allocations performed since the pool was created.
    pub allocated: usize,
}

/// Cache of coroutine stacks.
///
/// Idle coroutines are reused in LIFO order so the most recently touched
/// stack, likely still in cache, runs the next task.
#[derive(Debug)]
pub(crate) struct CoroutinePool {
    cfg: PoolConfig,
    idle: Mutex<Vec<Coroutine>>,
    active: AtomicUsize,
    total: AtomicUsize,
    allocated: AtomicUsize,
}

impl CoroutinePool {
    pub(crate) fn new(cfg: PoolConfig) -> Result<Self, EngineError> {
        let pool = Self {
            cfg,
            idle: Mutex::new(Vec::with_capacity(cfg.max_size.min(1024))),
            active: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        };

        let initial = (0..cfg.initial_size)
            .map(|_| pool.allocate())
            .collect::<Result<Vec<_>, _>>()?;
        *pool.idle.lock() = initial;

        debug!(
            initial_size = cfg.initial_size,
            stack_size = cfg.stack_size,
            "coroutine pool ready"
        );
        Ok(pool)
    }

    fn allocate(&self) -> Result<Coroutine, EngineError> {
        let coro = Coroutine::new(self.cfg.stack_size)?;
        self.total.fetch_add(1, Ordering::Relaxed);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(coro)
    }

    pub(crate) fn acquire(&self) -> Result<Coroutine, EngineError> {
        let coro = match self.idle.lock().pop() {
            Some(coro) => coro,
            None => self.allocate().inspect_err(|e| {
                warn!(error = %e, total = self.total(), "coroutine stack allocation failed");
            })?,
        };

        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(coro)
    }

    /// Returns an idle coroutine. Surplus beyond `max_size` is destroyed.
    pub(crate) fn release(&self, coro: Coroutine) {
        self.active.fetch_sub(1, Ordering::Relaxed);

        let surplus = {
            let mut idle = self.idle.lock();
            if idle.len() < self.cfg.max_size {
                idle.push(coro);
                None
            } else {
                Some(coro)
            }
        };

        if let Some(coro) = surplus {
            drop(coro);
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// A coroutine that will never come back, because its task was leaked.
    pub(crate) fn forget_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.total.fetch_sub(1, Ordering::Relaxed);
    }

    fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub(crate) fn stats(&self) -> CoroutinePoolStats {
        CoroutinePoolStats {
            active: self.active.load(Ordering::Relaxed),
            total: self.total(),
            allocated: self.allocated.load(Ordering::Relaxed),
        }
    }
}
