use crate::runtime::parking::Unparker;
use crate::runtime::ticker::{Ticker, TickerData, TickerEvents};
use crate::runtime::{ProcessorConfig, ProcessorShared};
use crate::task::TaskContext;
use crossbeam_deque::{Stealer, Worker as CbWorker};
use std::cell::{Cell, RefCell};
use std::iter;
use std::ops::ControlFlow;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, trace};

pub(crate) type Task = Arc<TaskContext>;

thread_local! {
    static CURRENT_WORKER: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

// Read on every call: a task body calling into the scheduler may have moved to
// another worker thread since its previous step.
#[inline(never)]
fn current_worker_ptr() -> *const Worker {
    CURRENT_WORKER.with(Cell::get)
}

/// Pushes `task` onto the local queue of the current thread's worker if that
/// worker belongs to `processor`, otherwise gives the task back.
pub(crate) fn try_push_local(processor: &ProcessorShared, task: Task) -> Result<(), Task> {
    // Safety: the pointer is set by `Worker::run` for the duration of the
    // loop, on this thread only.
    match unsafe { current_worker_ptr().as_ref() } {
        Some(worker) if ptr::eq(Arc::as_ptr(&worker.shared), processor) => {
            worker.local.push(task);
            Ok(())
        }
        _ => Err(task),
    }
}

#[derive(Debug)]
pub(crate) struct Worker {
    shared: Arc<ProcessorShared>,

    /// Determines how we run the event loop.
    policy: RefCell<EventLoopPolicy>,

    /// Event loop ticker.
    ticker: RefCell<Ticker>,

    /// Whether we should try to find our next task in the global queue.
    pop_global_queue: Cell<bool>,

    /// Local queue, FIFO so a task woken repeatedly cannot starve older local
    /// work. Other workers steal from its front.
    local: CbWorker<Task>,

    /// Handle to all of the other worker's queues. If there are N workers we
    /// will have N-1 queues to steal from.
    stealers: Vec<Stealer<Task>>,

    unparker: Arc<Unparker>,
}

impl Worker {
    pub(super) fn new(
        shared: Arc<ProcessorShared>,
        local: CbWorker<Task>,
        mut stealers: Vec<Stealer<Task>>,
    ) -> Self {
        // Shuffle the stealers so that each worker's search order when trying to
        // steal work is different and hopefully unique to reduce contention.
        fastrand::shuffle(&mut stealers);

        Self {
            policy: RefCell::new(EventLoopPolicy::from(shared.cfg())),
            shared,
            ticker: RefCell::new(Ticker::new()),
            pop_global_queue: Cell::new(false),
            local,
            stealers,
            unparker: Arc::default(),
        }
    }

    fn find_task(&self) -> Option<Task> {
        let injector = self.shared.injector();

        // Enforce scheduler fairness by force-checking the global queue with
        // frequency `global_queue_interval`.
        if self.pop_global_queue.replace(false)
            && let Some(task) = injector.steal_batch_and_pop(&self.local).success()
        {
            return Some(task);
        }

        self.local.pop().or_else(|| {
            // No local work, repeatedly try the global injector and other
            // workers queues.
            iter::repeat_with(|| {
                injector.steal_batch_and_pop(&self.local).or_else(||
                    // The behavior of collect here is to return the first Success(T) so
                    // *we are not* iterating through all stealers everytime.
                    self.stealers.iter().map(|s| s.steal()).collect())
            })
            .take(self.policy.borrow().max_steal_retries)
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        })
    }

    /// Worker thread body. Returns once the processor stops.
    pub(super) fn run(&self) {
        let prev = CURRENT_WORKER.with(|w| w.replace(self));
        debug_assert!(prev.is_null(), "nested worker loop on one thread");
        debug!(processor = %self.shared.name(), "worker started");

        'event_loop: loop {
            if let Some(task) = self.find_task() {
                self.shared.on_dequeued();
                task.do_step();
            } else {
                // Park the thread, and wait for new tasks to be scheduled and an
                // unpark signal from the processor.
                self.shared.parking().park_current_thread(
                    &self.unparker,
                    self.shared.injector(),
                    self.shared.shutdown_flag(),
                );
            }

            let events = self
                .ticker
                .borrow_mut()
                .tick(&self.shared, &mut *self.policy.borrow_mut());
            if let ControlFlow::Break(_) = self.process_ticker_events(events) {
                break 'event_loop;
            }
        }

        let leftover = iter::from_fn(|| self.local.pop()).count();
        if leftover > 0 {
            trace!(leftover, "dropping queued tasks on worker exit");
        }

        CURRENT_WORKER.with(|w| w.set(ptr::null()));
        debug!(processor = %self.shared.name(), "worker stopped");
    }

    #[inline(always)]
    fn process_ticker_events(&self, events: TickerEvents) -> ControlFlow<()> {
        if events.contains(TickerEvents::SHUTDOWN) {
            return ControlFlow::Break(());
        }

        if events.contains(TickerEvents::POP_GLOBAL_QUEUE) {
            self.pop_global_queue.set(true);
        }
        ControlFlow::Continue(())
    }
}

#[derive(Debug, Clone)]
struct EventLoopPolicy {
    global_queue_interval: u32,

    max_steal_retries: usize,
}

impl EventLoopPolicy {
    #[inline(always)]
    fn should_pop_global_queue(&self, tick: u32) -> bool {
        tick.is_multiple_of(self.global_queue_interval)
    }
}

impl From<&ProcessorConfig> for EventLoopPolicy {
    fn from(cfg: &ProcessorConfig) -> EventLoopPolicy {
        EventLoopPolicy {
            global_queue_interval: cfg.global_queue_interval,
            max_steal_retries: cfg.max_steal_retries,
        }
    }
}

impl TickerData for EventLoopPolicy {
    type Context = Arc<ProcessorShared>;

    #[inline(always)]
    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents {
        // Fast-path to enforce shutdown
        if ctx.shutdown_flag().load(Ordering::Acquire) {
            return TickerEvents::SHUTDOWN;
        }

        if self.should_pop_global_queue(tick) {
            TickerEvents::POP_GLOBAL_QUEUE
        } else {
            TickerEvents::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 10, 10)]
    #[case(31, 62, 2)]
    #[case(31, 30, 0)]
    fn test_global_queue_policy(#[case] interval: u32, #[case] ticks: u32, #[case] expected: usize) {
        let policy = EventLoopPolicy {
            global_queue_interval: interval,
            max_steal_retries: 1,
        };

        let fired = (1..=ticks)
            .filter(|tick| policy.should_pop_global_queue(*tick))
            .count();
        assert_eq!(fired, expected);
    }
}
