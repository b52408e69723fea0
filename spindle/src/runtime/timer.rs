use crate::runtime::SPILL_TO_HEAP_THRESHOLD;
use crate::task::TaskContext;
use crate::task::sleep_state::{Epoch, WakeupSource};
use anyhow::{Result, anyhow};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;
use tracing::trace;

/// What to do when a timer fires.
#[derive(Debug)]
enum TimerAction {
    /// End a deadline-bounded sleep, if the task still sleeps in `epoch`.
    Wakeup {
        ctx: Weak<TaskContext>,
        epoch: Epoch,
    },

    /// Cancel a task whose own deadline may have been reached.
    CancelDeadline { ctx: Weak<TaskContext> },
}

impl TimerAction {
    fn fire(self) {
        match self {
            TimerAction::Wakeup { ctx, epoch } => {
                if let Some(ctx) = ctx.upgrade() {
                    ctx.wakeup(WakeupSource::DeadlineTimer, epoch);
                }
            }
            TimerAction::CancelDeadline { ctx } => {
                if let Some(ctx) = ctx.upgrade() {
                    ctx.on_cancel_deadline();
                }
            }
        }
    }
}

#[derive(Debug)]
struct TimerEntry {
    at: Instant,

    /// Breaks ties between equal instants in arming order.
    seq: u64,

    action: TimerAction,
}

impl Eq for TimerEntry {}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.seq) == (other.at, other.seq)
    }
}

// Reversed, so `BinaryHeap` pops the earliest entry first.
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
    stopped: bool,
}

/// Deadline timers of one task processor, driven by a dedicated thread.
///
/// Entries hold weak task references and are never removed early: a sleep
/// that ended before its timer fired is protected by the epoch check, and a
/// moved task deadline is re-checked when the entry fires.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn arm_wakeup(&self, at: Instant, ctx: Weak<TaskContext>, epoch: Epoch) {
        self.push(at, TimerAction::Wakeup { ctx, epoch });
    }

    pub(crate) fn arm_cancel_deadline(&self, at: Instant, ctx: Weak<TaskContext>) {
        self.push(at, TimerAction::CancelDeadline { ctx });
    }

    fn push(&self, at: Instant, action: TimerAction) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }

        let seq = state.next_seq;
        state.next_seq += 1;

        let is_earliest = state.heap.peek().is_none_or(|head| at < head.at);
        state.heap.push(TimerEntry { at, seq, action });

        if is_earliest {
            self.cond.notify_one();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Stops the timer thread. Pending entries are dropped without firing.
    pub(crate) fn stop(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.stopped = true;
            std::mem::take(&mut state.heap)
        };
        self.cond.notify_all();
        drop(pending);
    }

    /// Body of the timer thread. Returns once [`TimerQueue::stop`] is called.
    pub(crate) fn run(&self) {
        loop {
            let expired = {
                let mut state = self.state.lock();
                loop {
                    if state.stopped {
                        return;
                    }

                    let now = Instant::now();
                    match state.heap.peek().map(|head| head.at) {
                        Some(at) if at <= now => break,
                        Some(at) => {
                            self.cond.wait_until(&mut state, at);
                        }
                        None => self.cond.wait(&mut state),
                    }
                }

                let now = Instant::now();
                let mut expired = SmallVec::<[TimerEntry; SPILL_TO_HEAP_THRESHOLD]>::new();
                while state.heap.peek().is_some_and(|head| head.at <= now) {
                    if let Some(entry) = state.heap.pop() {
                        expired.push(entry);
                    }
                }
                expired
            };

            trace!(count = expired.len(), "timers fired");
            // Fired outside the lock: a wakeup may schedule and re-arm.
            expired.into_iter().for_each(|entry| entry.action.fire());
        }
    }
}

pub(crate) fn spawn_timer_thread(
    name: String,
    timers: Arc<TimerQueue>,
) -> Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(name)
        .spawn(move || timers.run())
        .map_err(|e| anyhow!("failed to spawn timer thread: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(at: Instant, seq: u64) -> TimerEntry {
        TimerEntry {
            at,
            seq,
            action: TimerAction::CancelDeadline { ctx: Weak::new() },
        }
    }

    #[test]
    fn test_heap_pops_earliest_first() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(entry(now + Duration::from_millis(30), 0));
        heap.push(entry(now + Duration::from_millis(10), 1));
        heap.push(entry(now + Duration::from_millis(20), 2));
        heap.push(entry(now + Duration::from_millis(10), 3));

        let order = std::iter::from_fn(|| heap.pop())
            .map(|e| e.seq)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![1, 3, 2, 0]);
    }

    #[test]
    fn test_expired_entries_are_drained() -> Result<()> {
        let timers = Arc::new(TimerQueue::new());
        let handle = spawn_timer_thread("spindle-timer-test".into(), timers.clone())?;

        let now = Instant::now();
        timers.arm_cancel_deadline(now, Weak::new());
        timers.arm_cancel_deadline(now + Duration::from_millis(5), Weak::new());
        timers.arm_cancel_deadline(now + Duration::from_secs(3600), Weak::new());

        let deadline = Instant::now() + Duration::from_secs(5);
        while timers.len() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(timers.len(), 1);

        timers.stop();
        handle.join().map_err(|_| anyhow!("timer thread panicked"))?;
        assert_eq!(timers.len(), 0);
        Ok(())
    }

    #[test]
    fn test_push_after_stop_is_ignored() {
        let timers = TimerQueue::new();
        timers.stop();
        timers.arm_cancel_deadline(Instant::now(), Weak::new());
        assert_eq!(timers.len(), 0);
    }
}
