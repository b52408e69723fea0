use anyhow::Result;
use spindle::current_task;
use spindle::runtime::Builder;
use spindle::sync::SingleConsumerEvent;
use spindle::task::{CancellationReason, JoinError, TaskLocalKey, TaskState};
use spindle::{Deadline, EngineError, WaitError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const LONG: Duration = Duration::from_secs(60);

/// Sets its flag when dropped, whether by return or by unwinding.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[spindle::test]
fn test_spawn_and_get() -> Result<()> {
    let task = spindle::spawn(|| 6 * 7);
    assert_eq!(task.get()?, 42);
    Ok(())
}

#[spindle::test(worker_threads = 4)]
fn test_nested_spawns() -> Result<()> {
    let tasks: Vec<_> = (0..100_u64)
        .map(|i| spindle::spawn(move || spindle::spawn(move || i * 2).get()))
        .collect();

    let mut sum = 0;
    for task in tasks {
        sum += task.get()??;
    }
    assert_eq!(sum, 2 * (0..100).sum::<u64>());
    Ok(())
}

#[spindle::test]
fn test_panic_is_delivered_to_joiner() -> Result<()> {
    let task = spindle::spawn(|| -> u32 { panic!("boom") });

    let err = task.get().unwrap_err();
    assert!(err.is_panic());
    assert_eq!(err.panic_message(), Some("boom"));

    // The processor survives the panic.
    assert_eq!(spindle::spawn(|| 1).get()?, 1);
    Ok(())
}

#[spindle::test]
fn test_cancel_before_start() -> Result<()> {
    let ran = Arc::new(AtomicBool::new(false));

    let task = {
        let ran = Arc::clone(&ran);
        spindle::spawn(move || ran.store(true, Ordering::SeqCst))
    };
    task.request_cancel();

    let err = task.get().unwrap_err();
    assert!(matches!(
        err,
        JoinError::Cancelled(CancellationReason::UserRequest)
    ));
    assert!(!ran.load(Ordering::SeqCst));
    Ok(())
}

#[spindle::test]
fn test_critical_task_runs_despite_early_cancel() -> Result<()> {
    let task = spindle::spawn_critical(|| current_task::is_cancel_requested());
    task.request_cancel();

    assert!(task.get()?);
    Ok(())
}

#[spindle::test]
fn test_set_deadline_interrupts_sleep() -> Result<()> {
    let start = Instant::now();
    let task = spindle::spawn(|| {
        current_task::set_deadline(Deadline::from_duration(Duration::from_millis(20)));
        let res = spindle::sleep_for(LONG);
        (res, current_task::cancellation_reason())
    });

    let (res, reason) = task.get()?;
    assert_eq!(res.unwrap_err().reason(), CancellationReason::Deadline);
    assert_eq!(reason, CancellationReason::Deadline);
    assert!(start.elapsed() < Duration::from_secs(5));
    Ok(())
}

#[spindle::test]
fn test_spawn_with_timeout() -> Result<()> {
    let task = spindle::spawn_builder()
        .timeout(Duration::from_millis(10))
        .spawn(|| {
            let _ = spindle::sleep_for(LONG);
            current_task::cancellation_point();
        });

    let err = task.get().unwrap_err();
    assert!(matches!(err, JoinError::Cancelled(CancellationReason::Deadline)));
    Ok(())
}

#[spindle::test(worker_threads = 2)]
fn test_sync_cancel_waits_for_unwinding() -> Result<()> {
    let released = Arc::new(AtomicBool::new(false));
    let started = Arc::new(SingleConsumerEvent::new());

    let task = {
        let released = Arc::clone(&released);
        let started = Arc::clone(&started);
        spindle::spawn(move || {
            let _resource = DropFlag(released);
            started.send();
            let _ = spindle::sleep_for(LONG);
            current_task::cancellation_point();
        })
    };

    started.wait()?;
    task.sync_cancel();

    assert!(released.load(Ordering::SeqCst));
    assert_eq!(task.state(), TaskState::Cancelled);
    assert_eq!(task.cancellation_reason(), CancellationReason::UserRequest);
    Ok(())
}

#[spindle::test]
fn test_wait_for_times_out() -> Result<()> {
    let task = spindle::spawn(|| spindle::sleep_for(LONG));

    assert_eq!(
        task.wait_for(Duration::from_millis(10)),
        Err(WaitError::Timeout)
    );
    assert!(!task.is_finished());

    task.sync_cancel();
    assert!(task.is_finished());
    Ok(())
}

#[spindle::test(worker_threads = 2)]
fn test_interrupted_join_abandons_target() -> Result<()> {
    let started = Arc::new(SingleConsumerEvent::new());

    let outer = {
        let started = Arc::clone(&started);
        spindle::spawn(move || {
            let inner = spindle::spawn(|| spindle::sleep_for(LONG));
            let token = inner.cancellation_token();
            started.send();
            (inner.get().map(drop), token)
        })
    };

    started.wait()?;
    outer.request_cancel();

    let (res, inner_token) = outer.get()?;
    assert!(matches!(
        res,
        Err(JoinError::Interrupted(CancellationReason::UserRequest))
    ));
    assert_eq!(
        inner_token.cancellation_reason(),
        CancellationReason::Abandoned
    );
    Ok(())
}

#[spindle::test]
fn test_dropped_handle_cancels_task() -> Result<()> {
    let task = spindle::spawn(|| spindle::sleep_for(LONG));
    let token = task.cancellation_token();

    drop(task);
    assert_eq!(token.cancellation_reason(), CancellationReason::Abandoned);
    Ok(())
}

#[spindle::test]
fn test_detached_task_keeps_running() -> Result<()> {
    let done = Arc::new(SingleConsumerEvent::new());

    {
        let done = Arc::clone(&done);
        spindle::spawn(move || {
            spindle::sleep_for(Duration::from_millis(5))?;
            done.send();
            Ok::<_, spindle::WaitInterrupted>(())
        })
        .detach();
    }

    done.wait_for(Duration::from_secs(5))?;
    Ok(())
}

#[spindle::test]
fn test_cancellation_blocker() -> Result<()> {
    let task = spindle::spawn(|| {
        current_task::request_cancel();
        assert!(current_task::should_cancel());

        let blocked = {
            let _blocker = current_task::CancellationBlocker::new();
            (
                current_task::should_cancel(),
                current_task::is_cancel_requested(),
                spindle::sleep_for(Duration::from_millis(1)).is_ok(),
            )
        };
        (blocked, spindle::sleep_for(Duration::from_millis(1)).is_err())
    });

    let ((should_cancel, requested, slept), interrupted) = task.get()?;
    assert!(!should_cancel);
    assert!(requested);
    assert!(slept);
    assert!(interrupted);
    Ok(())
}

static COUNTER: TaskLocalKey<u32> = TaskLocalKey::new(|| 0);

#[spindle::test(worker_threads = 2)]
fn test_task_locals_are_per_task() -> Result<()> {
    COUNTER.set(10);

    let other = spindle::spawn(|| COUNTER.with(|c| {
        *c += 1;
        *c
    }));
    assert_eq!(other.get()?, 1);

    COUNTER.with(|c| *c += 1);
    assert_eq!(COUNTER.take(), Some(11));
    assert_eq!(COUNTER.take(), None);
    Ok(())
}

static DROPPED: AtomicUsize = AtomicUsize::new(0);

struct Tracked;

impl Drop for Tracked {
    fn drop(&mut self) {
        // Locals are dropped on the task, where blocking is allowed.
        spindle::uninterruptible_sleep_for(Duration::from_millis(1));
        DROPPED.fetch_add(1, Ordering::SeqCst);
    }
}

static TRACKED: TaskLocalKey<Option<Tracked>> = TaskLocalKey::new(|| None);

#[spindle::test]
fn test_task_locals_dropped_when_task_finishes() -> Result<()> {
    let task = spindle::spawn(|| TRACKED.set(Some(Tracked)));
    task.get()?;

    assert_eq!(DROPPED.load(Ordering::SeqCst), 1);
    Ok(())
}

#[spindle::test]
fn test_yield_now_interleaves_tasks() -> Result<()> {
    let log = Arc::new(spindle::sync::Mutex::new(Vec::new()));

    let tasks: Vec<_> = ['a', 'b']
        .into_iter()
        .map(|name| {
            let log = Arc::clone(&log);
            spindle::spawn(move || {
                for _ in 0..3 {
                    log.lock_uninterruptible().push(name);
                    spindle::yield_now();
                }
            })
        })
        .collect();
    for task in tasks {
        task.get()?;
    }

    let log = log.lock()?;
    let switches = log.windows(2).filter(|w| w[0] != w[1]).count();
    assert_eq!(log.len(), 6);
    assert!(switches >= 2, "tasks did not interleave: {log:?}");
    Ok(())
}

#[test]
fn test_overload_sheds_non_critical_tasks() -> Result<()> {
    let processor = Builder::new()
        .name("overload")
        .worker_threads(1)
        .task_queue_length_limit(1)
        .try_build()?;

    processor.block_on(|| -> Result<()> {
        let first = spindle::spawn(|| 1);
        let second = spindle::spawn(|| 2);
        let rejected = spindle::spawn_builder().try_spawn(|| 3);
        let critical = spindle::spawn_critical(|| 4);

        assert!(matches!(rejected, Err(EngineError::Overloaded)));
        assert_eq!(first.get()?, 1);
        assert!(matches!(
            second.get(),
            Err(JoinError::Cancelled(CancellationReason::Overload))
        ));
        assert_eq!(critical.get()?, 4);
        Ok(())
    })?;

    assert_eq!(processor.stats().tasks_overloaded, 2);
    processor.shutdown()
}

#[test]
#[should_panic(expected = "must be called from a task")]
fn test_blocking_outside_task_panics() {
    let _ = spindle::sleep_for(Duration::from_millis(1));
}

#[spindle::test]
fn test_shared_clones_observe_same_result() -> Result<()> {
    let task = spindle::spawn(|| Box::new(5)).share();
    let copy = task.clone();

    assert_eq!(**copy.get()?, 5);
    assert_eq!(**task.get()?, 5);

    // Cloning after completion still sees the result.
    let late = task.clone();
    drop(task);
    assert_eq!(**late.get()?, 5);
    Ok(())
}

#[spindle::test]
fn test_shared_panic_reported_to_every_joiner() -> Result<()> {
    let task = spindle::spawn(|| -> u32 { panic!("error") }).share();

    for _ in 0..3 {
        let err = task.get().unwrap_err();
        assert!(err.is_panic());
        assert_eq!(err.panic_message(), Some("error"));
    }
    Ok(())
}

#[spindle::test]
fn test_shared_last_clone_drop_cancels() -> Result<()> {
    let task = spindle::spawn(|| spindle::sleep_for(LONG).is_ok()).share();
    let token = task.cancellation_token();

    {
        let copy = task.clone();
        assert_eq!(copy.handle_count(), 2);
    }
    spindle::yield_now();
    assert!(!task.is_finished());
    assert_eq!(token.cancellation_reason(), CancellationReason::None);

    drop(task);
    assert_eq!(token.cancellation_reason(), CancellationReason::Abandoned);
    Ok(())
}

#[spindle::test]
fn test_shared_reassign_cancels_previous_task() -> Result<()> {
    let mut task = spindle::spawn(|| spindle::sleep_for(LONG).is_ok()).share();
    let first = task.cancellation_token();

    task = spindle::spawn(|| true).share();
    assert_eq!(first.cancellation_reason(), CancellationReason::Abandoned);
    assert!(*task.get()?);
    Ok(())
}

#[spindle::test(worker_threads = 4)]
fn test_shared_get_from_many_tasks() -> Result<()> {
    let task = spindle::spawn(|| {
        spindle::sleep_for(Duration::from_millis(5))?;
        Ok::<_, spindle::WaitInterrupted>(String::from("shared"))
    })
    .share();

    let joiners: Vec<_> = (0..16)
        .map(|_| {
            let task = task.clone();
            spindle::spawn(move || -> Result<usize, JoinError> {
                task.wait()?;
                Ok(task.get()?.as_ref().map_or(0, String::len))
            })
        })
        .collect();

    for joiner in joiners {
        assert_eq!(joiner.get()??, 6);
    }
    Ok(())
}

#[spindle::test(worker_threads = 2)]
fn test_shared_interrupted_get_keeps_task_running() -> Result<()> {
    let task = spindle::spawn(|| {
        spindle::sleep_for(Duration::from_millis(20))?;
        Ok::<_, spindle::WaitInterrupted>(7)
    })
    .share();

    let joiner = {
        let task = task.clone();
        spindle::spawn(move || {
            current_task::request_cancel();
            matches!(
                task.get(),
                Err(JoinError::Interrupted(CancellationReason::UserRequest))
            )
        })
    };

    assert!(joiner.get()?);
    assert_eq!(task.cancellation_reason(), CancellationReason::None);
    assert_eq!(task.get()?, &Ok(7));
    Ok(())
}
