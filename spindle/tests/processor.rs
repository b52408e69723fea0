use anyhow::Result;
use rstest::rstest;
use spindle::TaskProcessor;
use spindle::runtime::Builder;
use spindle::sync::SingleConsumerEvent;
use spindle::task::CancellationReason;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn processor(name: &str, worker_threads: usize) -> Result<TaskProcessor> {
    Builder::new()
        .name(name)
        .worker_threads(worker_threads)
        .initial_coro_pool_size(4)
        .max_coro_pool_size(4)
        .coro_stack_size(64 * 1024)
        .shutdown_timeout(Duration::from_secs(5))
        .try_build()
}

#[rstest]
#[case::single_worker(1)]
#[case::four_workers(4)]
fn test_coroutines_are_reused(#[case] worker_threads: usize) -> Result<()> {
    const TASKS: u64 = 10_000;

    let processor = processor("reuse", worker_threads)?;

    let sum = processor.block_on(|| -> Result<u64> {
        let mut sum = 0;
        for i in 0..TASKS {
            sum += spindle::spawn(move || i).get()?;
        }
        Ok(sum)
    })?;
    assert_eq!(sum, TASKS * (TASKS - 1) / 2);

    let stats = processor.stats();
    assert_eq!(stats.tasks_completed, TASKS as usize + 1);
    assert_eq!(stats.coro_pool.active, 0);
    // The joiner and one child are alive at a time, both fit in the initial
    // pool.
    assert!(
        stats.coro_pool.allocated <= 4 + 2,
        "allocated {} stacks",
        stats.coro_pool.allocated
    );
    processor.shutdown()
}

#[test]
fn test_shutdown_cancels_pending_tasks() -> Result<()> {
    let processor = processor("shutdown", 2)?;

    let tokens: Vec<_> = (0..32)
        .map(|_| {
            let task = processor.spawn(|| spindle::sleep_for(Duration::from_secs(60)));
            let token = task.cancellation_token();
            task.detach();
            token
        })
        .collect();

    processor.shutdown()?;
    for token in tokens {
        assert_eq!(token.cancellation_reason(), CancellationReason::Shutdown);
    }
    Ok(())
}

#[test]
fn test_drop_shuts_down() -> Result<()> {
    let processor = processor("drop", 1)?;
    let task = processor.spawn(|| spindle::sleep_for(Duration::from_secs(60)));
    let token = task.cancellation_token();
    task.detach();

    drop(processor);
    assert_eq!(token.cancellation_reason(), CancellationReason::Shutdown);
    Ok(())
}

#[test]
fn test_join_from_foreign_thread() -> Result<()> {
    let processor = processor("foreign", 2)?;

    let task = processor.spawn(|| {
        spindle::sleep_for(Duration::from_millis(5))?;
        Ok::<_, spindle::WaitInterrupted>(7)
    });
    let value = thread::scope(|s| s.spawn(move || task.get()).join())
        .map_err(|_| anyhow::anyhow!("joining thread panicked"))???;
    assert_eq!(value, 7);

    processor.shutdown()
}

#[test]
fn test_tasks_on_two_processors() -> Result<()> {
    let io = Arc::new(processor("io", 1)?);
    let cpu = processor("cpu", 2)?;

    let answer = {
        let io = Arc::clone(&io);
        cpu.block_on(move || -> Result<u32> {
            let ready = Arc::new(SingleConsumerEvent::new());
            let task = {
                let ready = Arc::clone(&ready);
                io.spawn(move || {
                    ready.send();
                    40
                })
            };
            ready.wait()?;
            Ok(task.get()? + spindle::spawn(|| 2).get()?)
        })?
    };
    assert_eq!(answer, 42);

    cpu.shutdown()?;
    Arc::try_unwrap(io)
        .map_err(|_| anyhow::anyhow!("processor still shared"))?
        .shutdown()
}

#[test]
fn test_stack_survives_resume_on_other_workers() -> Result<()> {
    const TASKS: u64 = 16;
    const ROUNDS: u64 = 200;

    let processor = processor("migrate", 4)?;

    let (sum, workers) = processor.block_on(|| -> Result<(u64, usize)> {
        let tasks: Vec<_> = (0..TASKS)
            .map(|i| {
                spindle::spawn(move || {
                    let mut history = Vec::new();
                    let mut workers = HashSet::new();
                    for round in 0..ROUNDS {
                        history.push(i * ROUNDS + round);
                        workers.insert(thread::current().id());
                        spindle::yield_now();
                    }
                    (history.iter().sum::<u64>(), workers)
                })
            })
            .collect();

        let mut sum = 0;
        let mut workers = HashSet::new();
        for task in tasks {
            let (partial, seen) = task.get()?;
            sum += partial;
            workers.extend(seen);
        }
        Ok((sum, workers.len()))
    })?;

    let n = TASKS * ROUNDS;
    assert_eq!(sum, n * (n - 1) / 2);
    assert!((1..=4).contains(&workers), "ran on {workers} workers");
    processor.shutdown()
}

#[test]
fn test_invalid_config_is_rejected() {
    let err = Builder::new()
        .coro_stack_size(64 * 1024 + 1)
        .try_build()
        .unwrap_err();
    assert!(err.to_string().contains("page size"), "{err}");
}
