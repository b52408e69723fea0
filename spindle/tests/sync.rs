use anyhow::Result;
use spindle::sync::{Semaphore, SingleConsumerEvent};
use spindle::task::CancellationReason;
use spindle::{WaitError, WaitInterrupted};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[spindle::test(worker_threads = 4)]
fn test_semaphore_limits_concurrency() -> Result<()> {
    const PERMITS: usize = 3;

    let semaphore = Arc::new(Semaphore::new(PERMITS));
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let semaphore = Arc::clone(&semaphore);
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            spindle::spawn(move || -> Result<(), WaitInterrupted> {
                let _permit = semaphore.acquire()?;
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                spindle::sleep_for(Duration::from_millis(1))?;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle.get()??;
    }
    assert!(peak.load(Ordering::SeqCst) <= PERMITS);
    assert_eq!(semaphore.available_permits(), PERMITS);
    Ok(())
}

#[spindle::test]
fn test_semaphore_timeout_and_release() -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(1));
    let permit = semaphore.acquire()?;

    assert!(semaphore.try_acquire().is_none());
    assert_eq!(
        semaphore
            .try_acquire_for(Duration::from_millis(5))
            .map(drop),
        Err(WaitError::Timeout)
    );

    let waiter = {
        let semaphore = Arc::clone(&semaphore);
        spindle::spawn(move || semaphore.acquire().map(|permit| permit.forget()))
    };
    spindle::sleep_for(Duration::from_millis(5))?;
    drop(permit);

    waiter.get()??;
    assert_eq!(semaphore.available_permits(), 0);

    semaphore.release(2);
    assert_eq!(semaphore.available_permits(), 2);
    Ok(())
}

#[spindle::test(worker_threads = 2)]
fn test_semaphore_cancelled_waiter_passes_permit_on() -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(0));

    let spawn_waiter = || {
        let semaphore = Arc::clone(&semaphore);
        spindle::spawn(move || semaphore.acquire().map(|permit| permit.forget()))
    };
    let cancelled = spawn_waiter();
    let patient = spawn_waiter();
    spindle::sleep_for(Duration::from_millis(5))?;

    semaphore.release(1);
    cancelled.request_cancel();

    // Whichever waiter the permit went to, the patient one gets a permit.
    let first = cancelled.get()?;
    if first.is_ok() {
        semaphore.release(1);
    } else {
        assert_eq!(first.unwrap_err().reason(), CancellationReason::UserRequest);
    }
    patient.get()??;
    Ok(())
}

#[spindle::test(worker_threads = 4)]
fn test_event_no_lost_signal() -> Result<()> {
    for _ in 0..2_000 {
        let event = Arc::new(SingleConsumerEvent::new());

        let sender = {
            let event = Arc::clone(&event);
            let yields = fastrand::usize(0..3);
            spindle::spawn(move || {
                for _ in 0..yields {
                    spindle::yield_now();
                }
                event.send();
            })
        };

        event.wait_for(Duration::from_secs(5))?;
        sender.get()?;
        assert!(!event.is_ready());
    }
    Ok(())
}

#[spindle::test]
fn test_event_signal_is_kept_until_consumed() -> Result<()> {
    let event = SingleConsumerEvent::new();

    event.send();
    event.send();
    assert!(event.is_ready());

    event.wait()?;
    assert_eq!(
        event.wait_for(Duration::from_millis(5)),
        Err(WaitError::Timeout)
    );

    event.send();
    event.reset();
    assert!(!event.is_ready());
    Ok(())
}

#[spindle::test(worker_threads = 2)]
fn test_event_wait_interrupted_by_cancel() -> Result<()> {
    let event = Arc::new(SingleConsumerEvent::new());

    let waiter = {
        let event = Arc::clone(&event);
        spindle::spawn(move || event.wait())
    };
    spindle::sleep_for(Duration::from_millis(5))?;
    waiter.request_cancel();

    let res = waiter.get()?;
    assert_eq!(
        res.unwrap_err().reason(),
        CancellationReason::UserRequest
    );
    Ok(())
}
