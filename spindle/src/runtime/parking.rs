use crossbeam_deque::Injector;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, Thread};

/// Per-worker unpark signal.
#[derive(Debug, Default)]
pub(crate) struct Unparker {
    should_unpark: AtomicBool,
}

#[derive(Debug)]
struct ParkedThread {
    thread: Thread,
    unparker: Arc<Unparker>,
}

/// Idle workers of a task processor.
#[derive(Debug, Default)]
pub(crate) struct Parking {
    /// LIFO collection of parked threads. We unpark thread in LIFO order as the
    /// latest parked thread is the one where CPU cache will be the hotest.
    parked: Mutex<Vec<ParkedThread>>,
}

impl Parking {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            parked: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    /// Parks the current worker until [`Parking::unpark_one`] picks it, unless
    /// work was published to the injector or shutdown began.
    pub(crate) fn park_current_thread<T>(
        &self,
        unparker: &Arc<Unparker>,
        injector: &Injector<T>,
        shutdown: &AtomicBool,
    ) {
        {
            let mut parked = self.parked.lock();

            // Checked under the lock: producers publish before unparking, so
            // either we see their work or they see us parked.
            if !injector.is_empty() || shutdown.load(Ordering::Acquire) {
                return;
            }

            unparker.should_unpark.store(false, Ordering::Release);
            parked.push(ParkedThread {
                thread: thread::current(),
                unparker: Arc::clone(unparker),
            });
        }

        // Account for spurious wakeups.
        while !unparker.should_unpark.load(Ordering::Acquire) {
            thread::park();
        }
    }

    pub(crate) fn unpark_one(&self) -> bool {
        let Some(parked) = self.parked.lock().pop() else {
            return false;
        };

        parked.unparker.should_unpark.store(true, Ordering::Release);
        parked.thread.unpark();
        true
    }

    pub(crate) fn unpark_all(&self) -> usize {
        let parked = std::mem::take(&mut *self.parked.lock());
        let num_unparked = parked.len();

        for p in parked {
            p.unparker.should_unpark.store(true, Ordering::Release);
            p.thread.unpark();
        }
        num_unparked
    }

    #[cfg(test)]
    pub(crate) fn num_parked(&self) -> usize {
        self.parked.lock().len()
    }
}
