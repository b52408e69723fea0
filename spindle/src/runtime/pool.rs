use crate::error::EngineError;
use crate::runtime::ProcessorShared;
use crate::runtime::worker::{Task, Worker};
use crate::utils::thread::set_current_thread_name;
use anyhow::{Result, anyhow};
use crossbeam_deque::{Stealer, Worker as CbWorker};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use tracing::error;

/// Worker threads of a task processor.
#[derive(Debug)]
pub(super) struct ThreadPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    pub(super) fn start(shared: &Arc<ProcessorShared>) -> Result<Self> {
        let num_workers = shared.cfg().worker_threads;

        let mut local_queues = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            let w = CbWorker::new_fifo();
            stealers.push(w.stealer());
            local_queues.push(w);
        }

        let pool = Self {
            handles: Mutex::new(Vec::with_capacity(num_workers)),
        };

        for (i, local_queue) in local_queues.into_iter().enumerate() {
            // Give each worker a list of all *other* workers' stealers. Stealer
            // is cheap to clone, inner value is behind an Arc.
            let other_stealers = stealers
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, s)| s.clone())
                .collect::<Vec<_>>();

            match spawn_worker_thread(shared, local_queue, other_stealers) {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(e) => {
                    shared.stop_workers();
                    if let Err(join_err) = pool.join_all() {
                        error!(error = %join_err, "failed to join workers after spawn failure");
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(pool)
    }

    pub(super) fn join_all(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.handles.lock());

        let errors = handles
            .into_iter()
            .filter_map(|handle| handle.join().err())
            .count();

        if errors == 0 {
            Ok(())
        } else {
            Err(anyhow!("{errors} worker thread(s) panicked"))
        }
    }
}

fn spawn_worker_thread(
    shared: &Arc<ProcessorShared>,
    local_queue: CbWorker<Task>,
    stealers: Vec<Stealer<Task>>,
) -> Result<thread::JoinHandle<()>, EngineError> {
    let cfg = shared.cfg();
    let name = cfg.thread_name.0();

    let mut builder = thread::Builder::new();
    if let Some(stack_size) = cfg.thread_stack_size {
        builder = builder.stack_size(stack_size);
    }

    let shared = Arc::clone(shared);
    builder
        .spawn(move || {
            set_current_thread_name(&name);
            Worker::new(shared, local_queue, stealers).run();
        })
        .map_err(EngineError::ThreadSpawn)
}
