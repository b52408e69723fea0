use crate::runtime::{Builder, TaskProcessor};
use anyhow::Result;
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly subscriber once per process, filtered through
/// `RUST_LOG`.
pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A small processor with short shutdown, suitable for unit tests.
pub(crate) fn init_processor(worker_threads: usize) -> Result<TaskProcessor> {
    init_tracing();

    Builder::new()
        .name("test")
        .worker_threads(worker_threads)
        .initial_coro_pool_size(4)
        .max_coro_pool_size(64)
        .coro_stack_size(64 * 1024)
        .shutdown_timeout(Duration::from_secs(5))
        .try_build()
}
