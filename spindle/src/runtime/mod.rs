// Public API
mod builder;
pub use builder::Builder;
pub(crate) use builder::ProcessorConfig;

mod counter;
pub use counter::ProcessorStats;

mod processor;
pub use processor::TaskProcessor;
pub(crate) use processor::ProcessorShared;

mod spawn;
pub use spawn::{SpawnBuilder, spawn, spawn_builder, spawn_critical};

// Internals
mod parking;
mod pool;
mod registry;
mod ticker;
mod timer;
mod worker;

/// Where a ready task is queued.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AddMode {
    /// Behind everything already queued, in the global queue.
    Fifo,

    /// In the local queue of the current worker if it belongs to the task's
    /// processor.
    Lifo,
}

/// Inline capacity of small scratch buffers before they spill to the heap.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 16;
