//! Stackful coroutines backing task bodies.
//!
//! This is the only module switching stacks. Everything else sees a
//! [`Coroutine`] that can be resumed with a task and a [`CoroYielder`] that
//! suspends back to the worker thread when the task blocks or finishes.
use crate::error::EngineError;
use crate::task::TaskContext;
use generator::{Generator, Gn, Scope};
use std::cell::UnsafeCell;
use std::fmt;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

mod pool;
pub(crate) use pool::{CoroutinePool, PoolConfig};
pub use pool::CoroutinePoolStats;

/// Message passed into a coroutine on every resume.
pub(crate) enum CoroInput {
    /// Run this task's body from the start. The worker keeps the context alive
    /// for the whole step.
    Run(NonNull<TaskContext>),

    /// Continue a task body that suspended.
    Resume,

    /// Leave the idle loop so the stack can be released.
    Exit,
}

// Safety: the context behind `Run` is only dereferenced on the coroutine
// stack while the resuming worker keeps it alive.
unsafe impl Send for CoroInput {}

/// Suspends the coroutine it was handed to. Only usable on that coroutine's
/// stack.
pub(crate) struct CoroYielder<'s> {
    scope: UnsafeCell<Scope<'s, 'static, CoroInput, ()>>,
}

impl CoroYielder<'_> {
    /// Switches back to the thread that resumed us, returns the input of the
    /// next resume.
    pub(crate) fn suspend(&self) -> CoroInput {
        // Safety: the yielder never leaves its coroutine stack and a suspended
        // coroutine cannot call back into it, so this is the only borrow.
        let scope = unsafe { &mut *self.scope.get() };
        match scope.yield_(()) {
            Some(input) => input,
            None => unreachable!("coroutine resumed without input"),
        }
    }
}

/// A coroutine stack running one task body at a time.
///
/// The coroutine loops forever: it runs a task body, suspends back to the pool
/// and waits for the next task, so a stack is reused without being unwound or
/// re-initialised.
pub(crate) struct Coroutine {
    raw: Generator<'static, CoroInput, ()>,
    started: bool,
}

// Safety: a coroutine is only resumed by the worker currently owning its task
// (or by the pool while idle) and task code never caches thread-local
// addresses across suspension points.
unsafe impl Send for Coroutine {}

impl Coroutine {
    pub(crate) fn new(stack_size: usize) -> Result<Self, EngineError> {
        // Stack sizes are counted in words. The allocator panics when the
        // mapping fails.
        let words = stack_size / mem::size_of::<usize>();
        let raw = panic::catch_unwind(AssertUnwindSafe(|| {
            Gn::<CoroInput>::new_scoped_opt(words, coro_main)
        }))
        .map_err(|_| {
            EngineError::StackAllocation(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("cannot map a {stack_size} byte stack"),
            ))
        })?;

        Ok(Self {
            raw,
            started: false,
        })
    }

    /// Switches to the coroutine until it suspends again.
    pub(crate) fn resume(&mut self, input: CoroInput) {
        debug_assert!(!self.raw.is_done(), "resumed a finished coroutine");

        self.started = true;
        self.raw.send(input);
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("started", &self.started)
            .field("done", &self.raw.is_done())
            .finish()
    }
}

impl Drop for Coroutine {
    // Only idle coroutines are dropped: a coroutine holding a suspended task
    // is leaked by its task instead.
    fn drop(&mut self) {
        if self.started && !self.raw.is_done() {
            self.resume(CoroInput::Exit);
        }
    }
}

fn coro_main(mut scope: Scope<'_, 'static, CoroInput, ()>) {
    // The first resume hands its input over before the body starts.
    let mut input = scope.get_yield();
    let yielder = CoroYielder {
        scope: UnsafeCell::new(scope),
    };

    loop {
        match input {
            Some(CoroInput::Run(ctx)) => {
                // Safety: see `CoroInput::Run`.
                unsafe { ctx.as_ref() }.run_body(&yielder);
            }
            Some(CoroInput::Resume) => {
                debug_assert!(false, "idle coroutine resumed without a task");
            }
            Some(CoroInput::Exit) | None => return,
        }

        input = Some(yielder.suspend());
    }
}
