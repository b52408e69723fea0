use crate::task::current;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

/// Per-task storage slots.
///
/// Values live until the task body finishes and are dropped on the task's own
/// coroutine, so destructors may use blocking primitives.
#[derive(Default)]
pub(crate) struct LocalStorage {
    slots: HashMap<usize, Box<dyn Any + Send>>,
}

impl LocalStorage {
    fn take(&mut self, key: usize) -> Option<Box<dyn Any + Send>> {
        self.slots.remove(&key)
    }

    fn put(&mut self, key: usize, value: Box<dyn Any + Send>) {
        self.slots.insert(key, value);
    }

    pub(crate) fn clear(&mut self) -> Vec<Box<dyn Any + Send>> {
        self.slots.drain().map(|(_, v)| v).collect()
    }
}

impl fmt::Debug for LocalStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStorage")
            .field("slots", &self.slots.len())
            .finish()
    }
}

/// A key for a task-local value, declared as a `static`.
///
/// ```no_run
/// use spindle::task::TaskLocalKey;
///
/// static REQUEST_COUNT: TaskLocalKey<u32> = TaskLocalKey::new(|| 0);
///
/// # fn handler() {
/// REQUEST_COUNT.with(|count| *count += 1);
/// # }
/// ```
///
/// Every task sees its own value, lazily created with the key's initializer.
pub struct TaskLocalKey<T: Send + 'static> {
    init: fn() -> T,
    _p: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> TaskLocalKey<T> {
    pub const fn new(init: fn() -> T) -> Self {
        Self {
            init,
            _p: PhantomData,
        }
    }

    fn key(&'static self) -> usize {
        self as *const Self as usize
    }

    /// Runs `f` with the current task's value.
    ///
    /// The value is moved out of the task's storage for the duration of `f`,
    /// so a nested `with` on the same key observes a fresh value.
    ///
    /// # Panics
    ///
    /// Panics if called from outside a task.
    #[track_caller]
    pub fn with<R>(&'static self, f: impl FnOnce(&mut T) -> R) -> R {
        let ctx = current::expect_current("TaskLocalKey::with");
        let key = self.key();

        let mut value = ctx
            .with_local_storage(|storage| storage.take(key))
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .unwrap_or_else(|| Box::new((self.init)()));

        let res = f(&mut value);
        ctx.with_local_storage(|storage| storage.put(key, value));
        res
    }

    /// Replaces the current task's value.
    #[track_caller]
    pub fn set(&'static self, value: T) {
        self.with(|slot| *slot = value);
    }

    /// Takes the current task's value, leaving the slot empty.
    #[track_caller]
    pub fn take(&'static self) -> Option<T> {
        let ctx = current::expect_current("TaskLocalKey::take");
        ctx.with_local_storage(|storage| storage.take(self.key()))
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }
}

impl<T: Send + 'static> fmt::Debug for TaskLocalKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLocalKey").finish_non_exhaustive()
    }
}
