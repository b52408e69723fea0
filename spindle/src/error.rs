use crate::task::CancellationReason;
use std::any::Any;
use std::fmt;
use std::io;

/// A blocking call returned early because the calling task was cancelled.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("wait interrupted by cancellation ({reason})")]
pub struct WaitInterrupted {
    reason: CancellationReason,
}

impl WaitInterrupted {
    pub(crate) fn new(reason: CancellationReason) -> Self {
        Self { reason }
    }

    pub fn reason(&self) -> CancellationReason {
        self.reason
    }
}

/// Outcome of a deadline-aware wait that did not succeed.
///
/// Timeouts are routine and usually handled locally, cancellation usually has
/// to propagate upward, so the two are kept distinct.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("deadline expired")]
    Timeout,

    #[error("wait cancelled ({0})")]
    Cancelled(CancellationReason),
}

impl WaitError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::Timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, WaitError::Cancelled(_))
    }
}

impl From<WaitInterrupted> for WaitError {
    fn from(e: WaitInterrupted) -> Self {
        WaitError::Cancelled(e.reason())
    }
}

/// Error returned by [`Promise`](crate::sync::Promise) and
/// [`Future`](crate::sync::Future).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureError {
    #[error("promise dropped without a value")]
    BrokenPromise,

    #[error("future already retrieved")]
    AlreadyRetrieved,

    #[error(transparent)]
    Interrupted(#[from] WaitInterrupted),
}

/// Error returned when joining a task.
#[derive(thiserror::Error)]
pub enum JoinError {
    /// The task was cancelled before its body produced a value.
    #[error("task cancelled ({0})")]
    Cancelled(CancellationReason),

    /// The task body panicked. The payload is the one passed to `panic!`.
    #[error("task panicked")]
    Panic(PanicPayload),

    /// The *joining* task was cancelled while waiting. An owned handle was
    /// consumed, so the joined task is cancelled as abandoned. A shared handle
    /// leaves the task running.
    #[error("wait for task interrupted ({0})")]
    Interrupted(CancellationReason),
}

impl JoinError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinError::Cancelled(_))
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, JoinError::Panic(_))
    }

    /// Consumes the error, returning the panic payload.
    ///
    /// # Panics
    ///
    /// Panics if the error does not represent a panic.
    #[track_caller]
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        match self {
            JoinError::Panic(payload) => payload.into_inner(),
            other => panic!("`JoinError` is not a panic: {other}"),
        }
    }

    /// Best effort extraction of the panic message.
    pub fn panic_message(&self) -> Option<&str> {
        match self {
            JoinError::Panic(payload) => payload.as_str(),
            _ => None,
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled(reason) => f.debug_tuple("Cancelled").field(reason).finish(),
            JoinError::Panic(payload) => f
                .debug_tuple("Panic")
                .field(&payload.as_str().unwrap_or("<non-string payload>"))
                .finish(),
            JoinError::Interrupted(reason) => f.debug_tuple("Interrupted").field(reason).finish(),
        }
    }
}

impl From<WaitInterrupted> for JoinError {
    fn from(e: WaitInterrupted) -> Self {
        JoinError::Interrupted(e.reason())
    }
}

/// Panic payload carried by [`JoinError::Panic`].
///
/// The payload is only `Send`. Shared access is limited to downcasts into
/// `Sync` types, which makes the wrapper `Sync` and `JoinError` usable with
/// error types such as `anyhow::Error`.
pub struct PanicPayload(Box<dyn Any + Send + 'static>);

// SAFETY: `&PanicPayload` only exposes the payload through `downcast_ref_sync`,
// which requires the target type to be `Sync`. Reading the type id through
// the vtable does not touch the payload itself.
unsafe impl Sync for PanicPayload {}

impl PanicPayload {
    pub(crate) fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        Self(payload)
    }

    pub fn into_inner(self) -> Box<dyn Any + Send + 'static> {
        self.0
    }

    pub fn downcast_ref_sync<T: Any + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.downcast_ref_sync::<&'static str>()
            .copied()
            .or_else(|| self.downcast_ref_sync::<String>().map(String::as_str))
    }
}

impl fmt::Debug for PanicPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PanicPayload")
            .field(&self.as_str().unwrap_or("<non-string payload>"))
            .finish()
    }
}

/// Failure taxonomy for I/O performed from tasks.
///
/// Timeouts, cancellations and hard failures are kept apart so retry logic can
/// treat them differently.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error("I/O deadline expired")]
    Timeout,

    #[error("I/O cancelled ({0})")]
    Cancelled(CancellationReason),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl IoError {
    pub fn is_retryable(&self) -> bool {
        match self {
            IoError::Timeout => true,
            IoError::Io(e) => e
                .raw_os_error()
                .is_some_and(|errno| matches!(errno, libc::EAGAIN | libc::EINTR)),
            IoError::Cancelled(_) => false,
        }
    }

    /// Cancellation is never retried: the task is expected to unwind.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IoError::Cancelled(_))
    }

    /// Neither retryable nor a cancellation.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !self.is_cancelled()
    }
}

impl From<WaitError> for IoError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::Timeout => IoError::Timeout,
            WaitError::Cancelled(reason) => IoError::Cancelled(reason),
        }
    }
}

impl From<IoError> for io::Error {
    fn from(e: IoError) -> Self {
        match e {
            IoError::Io(io_err) => io_err,
            IoError::Timeout => io::Error::new(io::ErrorKind::TimedOut, e.to_string()),
            IoError::Cancelled(_) => io::Error::new(io::ErrorKind::Interrupted, e.to_string()),
        }
    }
}

/// Resource exhaustion and lifecycle failures of the engine itself.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("failed to allocate coroutine stack: {0}")]
    StackAllocation(#[source] io::Error),

    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    #[error("task processor is shutting down")]
    ShuttingDown,

    #[error("task queue length limit reached")]
    Overloaded,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Steady-state exhaustion can be shed by rejecting work, anything else
    /// means the processor cannot operate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ThreadSpawn(_) | EngineError::InvalidConfig(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(WaitInterrupted: Send, Sync, Copy, std::error::Error);
    assert_impl_all!(WaitError: Send, Sync, Copy, std::error::Error);
    assert_impl_all!(JoinError: Send, Sync, std::error::Error);
    assert_impl_all!(EngineError: Send, Sync, std::error::Error);

    #[test]
    fn test_wait_error_from_interrupted() {
        let e: WaitError = WaitInterrupted::new(CancellationReason::Deadline).into();
        assert_eq!(e, WaitError::Cancelled(CancellationReason::Deadline));
        assert!(e.is_cancelled());
        assert!(!e.is_timeout());
    }

    #[test]
    fn test_join_error_panic_message() {
        let e = JoinError::Panic(PanicPayload::new(Box::new("boom")));
        assert_eq!(e.panic_message(), Some("boom"));
        assert!(e.is_panic());

        let e = JoinError::Panic(PanicPayload::new(Box::new(String::from("owned boom"))));
        assert_eq!(e.panic_message(), Some("owned boom"));
        assert_eq!(format!("{e:?}"), "Panic(\"owned boom\")");

        let e = JoinError::Cancelled(CancellationReason::UserRequest);
        assert_eq!(e.panic_message(), None);
    }

    #[test]
    fn test_join_error_converts_to_anyhow() {
        let e: anyhow::Error = JoinError::Cancelled(CancellationReason::Abandoned).into();
        assert!(e.downcast_ref::<JoinError>().is_some_and(JoinError::is_cancelled));

        let e: anyhow::Error = JoinError::Panic(PanicPayload::new(Box::new(7_u32))).into();
        let join_err = e.downcast::<JoinError>().unwrap();
        assert_eq!(join_err.panic_message(), None);
        assert_eq!(join_err.into_panic().downcast_ref::<u32>(), Some(&7));
    }

    #[test]
    fn test_io_error_retryable() {
        assert!(IoError::Timeout.is_retryable());
        assert!(IoError::Io(io::Error::from_raw_os_error(libc::EAGAIN)).is_retryable());
        assert!(!IoError::Io(io::Error::from_raw_os_error(libc::EBADF)).is_retryable());
        assert!(IoError::Io(io::Error::from_raw_os_error(libc::EBADF)).is_fatal());
        assert!(!IoError::Timeout.is_fatal());

        let cancelled = IoError::from(WaitError::Cancelled(CancellationReason::Shutdown));
        assert!(!cancelled.is_retryable());
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_fatal());

        let io_err: io::Error = IoError::Timeout.into();
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);
    }
}
