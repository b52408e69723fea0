use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// A point on the monotonic clock bounding a blocking operation, or "never".
///
/// Every blocking API of the crate accepts a `Deadline`. An unreachable
/// deadline ([`Deadline::never`]) means the operation may block until woken
/// or cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that is never reached.
    pub const fn never() -> Self {
        Self(None)
    }

    /// A deadline that is already reached.
    pub fn passed() -> Self {
        Self(Some(Instant::now()))
    }

    /// A deadline `duration` from now. Saturates to [`Deadline::never`] if the
    /// instant is not representable.
    pub fn from_duration(duration: Duration) -> Self {
        Self(Instant::now().checked_add(duration))
    }

    pub fn from_instant(instant: Instant) -> Self {
        Self(Some(instant))
    }

    #[inline]
    pub fn is_reachable(&self) -> bool {
        self.0.is_some()
    }

    #[inline]
    pub fn is_reached(&self) -> bool {
        self.0.is_some_and(|at| at <= Instant::now())
    }

    /// Time remaining until the deadline, zero if reached, `None` if never.
    pub fn time_left(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Self::from_instant(instant)
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// "Never" sorts after every reachable deadline.
impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.0, other.0) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(&b),
        }
    }
}
