//! The sleep-state word shared between a sleeping task and its wakers.
//!
//! A single `AtomicU64` packs an epoch (high 56 bits) and [`SleepFlags`]
//! (low 8 bits). A waiter records the epoch before it decides to sleep and
//! every waker presents the epoch it was armed with: a wakeup carrying an
//! outdated epoch is dropped, a wakeup delivered before the task actually
//! parked is still observed through the flags.
use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};

const FLAG_BITS: u32 = 8;
const FLAG_MASK: u64 = (1 << FLAG_BITS) - 1;
const EPOCH_MASK: u64 = u64::MAX >> FLAG_BITS;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct SleepFlags: u8 {
        /// The task is suspended and not queued.
        const SLEEPING = 1;

        const WAKEUP_BY_WAIT_LIST = 1 << 1;

        const WAKEUP_BY_DEADLINE_TIMER = 1 << 2;

        const WAKEUP_BY_CANCEL_REQUEST = 1 << 3;

        /// First schedule of a freshly spawned task.
        const WAKEUP_BY_BOOTSTRAP = 1 << 4;

        /// The task blocked while non-cancellable, cancel wakeups are ignored.
        const NON_CANCELLABLE = 1 << 5;
    }
}

/// Why a sleeping task was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum WakeupSource {
    None,
    WaitList,
    DeadlineTimer,
    CancelRequest,
    Bootstrap,
}

impl WakeupSource {
    pub(crate) fn as_flag(self) -> SleepFlags {
        match self {
            WakeupSource::None => SleepFlags::empty(),
            WakeupSource::WaitList => SleepFlags::WAKEUP_BY_WAIT_LIST,
            WakeupSource::DeadlineTimer => SleepFlags::WAKEUP_BY_DEADLINE_TIMER,
            WakeupSource::CancelRequest => SleepFlags::WAKEUP_BY_CANCEL_REQUEST,
            WakeupSource::Bootstrap => SleepFlags::WAKEUP_BY_BOOTSTRAP,
        }
    }

    /// Picks the wakeup reported to the sleeper when several fired at once.
    pub(crate) fn primary(flags: SleepFlags) -> WakeupSource {
        const ORDERED: [(SleepFlags, WakeupSource); 3] = [
            (SleepFlags::WAKEUP_BY_WAIT_LIST, WakeupSource::WaitList),
            (SleepFlags::WAKEUP_BY_DEADLINE_TIMER, WakeupSource::DeadlineTimer),
            (SleepFlags::WAKEUP_BY_BOOTSTRAP, WakeupSource::Bootstrap),
        ];

        if let Some((_, source)) = ORDERED.iter().find(|(flag, _)| flags.contains(*flag)) {
            return *source;
        }

        if flags.contains(SleepFlags::WAKEUP_BY_CANCEL_REQUEST)
            && !flags.contains(SleepFlags::NON_CANCELLABLE)
        {
            return WakeupSource::CancelRequest;
        }

        WakeupSource::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Epoch(u64);

impl Epoch {
    pub(crate) const ZERO: Epoch = Epoch(0);

    #[inline]
    pub(crate) fn next(self) -> Epoch {
        Epoch(self.0.wrapping_add(1) & EPOCH_MASK)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SleepState {
    pub(crate) epoch: Epoch,
    pub(crate) flags: SleepFlags,
}

impl SleepState {
    pub(crate) fn new(epoch: Epoch, flags: SleepFlags) -> Self {
        Self { epoch, flags }
    }

    #[inline]
    fn pack(self) -> u64 {
        (self.epoch.0 << FLAG_BITS) | u64::from(self.flags.bits())
    }

    #[inline]
    fn unpack(raw: u64) -> Self {
        Self {
            epoch: Epoch(raw >> FLAG_BITS),
            flags: SleepFlags::from_bits_retain((raw & FLAG_MASK) as u8),
        }
    }
}

/// Every read-modify-write is `SeqCst`: wakeups from different threads must be
/// totally ordered for "only the first wakeup schedules" to hold.
#[derive(Debug)]
pub(crate) struct AtomicSleepState(AtomicU64);

impl AtomicSleepState {
    pub(crate) fn new(state: SleepState) -> Self {
        Self(AtomicU64::new(state.pack()))
    }

    #[inline]
    pub(crate) fn load(&self) -> SleepState {
        SleepState::unpack(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn store(&self, state: SleepState) {
        self.0.store(state.pack(), Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn exchange(&self, state: SleepState) -> SleepState {
        SleepState::unpack(self.0.swap(state.pack(), Ordering::SeqCst))
    }

    #[inline]
    pub(crate) fn compare_exchange(
        &self,
        current: SleepState,
        new: SleepState,
    ) -> Result<SleepState, SleepState> {
        self.0
            .compare_exchange(
                current.pack(),
                new.pack(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(SleepState::unpack)
            .map_err(SleepState::unpack)
    }

    /// Sets `flags` without touching the epoch, returns the previous state.
    #[inline]
    pub(crate) fn fetch_or_flags(&self, flags: SleepFlags) -> SleepState {
        SleepState::unpack(self.0.fetch_or(u64::from(flags.bits()), Ordering::SeqCst))
    }

    /// Clears `flags` without touching the epoch, returns the previous state.
    #[inline]
    pub(crate) fn clear_flags(&self, flags: SleepFlags) -> SleepState {
        SleepState::unpack(self.0.fetch_and(!u64::from(flags.bits()), Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_pack_unpack() {
        let state = SleepState::new(
            Epoch(0xdead_beef),
            SleepFlags::SLEEPING | SleepFlags::NON_CANCELLABLE,
        );
        let atomic = AtomicSleepState::new(state);
        assert_eq!(atomic.load(), state);
    }

    #[test]
    fn test_epoch_wraps_within_mask() {
        let last = Epoch(EPOCH_MASK);
        assert_eq!(last.next(), Epoch::ZERO);

        let atomic = AtomicSleepState::new(SleepState::new(last, SleepFlags::SLEEPING));
        let prev = atomic.fetch_or_flags(SleepFlags::WAKEUP_BY_WAIT_LIST);
        assert_eq!(prev.epoch, last);
        assert_eq!(
            atomic.load().flags,
            SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_WAIT_LIST
        );
    }

    #[test]
    fn test_flag_ops_keep_epoch() {
        let atomic = AtomicSleepState::new(SleepState::new(
            Epoch(7),
            SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_BOOTSTRAP,
        ));

        let prev = atomic.clear_flags(SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_BOOTSTRAP);
        assert_eq!(prev.epoch, Epoch(7));
        assert_eq!(atomic.load(), SleepState::new(Epoch(7), SleepFlags::empty()));

        let prev = atomic.exchange(SleepState::new(Epoch(8), SleepFlags::empty()));
        assert_eq!(prev.epoch, Epoch(7));
        assert_eq!(atomic.load().epoch, Epoch(8));
    }

    #[test]
    fn test_compare_exchange_rejects_stale() {
        let atomic = AtomicSleepState::new(SleepState::new(Epoch(1), SleepFlags::SLEEPING));
        let stale = SleepState::new(Epoch(0), SleepFlags::SLEEPING);
        let new = SleepState::new(Epoch(0), SleepFlags::WAKEUP_BY_WAIT_LIST);

        let current = atomic.compare_exchange(stale, new).unwrap_err();
        assert_eq!(current.epoch, Epoch(1));
    }

    #[rstest]
    #[case::wait_list_wins(
        SleepFlags::WAKEUP_BY_WAIT_LIST | SleepFlags::WAKEUP_BY_DEADLINE_TIMER | SleepFlags::WAKEUP_BY_CANCEL_REQUEST,
        WakeupSource::WaitList
    )]
    #[case::deadline_before_cancel(
        SleepFlags::WAKEUP_BY_DEADLINE_TIMER | SleepFlags::WAKEUP_BY_CANCEL_REQUEST,
        WakeupSource::DeadlineTimer
    )]
    #[case::bootstrap(SleepFlags::WAKEUP_BY_BOOTSTRAP, WakeupSource::Bootstrap)]
    #[case::cancel(SleepFlags::WAKEUP_BY_CANCEL_REQUEST, WakeupSource::CancelRequest)]
    #[case::cancel_blocked(
        SleepFlags::WAKEUP_BY_CANCEL_REQUEST | SleepFlags::NON_CANCELLABLE,
        WakeupSource::None
    )]
    #[case::nothing(SleepFlags::SLEEPING, WakeupSource::None)]
    fn test_primary_wakeup_source(#[case] flags: SleepFlags, #[case] expected: WakeupSource) {
        assert_eq!(WakeupSource::primary(flags), expected);
    }
}
