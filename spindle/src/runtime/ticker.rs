use bitflags::bitflags;

#[derive(Debug, Default)]
pub(crate) struct Ticker {
    tick: u32,
}

impl Ticker {
    pub(crate) fn new() -> Self {
        Self { tick: 0 }
    }

    pub(crate) fn tick<T: TickerData>(&mut self, ctx: &T::Context, data: &mut T) -> TickerEvents {
        self.tick = self.tick.wrapping_add(1);
        data.update_and_check(ctx, self.tick)
    }
}

/// Policies evaluated once per worker loop iteration. Decouples the event loop
/// from the data deciding what it should do next.
pub(crate) trait TickerData {
    type Context;

    fn update_and_check(&mut self, ctx: &Self::Context, tick: u32) -> TickerEvents;
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub(crate) struct TickerEvents: u16 {
        /// The worker must leave its loop.
        const SHUTDOWN = 1;

        /// Next task is taken from the global injector before local queues.
        const POP_GLOBAL_QUEUE = 1 << 1;
    }
}
