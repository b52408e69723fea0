//! Structures parking tasks until another task, a timer or a cancellation
//! request wakes them.
//!
//! Wakeups always carry the sleep epoch the waiter registered with, so a
//! wakeup racing with the end of a wait never leaks into the next one.
mod light;
pub(crate) use light::{LightWaiterKey, WaitListLight};

mod list;
pub(crate) use list::{WaitList, WaiterKey};

mod strategy;
pub(crate) use strategy::{EarlyWakeup, WaitStrategy};
