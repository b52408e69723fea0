use crate::task::{TaskContext, TaskId};
use crate::task::sleep_state::{Epoch, WakeupSource};
use parking_lot::{Mutex, MutexGuard};
use slab::Slab;
use std::fmt;
use std::sync::Arc;

/// Identifies one parked waiter of a [`WaitList`].
///
/// The slab slot alone is not enough: it may have been reused by another
/// waiter after a wakeup unlinked ours, so the key also carries the task id
/// and the sleep epoch the waiter was appended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaiterKey {
    slot: usize,
    epoch: Epoch,
    task_id: TaskId,
}

/// A task parked in a wait list, with the epoch of the sleep it belongs to.
pub(crate) struct Waiter {
    ctx: Arc<TaskContext>,
    epoch: Epoch,
}

impl Waiter {
    pub(crate) fn ctx(&self) -> &Arc<TaskContext> {
        &self.ctx
    }

    pub(crate) fn wakeup(self) {
        self.ctx.wakeup(WakeupSource::WaitList, self.epoch);
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("task_id", &self.ctx.id())
            .field("epoch", &self.epoch)
            .finish()
    }
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

/// FIFO queue with O(1) unlink by key, nodes stored in a slab arena and
/// linked by index.
#[derive(Debug)]
pub(crate) struct LinkedSlab<T> {
    nodes: Slab<Node<T>>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<T> Default for LinkedSlab<T> {
    fn default() -> Self {
        Self {
            nodes: Slab::new(),
            head: None,
            tail: None,
        }
    }
}

impl<T> LinkedSlab<T> {
    pub(crate) fn push_back(&mut self, value: T) -> usize {
        let slot = self.nodes.insert(Node {
            value,
            prev: self.tail,
            next: None,
        });

        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(slot),
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        slot
    }

    pub(crate) fn pop_front(&mut self) -> Option<T> {
        self.head.map(|slot| self.unlink(slot))
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&T> {
        self.nodes.get(slot).map(|node| &node.value)
    }

    /// Panics if `slot` is vacant.
    pub(crate) fn unlink(&mut self, slot: usize) -> T {
        let node = self.nodes.remove(slot);

        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.tail = node.prev,
        }

        node.value
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

/// Any number of tasks waiting for a signal, behind a lock.
///
/// Primitives check their condition and append under the same lock, and
/// wakers modify the condition and wake under it too, so a wakeup cannot fall
/// between a waiter's check and its registration.
#[derive(Debug, Default)]
pub(crate) struct WaitList {
    waiters: Mutex<LinkedSlab<Waiter>>,
}

impl WaitList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> WaitListGuard<'_> {
        WaitListGuard {
            waiters: self.waiters.lock(),
        }
    }

    /// Unlinks a waiter that stopped waiting. A no-op if it was already woken.
    pub(crate) fn remove(&self, key: WaiterKey) -> bool {
        self.lock().remove(key)
    }
}

pub(crate) struct WaitListGuard<'a> {
    waiters: MutexGuard<'a, LinkedSlab<Waiter>>,
}

impl WaitListGuard<'_> {
    /// Parks `ctx` at the back of the list for its current sleep.
    pub(crate) fn append(&mut self, ctx: &Arc<TaskContext>) -> WaiterKey {
        let epoch = ctx.epoch();
        let task_id = ctx.id();
        let slot = self.waiters.push_back(Waiter {
            ctx: Arc::clone(ctx),
            epoch,
        });

        WaiterKey {
            slot,
            epoch,
            task_id,
        }
    }

    /// Unlinks the oldest waiter without waking it.
    pub(crate) fn pop_front(&mut self) -> Option<Waiter> {
        self.waiters.pop_front()
    }

    pub(crate) fn wakeup_one(&mut self) -> bool {
        match self.waiters.pop_front() {
            Some(waiter) => {
                waiter.wakeup();
                true
            }
            None => false,
        }
    }

    pub(crate) fn wakeup_all(&mut self) -> usize {
        let mut woken = 0;
        while let Some(waiter) = self.waiters.pop_front() {
            waiter.wakeup();
            woken += 1;
        }
        woken
    }

    pub(crate) fn remove(&mut self, key: WaiterKey) -> bool {
        let owned = self
            .waiters
            .get(key.slot)
            .is_some_and(|w| w.ctx.id() == key.task_id && w.epoch == key.epoch);

        if owned {
            self.waiters.unlink(key.slot);
        }
        owned
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(WaitList: Send, Sync);

    fn drain<T>(list: &mut LinkedSlab<T>) -> Vec<T> {
        std::iter::from_fn(|| list.pop_front()).collect()
    }

    #[test]
    fn test_fifo_order() {
        let mut list = LinkedSlab::default();
        (0..5).for_each(|i| {
            list.push_back(i);
        });

        assert_eq!(list.len(), 5);
        assert_eq!(drain(&mut list), vec![0, 1, 2, 3, 4]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_unlink_head_middle_tail() {
        let mut list = LinkedSlab::default();
        let slots = (0..5).map(|i| list.push_back(i)).collect::<Vec<_>>();

        assert_eq!(list.unlink(slots[2]), 2);
        assert_eq!(list.unlink(slots[0]), 0);
        assert_eq!(list.unlink(slots[4]), 4);

        assert_eq!(drain(&mut list), vec![1, 3]);
    }

    #[test]
    fn test_reused_slot_keeps_order() {
        let mut list = LinkedSlab::default();
        let a = list.push_back("a");
        list.push_back("b");
        list.unlink(a);

        // Slab reuses the vacant slot, the new node must still go last.
        let c = list.push_back("c");
        assert_eq!(c, a);
        assert_eq!(list.get(c), Some(&"c"));
        assert_eq!(drain(&mut list), vec!["b", "c"]);
    }

    #[test]
    fn test_unlink_last_resets_list() {
        let mut list = LinkedSlab::default();
        let a = list.push_back(1);
        list.unlink(a);
        assert!(list.is_empty());

        list.push_back(2);
        assert_eq!(drain(&mut list), vec![2]);
    }
}
