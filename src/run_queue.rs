//! Double-buffered run queue.
//!
//! `drain_into` swaps out the current queue for a fresh empty one and hands
//! back the swapped-out batch. This bounds how much work one `poll()` round
//! does: fibers that re-enqueue themselves (or get enqueued as a side effect
//! of resuming other fibers) land in the new queue and are only serviced on
//! the *next* round, so a busy fiber can never starve the event loop.

use std::cell::RefCell;
use std::collections::VecDeque;

pub struct RunQueue<T> {
    queue: RefCell<VecDeque<T>>,
}

impl<T> RunQueue<T> {
    pub fn new() -> Self {
        Self {
            queue: RefCell::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.queue.borrow_mut().push_back(item);
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swaps out the current contents for an empty queue and returns what
    /// was there. Items pushed while the caller is processing the returned
    /// batch land in the (now current) empty queue, not in the batch.
    pub fn drain_into(&self) -> VecDeque<T> {
        self.queue.replace(VecDeque::new())
    }
}

impl<T> Default for RunQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_is_a_noop_on_empty_queue() {
        let q: RunQueue<i32> = RunQueue::new();
        assert!(q.drain_into().is_empty());
    }

    #[test]
    fn pushes_during_drain_land_in_next_round() {
        let q = RunQueue::new();
        q.push(1);
        q.push(2);
        let batch = q.drain_into();
        assert_eq!(batch, VecDeque::from([1, 2]));
        q.push(3);
        assert_eq!(q.len(), 1);
    }
}
