//! One-shot timer min-heap.
//!
//! `mio` has no built-in timer wheel, so the reactor keeps its own: a binary
//! heap ordered by deadline, with lazily-deleted cancelled entries (removing
//! from the middle of a `BinaryHeap` isn't supported, so a cancelled id is
//! just dropped from `entries` and skipped over when it reaches the top of
//! the heap).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::fiber::FiberId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

pub struct TimerHeap {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, (Instant, FiberId)>,
    next_id: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn insert(&mut self, deadline: Instant, fiber: FiberId) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.entries.insert(id, (deadline, fiber));
        TimerId(id)
    }

    /// Cancels a timer that hasn't fired yet. A no-op if it already has.
    pub fn cancel(&mut self, id: TimerId) {
        self.entries.remove(&id.0);
    }

    /// How long until the next live timer fires, or `None` if there are
    /// none pending.
    pub fn next_timeout(&mut self) -> Option<Duration> {
        self.drop_cancelled();
        self.heap
            .peek()
            .map(|Reverse((deadline, _))| deadline.saturating_duration_since(Instant::now()))
    }

    /// Pops every timer whose deadline has passed, returning the fibers to
    /// wake.
    pub fn expire(&mut self, now: Instant) -> Vec<FiberId> {
        self.drop_cancelled();
        let mut fired = Vec::new();
        while let Some(&Reverse((deadline, id))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            if let Some((_, fiber)) = self.entries.remove(&id) {
                fired.push(fiber);
            }
        }
        fired
    }

    fn drop_cancelled(&mut self) {
        while let Some(&Reverse((_, id))) = self.heap.peek() {
            if self.entries.contains_key(&id) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let base = Instant::now();
        let a = FiberId::new(0);
        let b = FiberId::new(1);
        heap.insert(base + Duration::from_millis(20), a);
        heap.insert(base + Duration::from_millis(10), b);

        let fired = heap.expire(base + Duration::from_millis(15));
        assert_eq!(fired, vec![b]);
        let fired = heap.expire(base + Duration::from_millis(25));
        assert_eq!(fired, vec![a]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let id = heap.insert(now + Duration::from_millis(5), FiberId::new(0));
        heap.cancel(id);
        assert!(heap.expire(now + Duration::from_secs(1)).is_empty());
    }
}
