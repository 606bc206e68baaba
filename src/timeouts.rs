//! Pending kernel timeouts
//!
//! A min-heap of (deadline, reason) pairs keyed by the global cycle counter.
//! Reasons are plain values dispatched by the work loop; cancellation
//! tombstones the heap entry, which is dropped when it surfaces.

use alloc::collections::{BTreeSet, BinaryHeap};
use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::types::{Cycles, PeId};

/// Why a timeout was armed; dispatched by the work loop when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    /// Poll the RCTMux flags cell of the PE again
    ContinueSwitch(PeId),
    /// The time slice of the PE's current VPE is used up
    RoundRobinExpired(PeId),
}

/// Handle for cancellation
pub type TimeoutId = u64;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Entry {
    deadline: Cycles,
    id: TimeoutId,
    reason: TimeoutReason,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // reverse order for a min-heap; ids break ties in insertion order
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The pending-timeout heap
pub struct Timeouts {
    heap: BinaryHeap<Entry>,
    cancelled: BTreeSet<TimeoutId>,
    next_id: TimeoutId,
}

impl Timeouts {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            cancelled: BTreeSet::new(),
            next_id: 1,
        }
    }

    /// Arm a timeout `delay` cycles from `now`
    pub fn wait_for(&mut self, now: Cycles, delay: Cycles, reason: TimeoutReason) -> TimeoutId {
        let id = self.next_id;
        self.next_id += 1;
        klog!(
            TIMEOUTS,
            "Armed timeout {} for {:?} @ {}",
            id,
            reason,
            now + delay
        );
        self.heap.push(Entry {
            deadline: now + delay,
            id,
            reason,
        });
        id
    }

    /// Cancel a pending timeout; it will not fire
    pub fn cancel(&mut self, id: TimeoutId) {
        klog!(TIMEOUTS, "Cancelled timeout {}", id);
        self.cancelled.insert(id);
    }

    fn drop_dead(&mut self) {
        loop {
            let id = match self.heap.peek() {
                Some(e) => e.id,
                None => break,
            };
            if self.cancelled.remove(&id) {
                self.heap.pop();
            } else {
                break;
            }
        }
    }

    /// The deadline of the earliest live timeout
    pub fn next_deadline(&mut self) -> Option<Cycles> {
        self.drop_dead();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Remove and return every reason whose deadline has passed, in
    /// (deadline, insertion) order. Timeouts armed while the caller
    /// dispatches the returned reasons run on the next tick.
    pub fn tick(&mut self, now: Cycles) -> Vec<TimeoutReason> {
        let mut fired = Vec::new();
        loop {
            self.drop_dead();
            let due = match self.heap.peek() {
                Some(e) => e.deadline <= now,
                None => false,
            };
            if !due {
                break;
            }
            if let Some(e) = self.heap.pop() {
                fired.push(e.reason);
            }
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.heap.len() == self.cancelled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut t = Timeouts::new();
        t.wait_for(0, 100, TimeoutReason::ContinueSwitch(1));
        t.wait_for(0, 50, TimeoutReason::ContinueSwitch(2));
        t.wait_for(0, 200, TimeoutReason::ContinueSwitch(3));

        assert_eq!(t.next_deadline(), Some(50));
        assert_eq!(t.tick(150), alloc::vec![
            TimeoutReason::ContinueSwitch(2),
            TimeoutReason::ContinueSwitch(1),
        ]);
        assert_eq!(t.tick(150), alloc::vec![]);
        assert_eq!(t.next_deadline(), Some(200));
    }

    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let mut t = Timeouts::new();
        t.wait_for(0, 10, TimeoutReason::RoundRobinExpired(5));
        t.wait_for(0, 10, TimeoutReason::RoundRobinExpired(6));
        assert_eq!(t.tick(10), alloc::vec![
            TimeoutReason::RoundRobinExpired(5),
            TimeoutReason::RoundRobinExpired(6),
        ]);
    }

    #[test]
    fn test_cancelled_timeouts_never_fire() {
        let mut t = Timeouts::new();
        let a = t.wait_for(0, 10, TimeoutReason::ContinueSwitch(1));
        t.wait_for(0, 20, TimeoutReason::ContinueSwitch(2));
        t.cancel(a);
        assert_eq!(t.next_deadline(), Some(20));
        assert_eq!(t.tick(100), alloc::vec![TimeoutReason::ContinueSwitch(2)]);
        assert!(t.is_empty());
    }

    #[test]
    fn test_zero_delay_fires_immediately() {
        let mut t = Timeouts::new();
        t.wait_for(500, 0, TimeoutReason::RoundRobinExpired(1));
        assert_eq!(t.tick(500), alloc::vec![TimeoutReason::RoundRobinExpired(1)]);
    }
}
