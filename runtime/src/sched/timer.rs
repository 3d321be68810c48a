//! Timer min-heap: sleeping tasks and periodic callbacks both key off an
//! absolute deadline in host microseconds.

use crate::task::TaskId;
use alloc::collections::BinaryHeap;
use core::cmp::Ordering;

/// What a fired timer should do.
pub enum TimerAction {
    /// Wake this sleeping task.
    Wake(TaskId),
    /// Invoke a periodic callback; `period` re-arms it that many
    /// microseconds after the deadline that just fired, `None` for a
    /// one-shot timer.
    Callback {
        callback: fn(usize),
        arg: usize,
        period: Option<u64>,
    },
}

struct Entry {
    deadline_micros: u64,
    seq: u64,
    action: TimerAction,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_micros == other.deadline_micros && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap; reverse so the earliest deadline (and,
        // on a tie, the earliest-inserted entry) sorts to the top.
        other
            .deadline_micros
            .cmp(&self.deadline_micros)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of pending timers, ordered by absolute deadline.
pub struct TimerHeap {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TimerHeap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Arm a new timer to fire at `deadline_micros`.
    pub fn add(&mut self, deadline_micros: u64, action: TimerAction) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline_micros,
            seq,
            action,
        });
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|e| e.deadline_micros)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Pop and return every timer whose deadline is `<= now_micros`,
    /// re-arming periodic callbacks for their next firing.
    pub fn expired(&mut self, now_micros: u64) -> alloc::vec::Vec<TimerAction> {
        let mut fired = alloc::vec::Vec::new();
        while matches!(self.heap.peek(), Some(e) if e.deadline_micros <= now_micros) {
            let entry = self.heap.pop().expect("peek just confirmed an entry");
            if let TimerAction::Callback {
                callback,
                arg,
                period: Some(period),
            } = &entry.action
            {
                self.add(
                    entry.deadline_micros + period,
                    TimerAction::Callback {
                        callback: *callback,
                        arg: *arg,
                        period: Some(*period),
                    },
                );
            }
            fired.push(entry.action);
        }
        fired
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
    fn expired_returns_in_deadline_order() {
        let mut heap = TimerHeap::new();
        heap.add(300, TimerAction::Wake(3));
        heap.add(100, TimerAction::Wake(1));
        heap.add(200, TimerAction::Wake(2));

        let fired = heap.expired(250);
        let ids: alloc::vec::Vec<TaskId> = fired
            .iter()
            .map(|a| match a {
                TimerAction::Wake(id) => *id,
                TimerAction::Callback { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(ids, alloc::vec![1, 2]);
        assert_eq!(heap.next_deadline(), Some(300));
    }

    #[test]
    fn periodic_callback_rearms() {
        let mut heap = TimerHeap::new();
        fn noop(_arg: usize) {}
        heap.add(
            100,
            TimerAction::Callback {
                callback: noop,
                arg: 0,
                period: Some(50),
            },
        );
        let fired = heap.expired(100);
        assert_eq!(fired.len(), 1);
        assert_eq!(heap.next_deadline(), Some(150));
    }
}
