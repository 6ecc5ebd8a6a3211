//! Discrete-Event Queue
//!
//! Virtual-time scheduler. Events scheduled for the same instant fire in the
//! order they were scheduled; cancelled events are skipped when popped.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

/// Handle returned by [`EventQueue::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

struct Scheduled<E> {
    at: Duration,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Scheduled<E> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<E> Eq for Scheduled<E> {}

impl<E> PartialOrd for Scheduled<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Scheduled<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse for min-heap: earliest time first, then lowest sequence
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of timed events with FIFO tie-break and cancellation
pub struct EventQueue<E> {
    now: Duration,
    next_seq: u64,
    heap: BinaryHeap<Scheduled<E>>,
    live: HashSet<u64>,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            now: Duration::ZERO,
            next_seq: 0,
            heap: BinaryHeap::new(),
            live: HashSet::new(),
        }
    }

    /// Current virtual time
    pub fn now(&self) -> Duration {
        self.now
    }

    /// Schedule `event` to fire `delay` after the current time
    pub fn schedule(&mut self, delay: Duration, event: E) -> EventId {
        let at = self.now.saturating_add(delay);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled { at, seq, event });
        self.live.insert(seq);
        EventId(seq)
    }

    /// Cancel a pending event. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.live.remove(&id.0)
    }

    pub fn is_pending(&self, id: EventId) -> bool {
        self.live.contains(&id.0)
    }

    /// Time of the next live event, if any
    pub fn peek_time(&mut self) -> Option<Duration> {
        self.discard_cancelled();
        self.heap.peek().map(|s| s.at)
    }

    /// Pop the next live event and advance the clock to its time
    pub fn pop(&mut self) -> Option<(Duration, E)> {
        self.discard_cancelled();
        let next = self.heap.pop()?;
        self.live.remove(&next.seq);
        self.now = next.at;
        Some((next.at, next.event))
    }

    /// Number of live events
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn discard_cancelled(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.live.contains(&top.seq) {
                break;
            }
            self.heap.pop();
        }
    }
}
