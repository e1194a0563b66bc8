//! Discrete-event queue.
//!
//! Events are ordered by tick and, within a tick, by the order in which they
//! were scheduled. Instantaneous-mode traffic is scheduled at the current
//! tick and therefore resolves before simulated time advances.

use std::collections::BinaryHeap;

use super::{CoreId, Tick};
use crate::dtu::{DtuEvent, Packet};

/// A port that can be told to retry after a refused timing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortRef {
    /// CPU-side requester of a tile (the traffic generator).
    Cpu(CoreId),
    /// Local-memory request port of a DTU.
    DtuMem(CoreId),
    /// NoC request port of a DTU.
    DtuNoc(CoreId),
}

/// Something that happens at a tick.
#[derive(Debug)]
pub enum Event {
    /// Advance the traffic generator of a tile.
    CpuTick(CoreId),
    /// A response travelling back to the CPU side of a tile.
    CpuResponse(CoreId, Packet),
    /// Flow-control grant for a port that was refused earlier.
    Retry(PortRef),
    /// An event handled by the DTU of a tile.
    Dtu(CoreId, DtuEvent),
}

struct Entry {
    time: Tick,
    seq: u64,
    event: Event,
}

// #region Ordering relation for Entry
//

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: earlier time and lower sequence must compare larger.
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

//
// #endregion

/// The simulation timeline.
pub struct EventQueue {
    events: BinaryHeap<Entry>,
    next_seq: u64,
    now: Tick,
}

impl EventQueue {
    /// Create an empty queue at tick 0.
    pub fn new() -> Self {
        Self {
            events: BinaryHeap::new(),
            next_seq: 0,
            now: 0,
        }
    }

    /// Current simulated time.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Schedule an event. Events in the past are clamped to the current tick.
    pub fn schedule(&mut self, when: Tick, event: Event) {
        let time = if when < self.now {
            log::warn!("Event {:?} scheduled in the past ({} < {})", event, when, self.now);
            self.now
        } else {
            when
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push(Entry { time, seq, event });
    }

    /// Remove the next event and advance time to it.
    pub fn pop(&mut self) -> Option<(Tick, Event)> {
        let entry = self.events.pop()?;
        self.now = entry.time;
        Some((entry.time, entry.event))
    }

    /// Time of the next event, if any.
    pub fn peek_time(&self) -> Option<Tick> {
        self.events.peek().map(|e| e.time)
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no events are pending.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_ordered_by_time() {
        let mut queue = EventQueue::new();
        queue.schedule(30, Event::CpuTick(3));
        queue.schedule(10, Event::CpuTick(1));
        queue.schedule(20, Event::CpuTick(2));

        let order: Vec<_> = std::iter::from_fn(|| queue.pop())
            .map(|(t, e)| match e {
                Event::CpuTick(c) => (t, c),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(order, vec![(10, 1), (20, 2), (30, 3)]);
    }

    #[test]
    fn test_same_tick_is_fifo() {
        let mut queue = EventQueue::new();
        for core in 0..5 {
            queue.schedule(7, Event::Retry(PortRef::Cpu(core)));
        }
        for expected in 0..5 {
            match queue.pop() {
                Some((7, Event::Retry(PortRef::Cpu(c)))) => assert_eq!(c, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_past_events_clamped() {
        let mut queue = EventQueue::new();
        queue.schedule(100, Event::CpuTick(0));
        queue.pop();
        assert_eq!(queue.now(), 100);

        queue.schedule(50, Event::CpuTick(1));
        assert_eq!(queue.peek_time(), Some(100));
    }
}
