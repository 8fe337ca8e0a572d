use crate::error::{Fatal, Result};
use crate::Tick;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Kind of a scheduled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
pub enum Kind {
    /// Complete finished kernels and step the device.
    DeviceActivity,
    /// Dispatch the next stream operation.
    StreamDispatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Event {
    pub time: Tick,
    /// Insertion order, breaks ties between events due at the same tick.
    seq: u64,
    pub kind: Kind,
}

/// Host timeline and the events scheduled on it.
///
/// Events are popped in `(time, insertion order)` order.
/// There is no way to cancel an event once it has been scheduled.
#[derive(Debug, Default)]
pub struct Queue {
    now: Tick,
    next_seq: u64,
    events: BinaryHeap<Reverse<Event>>,
}

impl Queue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn now(&self) -> Tick {
        self.now
    }

    pub fn schedule(&mut self, kind: Kind, time: Tick) -> Result<()> {
        if time < self.now {
            return Err(Fatal::ScheduleInPast {
                kind,
                at: time,
                now: self.now,
            });
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        log::trace!("schedule {kind} event at tick {time} (now={})", self.now);
        self.events.push(Reverse(Event { time, seq, kind }));
        Ok(())
    }

    /// The next event due, if any.
    #[must_use]
    pub fn peek(&self) -> Option<&Event> {
        self.events.peek().map(|Reverse(event)| event)
    }

    /// Pop the next event due at or before `limit` and advance the timeline to it.
    pub fn pop_until(&mut self, limit: Tick) -> Option<Event> {
        match self.events.peek() {
            Some(Reverse(event)) if event.time <= limit => {
                let Reverse(event) = self.events.pop()?;
                self.now = event.time;
                Some(event)
            }
            _ => None,
        }
    }

    /// Advance the timeline to `time` without popping events.
    ///
    /// The timeline never moves backwards.
    pub fn advance_to(&mut self, time: Tick) {
        self.now = self.now.max(time);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of outstanding events of the given kind.
    #[must_use]
    pub fn num_pending(&self, kind: Kind) -> usize {
        self.events
            .iter()
            .filter(|Reverse(event)| event.kind == kind)
            .count()
    }
}
