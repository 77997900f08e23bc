//! Bounded, append-only event log.
//!
//! Sequence numbers are assigned under the ring lock and the event is
//! published to live subscribers before the lock is released, so subscribers
//! observe events in `seq` order.

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;

use crate::bus::{EventBus, Subscription};
use crate::event::{Event, NewEvent};
use crate::in_memory_bus::InMemoryEventBus;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventLogError {
    #[error("event log lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct Ring {
    events: VecDeque<Event>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct EventLog {
    ring: Mutex<Ring>,
    capacity: usize,
    bus: InMemoryEventBus<Event>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(Ring {
                events: VecDeque::with_capacity(capacity),
                next_seq: 1,
            }),
            capacity,
            bus: InMemoryEventBus::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an event, evicting the oldest one when full.
    pub fn append(&self, event: NewEvent) -> Result<Event, EventLogError> {
        let mut ring = self.ring.lock().map_err(|_| EventLogError::Poisoned)?;

        let event = event.into_event(ring.next_seq);
        ring.next_seq += 1;
        if ring.events.len() == self.capacity {
            ring.events.pop_front();
        }
        ring.events.push_back(event.clone());

        if let Err(e) = self.bus.publish(event.clone()) {
            tracing::warn!(seq = event.seq, error = ?e, "failed to publish event to subscribers");
        }

        Ok(event)
    }

    /// Up to `limit` most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<Event>, EventLogError> {
        let ring = self.ring.lock().map_err(|_| EventLogError::Poisoned)?;
        Ok(ring.events.iter().rev().take(limit).cloned().collect())
    }

    /// Up to `limit` events with `seq > after`, oldest first.
    ///
    /// Events already evicted from the ring are silently skipped.
    pub fn since(&self, after: u64, limit: usize) -> Result<Vec<Event>, EventLogError> {
        let ring = self.ring.lock().map_err(|_| EventLogError::Poisoned)?;
        Ok(ring
            .events
            .iter()
            .filter(|e| e.seq > after)
            .take(limit)
            .cloned()
            .collect())
    }

    /// Sequence number of the newest appended event (0 when empty).
    pub fn last_seq(&self) -> Result<u64, EventLogError> {
        let ring = self.ring.lock().map_err(|_| EventLogError::Poisoned)?;
        Ok(ring.next_seq - 1)
    }

    pub fn len(&self) -> usize {
        self.ring.lock().map(|r| r.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live feed of events appended from now on.
    pub fn subscribe(&self) -> Subscription<Event> {
        self.bus.subscribe()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(1000)
    }
}
