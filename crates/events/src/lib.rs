//! `orchestrator-events` — lifecycle events and the bounded event log.
//!
//! Every job, worker and queue state change produces an [`Event`]. Events are
//! appended to an [`EventLog`] (bounded ring, monotonic `seq`) and fanned out
//! to live subscribers through an [`EventBus`].

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod log;

pub use bus::{EventBus, Subscription};
pub use event::{Event, EventType, NewEvent};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use log::{EventLog, EventLogError};
