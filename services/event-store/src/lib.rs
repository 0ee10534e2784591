//! Event Store Service
//!
//! Durable record of everything that flows through QuoteHub:
//! - append-only event log, one segment per calendar day, JSON per line
//! - replay coordinator re-dispatching logged events to consumers
//! - consume-marker store enforcing at-most-once delivery per consumer
//! - order-safety guard keeping replay from re-issuing live orders

pub mod dedup;
pub mod events;
pub mod guard;
pub mod log;
pub mod replay;

pub use dedup::{ConsumeDedupStore, FileDedupStore, MemoryDedupStore};
pub use events::{BusEvent, EventIdGen, FileCursor, Topic};
pub use guard::{OrderSafetyGuard, ReplayMarker, ReplayOrderPolicy};
pub use log::{EventFilter, EventLog, EventLogIter, EventLogStats};
pub use replay::{
    EventConsumer, ReplayCoordinator, ReplayMode, ReplayRequest, ReplayState, TaskSnapshot,
};
