//! Event envelope types for the append-only log
//!
//! One JSON object per line on the wire; envelopes are immutable once
//! appended. Replay re-dispatches copies tagged with `replay` + task id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Event classification on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Raw market-data tick
    Tick,
    /// Aggregated minute bar (per-contract or weighted index)
    Bar,
    /// Outbound order instruction
    OrderCommand,
    /// Order state change
    OrderStatus,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tick => write!(f, "tick"),
            Self::Bar => write!(f, "bar"),
            Self::OrderCommand => write!(f, "order_command"),
            Self::OrderStatus => write!(f, "order_status"),
        }
    }
}

/// Envelope written to the event log.
///
/// `event_id` is monotonic and collision-free across restarts; `occurred_at`
/// is the domain time of the payload while `produced_at` is when the
/// envelope was built (and keys the day segment it lands in).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    /// Monotonic envelope id; 0 means "assign on append"
    pub event_id: u64,
    /// Event classification
    pub topic: Topic,
    /// Producing component, e.g. "market-ingest"
    pub source: String,
    /// Domain time of the payload
    pub occurred_at: DateTime<Utc>,
    /// Envelope creation time
    pub produced_at: DateTime<Utc>,
    /// Set on replay dispatch, never on live events
    #[serde(default)]
    pub replay: bool,
    /// Replay task that re-dispatched this copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_task_id: Option<String>,
    /// Opaque payload owned by the producer
    pub payload: serde_json::Value,
}

impl BusEvent {
    /// Build a live envelope; the log assigns the id on append.
    #[must_use]
    pub fn new(
        topic: Topic,
        source: &str,
        occurred_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: 0,
            topic,
            source: source.to_string(),
            occurred_at,
            produced_at: Utc::now(),
            replay: false,
            replay_task_id: None,
            payload,
        }
    }
}

/// Resumable position in the log: segment file name + byte offset of the
/// record's first byte within it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCursor {
    /// Segment file name, e.g. "events-20240510.log"
    pub file: String,
    /// Byte offset of the record within the segment
    pub offset: u64,
}

/// Monotonic, collision-free event-id generator.
///
/// Ids are `millis << 20 | sequence`: restarts resume above any previously
/// issued id as long as fewer than 2^20 events are produced per millisecond.
#[derive(Debug, Default)]
pub struct EventIdGen {
    last: AtomicU64,
}

impl EventIdGen {
    /// Generator starting from the current wall clock
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generator that will never issue an id at or below `floor`
    #[must_use]
    pub fn starting_after(floor: u64) -> Self {
        Self { last: AtomicU64::new(floor) }
    }

    /// Next id, strictly greater than every id issued before it
    pub fn next_id(&self) -> u64 {
        let floor = (Utc::now().timestamp_millis().max(0) as u64) << 20;
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = prev.max(floor) + 1;
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }
}
