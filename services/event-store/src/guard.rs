//! Order-safety guard for replayed order commands
//!
//! Replay must never re-issue live trading actions. Replayed order-command
//! events either never reach consumers (policy disabled) or arrive carrying
//! a marker that the order-dispatch collaborator checks before acting.

use crate::events::BusEvent;
use services_common::ServiceError;

/// What the coordinator does with order-command events during replay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayOrderPolicy {
    /// Drop order commands; consumers never see them (default)
    #[default]
    Drop,
    /// Dispatch them with the replay marker set; the downstream guard must
    /// reject unless replay-order dispatch was explicitly enabled
    DispatchMarked,
}

/// Context-scoped marker identifying a replayed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayMarker {
    /// Envelope id of the replayed copy
    pub event_id: u64,
    /// Replay task that produced the copy
    pub replay_task_id: String,
}

impl ReplayMarker {
    /// Extract the marker from a replayed envelope
    #[must_use]
    pub fn from_event(event: &BusEvent) -> Option<Self> {
        if !event.replay {
            return None;
        }
        event.replay_task_id.as_ref().map(|task_id| Self {
            event_id: event.event_id,
            replay_task_id: task_id.clone(),
        })
    }
}

/// Checked by the order-dispatch collaborator before any order leaves the
/// process.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderSafetyGuard {
    allow_replay_orders: bool,
}

impl OrderSafetyGuard {
    /// Guard with replay-order dispatch explicitly enabled or not
    #[must_use]
    pub const fn new(allow_replay_orders: bool) -> Self {
        Self { allow_replay_orders }
    }

    /// Reject order dispatch for marked (replayed) commands unless replay
    /// orders were explicitly enabled.
    pub fn check(&self, marker: Option<&ReplayMarker>) -> Result<(), ServiceError> {
        match marker {
            Some(marker) if !self.allow_replay_orders => Err(ServiceError::InvalidRequest(format!(
                "order command {} rejected: replayed by task {}",
                marker.event_id, marker.replay_task_id
            ))),
            _ => Ok(()),
        }
    }
}
