//! Runtime status projection
//!
//! One lock-protected mutation point updates the snapshot and fans the new
//! value out to subscribers over bounded channels. Sends never block: a
//! subscriber that cannot keep up misses updates instead of stalling the
//! writer. Reads derive the market-open flag from tick recency at read
//! time, so staleness advances between writes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Per-subscriber channel capacity
const SUBSCRIBER_CAPACITY: usize = 16;

/// Observable state of the ingest session and its supervisor
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuntimeSnapshot {
    /// Transport connection up
    pub connected: bool,
    /// Session authenticated
    pub logged_in: bool,
    /// Market-data subscriptions active
    pub subscribed: bool,
    /// Reconnect attempts since the last successful recovery
    pub reconnect_attempts: u32,
    /// When the next reconnect attempt fires
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Connected and logged in, but no tick within the warn window
    pub network_suspect: bool,
    /// Ticks dropped by fingerprint dedup
    pub dedup_dropped: u64,
    /// Last observed clock drift in seconds
    pub drift_seconds: i64,
    /// Ingestion paused by drift
    pub drift_paused: bool,
    /// Times ingestion entered a drift pause
    pub drift_pause_count: u64,
    /// Arrival time of the last accepted tick
    pub last_tick_time: Option<DateTime<Utc>>,
    /// Derived: a tick arrived within the staleness window
    pub market_open: bool,
}

/// Lock-protected snapshot with bounded fan-out
pub struct RuntimeStatusProjector {
    staleness_window: Duration,
    inner: Mutex<RuntimeSnapshot>,
    subscribers: Mutex<FxHashMap<u64, mpsc::Sender<RuntimeSnapshot>>>,
    next_subscriber: AtomicU64,
}

impl RuntimeStatusProjector {
    /// Projector whose market-open flag uses `staleness_window`
    #[must_use]
    pub fn new(staleness_window: Duration) -> Self {
        Self {
            staleness_window,
            inner: Mutex::new(RuntimeSnapshot::default()),
            subscribers: Mutex::new(FxHashMap::default()),
            next_subscriber: AtomicU64::new(0),
        }
    }

    /// Apply a mutation and fan the updated snapshot out
    pub fn update(&self, mutate: impl FnOnce(&mut RuntimeSnapshot)) {
        let snapshot = {
            let mut guard = self.inner.lock();
            mutate(&mut guard);
            guard.clone()
        };
        let snapshot = self.derive(snapshot);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, tx| match tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Slow subscriber misses this update.
                debug!(subscriber = id, "status subscriber lagging, update skipped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Point-in-time copy with the market-open flag derived now
    #[must_use]
    pub fn read(&self) -> RuntimeSnapshot {
        self.derive(self.inner.lock().clone())
    }

    /// Register a subscriber; the handle unsubscribes on `cancel`
    #[must_use]
    pub fn subscribe(self: &Arc<Self>) -> (mpsc::Receiver<RuntimeSnapshot>, SubscriptionHandle) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, tx);
        (
            rx,
            SubscriptionHandle {
                id,
                projector: Arc::clone(self),
            },
        )
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn derive(&self, mut snapshot: RuntimeSnapshot) -> RuntimeSnapshot {
        snapshot.market_open = snapshot.last_tick_time.is_some_and(|last| {
            let age = Utc::now().signed_duration_since(last);
            age.to_std().is_ok_and(|age| age <= self.staleness_window)
        });
        snapshot
    }
}

/// Unsubscribes its receiver when canceled or dropped
pub struct SubscriptionHandle {
    id: u64,
    projector: Arc<RuntimeStatusProjector>,
}

impl SubscriptionHandle {
    /// Remove the subscription
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.projector.subscribers.lock().remove(&self.id);
    }
}
