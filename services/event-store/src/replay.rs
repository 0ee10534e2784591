//! Replay coordinator
//!
//! Re-dispatches logged events to registered consumers under an explicit
//! task state machine: Idle -> Running <-> Paused -> {Stopped|Done|Error}.
//! One active task per coordinator; at-most-once delivery per consumer is
//! enforced through the consume-marker store.

use crate::dedup::ConsumeDedupStore;
use crate::events::{BusEvent, FileCursor, Topic};
use crate::guard::ReplayOrderPolicy;
use crate::log::{EventFilter, EventLog};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use services_common::ServiceError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cooperative pause-flag poll interval
const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Replay task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayState {
    /// No task has run yet
    Idle,
    /// Task is scanning and dispatching
    Running,
    /// Dispatch gated by the pause flag; the scan is not canceled
    Paused,
    /// Canceled by `stop`
    Stopped,
    /// Scan reached the end of the filtered stream
    Done,
    /// Aborted; see `last_error`
    Error,
}

impl ReplayState {
    /// Whether a task in this state still owns the coordinator
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

/// Dispatch pacing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayMode {
    /// Dispatch without delay
    Fast,
    /// Pace by the occurred-at gap between consecutive events, divided by
    /// the task speed
    Realtime,
}

/// Parameters for [`ReplayCoordinator::start`]
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayRequest {
    /// Topics to replay; empty replays all
    #[serde(default)]
    pub topics: Vec<Topic>,
    /// Sources to replay; empty replays all
    #[serde(default)]
    pub sources: Vec<String>,
    /// Inclusive occurred-at lower bound
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive occurred-at upper bound
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Pacing mode
    pub mode: ReplayMode,
    /// Pacing divisor for realtime mode; must be > 0
    pub speed: f64,
    /// Resume position from a previous task
    #[serde(default)]
    pub from_cursor: Option<FileCursor>,
}

impl Default for ReplayRequest {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            sources: Vec::new(),
            start_time: None,
            end_time: None,
            mode: ReplayMode::Fast,
            speed: 1.0,
            from_cursor: None,
        }
    }
}

/// Point-in-time view of the replay task, returned by every control call
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    /// Task id; empty while Idle
    pub id: String,
    /// Lifecycle state
    pub state: ReplayState,
    /// Pacing mode
    pub mode: ReplayMode,
    /// Pacing divisor
    pub speed: f64,
    /// Consumer invocations that completed
    pub dispatched: u64,
    /// Deliveries suppressed by the consume-marker store
    pub skipped: u64,
    /// Consumer invocations that returned an error
    pub errors: u64,
    /// Position of the last record read from the log
    pub cursor: Option<FileCursor>,
    /// Task launch time
    pub started_at: Option<DateTime<Utc>>,
    /// Task completion time, any terminal state
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure description when state is Error
    pub last_error: Option<String>,
}

impl TaskSnapshot {
    fn idle() -> Self {
        Self {
            id: String::new(),
            state: ReplayState::Idle,
            mode: ReplayMode::Fast,
            speed: 1.0,
            dispatched: 0,
            skipped: 0,
            errors: 0,
            cursor: None,
            started_at: None,
            finished_at: None,
            last_error: None,
        }
    }
}

/// Receives replayed (and live, in other deployments) envelope events
#[async_trait::async_trait]
pub trait EventConsumer: Send + Sync {
    /// Stable consumer identity; keys the delivery markers
    fn consumer_id(&self) -> &str;

    /// Handle one event. Errors are counted against the task but do not
    /// abort it.
    async fn handle(&self, event: &BusEvent) -> anyhow::Result<()>;
}

struct TaskShared {
    snapshot: Mutex<TaskSnapshot>,
    paused: AtomicBool,
    cancel_tx: watch::Sender<bool>,
}

/// Replay control surface; consumed by an external API layer
pub struct ReplayCoordinator {
    log: Arc<EventLog>,
    dedup: Arc<dyn ConsumeDedupStore>,
    order_policy: ReplayOrderPolicy,
    consumers: RwLock<Vec<Arc<dyn EventConsumer>>>,
    active: Mutex<Option<Arc<TaskShared>>>,
}

impl ReplayCoordinator {
    /// Coordinator with the default (drop) order-command policy
    #[must_use]
    pub fn new(log: Arc<EventLog>, dedup: Arc<dyn ConsumeDedupStore>) -> Self {
        Self::with_order_policy(log, dedup, ReplayOrderPolicy::Drop)
    }

    /// Coordinator with an explicit order-command policy
    #[must_use]
    pub fn with_order_policy(
        log: Arc<EventLog>,
        dedup: Arc<dyn ConsumeDedupStore>,
        order_policy: ReplayOrderPolicy,
    ) -> Self {
        Self {
            log,
            dedup,
            order_policy,
            consumers: RwLock::new(Vec::new()),
            active: Mutex::new(None),
        }
    }

    /// Register a consumer. Tasks capture the consumer set at launch.
    pub fn register_consumer(&self, consumer: Arc<dyn EventConsumer>) {
        info!(consumer = consumer.consumer_id(), "registered replay consumer");
        self.consumers.write().push(consumer);
    }

    /// Launch a replay task. Rejected while another task is active or when
    /// the request is invalid (speed <= 0).
    pub fn start(&self, req: ReplayRequest) -> Result<TaskSnapshot, ServiceError> {
        if !(req.speed > 0.0 && req.speed.is_finite()) {
            return Err(ServiceError::InvalidRequest(format!(
                "replay speed must be > 0, got {}",
                req.speed
            )));
        }
        let mut active = self.active.lock();
        if let Some(shared) = active.as_ref() {
            let snapshot = shared.snapshot.lock();
            if snapshot.state.is_active() {
                return Err(ServiceError::InvalidRequest(format!(
                    "replay task {} is still {:?}",
                    snapshot.id, snapshot.state
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        let (cancel_tx, _) = watch::channel(false);
        let shared = Arc::new(TaskShared {
            snapshot: Mutex::new(TaskSnapshot {
                id: id.clone(),
                state: ReplayState::Running,
                mode: req.mode,
                speed: req.speed,
                cursor: req.from_cursor.clone(),
                started_at: Some(Utc::now()),
                ..TaskSnapshot::idle()
            }),
            paused: AtomicBool::new(false),
            cancel_tx,
        });
        *active = Some(Arc::clone(&shared));

        let consumers = self.consumers.read().clone();
        info!(
            task = %id,
            mode = ?req.mode,
            speed = req.speed,
            consumers = consumers.len(),
            "starting replay task"
        );
        tokio::spawn(run_task(
            Arc::clone(&self.log),
            Arc::clone(&self.dedup),
            consumers,
            Arc::clone(&shared),
            req,
            self.order_policy,
        ));
        let snapshot = shared.snapshot.lock().clone();
        Ok(snapshot)
    }

    /// Gate dispatch; the underlying scan keeps its position
    pub fn pause(&self) -> Result<TaskSnapshot, ServiceError> {
        self.transition("pause", |shared, snapshot| match snapshot.state {
            ReplayState::Running | ReplayState::Paused => {
                shared.paused.store(true, Ordering::SeqCst);
                snapshot.state = ReplayState::Paused;
                Ok(())
            }
            state => Err(ServiceError::InvalidRequest(format!(
                "cannot pause a {state:?} task"
            ))),
        })
    }

    /// Clear the pause gate
    pub fn resume(&self) -> Result<TaskSnapshot, ServiceError> {
        self.transition("resume", |shared, snapshot| match snapshot.state {
            ReplayState::Paused | ReplayState::Running => {
                shared.paused.store(false, Ordering::SeqCst);
                snapshot.state = ReplayState::Running;
                Ok(())
            }
            state => Err(ServiceError::InvalidRequest(format!(
                "cannot resume a {state:?} task"
            ))),
        })
    }

    /// Cancel the task; the signal reaches both the pacing wait and the
    /// pause poll, terminating the scan promptly.
    pub fn stop(&self) -> Result<TaskSnapshot, ServiceError> {
        self.transition("stop", |shared, snapshot| {
            if !snapshot.state.is_active() {
                return Err(ServiceError::InvalidRequest(format!(
                    "cannot stop a {:?} task",
                    snapshot.state
                )));
            }
            shared.paused.store(false, Ordering::SeqCst);
            let _ = shared.cancel_tx.send(true);
            snapshot.state = ReplayState::Stopped;
            snapshot.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Snapshot of the current (or last) task; Idle before any task ran
    #[must_use]
    pub fn status(&self) -> TaskSnapshot {
        self.active
            .lock()
            .as_ref()
            .map_or_else(TaskSnapshot::idle, |shared| shared.snapshot.lock().clone())
    }

    fn transition(
        &self,
        op: &str,
        apply: impl FnOnce(&TaskShared, &mut TaskSnapshot) -> Result<(), ServiceError>,
    ) -> Result<TaskSnapshot, ServiceError> {
        let active = self.active.lock();
        let shared = active
            .as_ref()
            .ok_or_else(|| ServiceError::InvalidRequest(format!("no replay task to {op}")))?;
        let mut snapshot = shared.snapshot.lock();
        apply(shared, &mut snapshot)?;
        debug!(task = %snapshot.id, state = ?snapshot.state, "replay {op}");
        Ok(snapshot.clone())
    }
}

#[allow(clippy::too_many_lines)]
async fn run_task(
    log: Arc<EventLog>,
    dedup: Arc<dyn ConsumeDedupStore>,
    consumers: Vec<Arc<dyn EventConsumer>>,
    shared: Arc<TaskShared>,
    req: ReplayRequest,
    order_policy: ReplayOrderPolicy,
) {
    let task_id = shared.snapshot.lock().id.clone();
    // Make buffered live appends visible to the scan.
    if let Err(e) = log.flush() {
        fail(&shared, &format!("flush before scan: {e:#}"));
        return;
    }
    let filter = EventFilter {
        topics: req.topics.clone(),
        sources: req.sources.clone(),
        start: req.start_time,
        end: req.end_time,
        cursor: req.from_cursor.clone(),
    };
    let mut iter = match log.iterate(filter) {
        Ok(iter) => iter,
        Err(e) => {
            fail(&shared, &format!("opening log scan: {e:#}"));
            return;
        }
    };

    let mut cancel_rx = shared.cancel_tx.subscribe();
    let mut prev_occurred: Option<DateTime<Utc>> = None;
    loop {
        let next = match iter.next_event() {
            Ok(next) => next,
            Err(e) => {
                fail(&shared, &format!("log scan: {e:#}"));
                return;
            }
        };
        let Some((mut event, cursor)) = next else {
            finish(&shared, ReplayState::Done);
            return;
        };

        // Cooperative pause gate; the scan position is retained.
        while shared.paused.load(Ordering::SeqCst) {
            if *cancel_rx.borrow() {
                finish(&shared, ReplayState::Stopped);
                return;
            }
            tokio::select! {
                () = tokio::time::sleep(PAUSE_POLL) => {}
                _ = cancel_rx.changed() => {}
            }
        }
        if *cancel_rx.borrow() {
            finish(&shared, ReplayState::Stopped);
            return;
        }

        if req.mode == ReplayMode::Realtime {
            if let Some(prev) = prev_occurred {
                let gap = (event.occurred_at - prev).to_std().unwrap_or(Duration::ZERO);
                let wait = Duration::from_secs_f64(gap.as_secs_f64() / req.speed);
                if !wait.is_zero() {
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        _ = cancel_rx.changed() => {
                            if *cancel_rx.borrow() {
                                finish(&shared, ReplayState::Stopped);
                                return;
                            }
                        }
                    }
                }
            }
            prev_occurred = Some(event.occurred_at);
        }

        event.replay = true;
        event.replay_task_id = Some(task_id.clone());

        if event.topic == Topic::OrderCommand && order_policy == ReplayOrderPolicy::Drop {
            debug!(task = %task_id, event_id = event.event_id, "dropping order command on replay");
            shared.snapshot.lock().cursor = Some(cursor);
            continue;
        }

        let mut dispatched = 0u64;
        let mut skipped = 0u64;
        let mut errors = 0u64;
        for consumer in &consumers {
            match dedup.mark_if_first(consumer.consumer_id(), event.event_id) {
                Ok(true) => match consumer.handle(&event).await {
                    Ok(()) => dispatched += 1,
                    Err(e) => {
                        errors += 1;
                        warn!(
                            task = %task_id,
                            consumer = consumer.consumer_id(),
                            event_id = event.event_id,
                            "consumer failed: {e:#}"
                        );
                    }
                },
                Ok(false) => skipped += 1,
                Err(e) => {
                    fail(&shared, &format!("consume-marker store: {e:#}"));
                    return;
                }
            }
        }

        let mut snapshot = shared.snapshot.lock();
        snapshot.dispatched += dispatched;
        snapshot.skipped += skipped;
        snapshot.errors += errors;
        snapshot.cursor = Some(cursor);
    }
}

fn finish(shared: &TaskShared, state: ReplayState) {
    let mut snapshot = shared.snapshot.lock();
    if snapshot.state.is_active() {
        snapshot.state = state;
    }
    snapshot.finished_at.get_or_insert_with(Utc::now);
    info!(
        task = %snapshot.id,
        state = ?snapshot.state,
        dispatched = snapshot.dispatched,
        skipped = snapshot.skipped,
        errors = snapshot.errors,
        "replay task finished"
    );
}

fn fail(shared: &TaskShared, message: &str) {
    let mut snapshot = shared.snapshot.lock();
    snapshot.state = ReplayState::Error;
    snapshot.last_error = Some(message.to_string());
    snapshot.finished_at = Some(Utc::now());
    warn!(task = %snapshot.id, "replay task aborted: {message}");
}
