//! Replay coordinator tests: state machine, pacing, at-most-once delivery

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use event_store::{
    BusEvent, ConsumeDedupStore, EventConsumer, EventLog, MemoryDedupStore, OrderSafetyGuard,
    ReplayCoordinator, ReplayMarker, ReplayMode, ReplayOrderPolicy, ReplayRequest, ReplayState,
    TaskSnapshot, Topic,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Consumer that records everything it is handed
struct RecordingConsumer {
    id: String,
    events: Mutex<Vec<BusEvent>>,
}

impl RecordingConsumer {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            events: Mutex::new(Vec::new()),
        })
    }

    fn received(&self) -> Vec<BusEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventConsumer for RecordingConsumer {
    fn consumer_id(&self) -> &str {
        &self.id
    }

    async fn handle(&self, event: &BusEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Dedup store whose marker lookups always fail
struct BrokenDedupStore;

impl ConsumeDedupStore for BrokenDedupStore {
    fn mark_if_first(&self, _consumer_id: &str, _event_id: u64) -> Result<bool> {
        anyhow::bail!("marker table unavailable")
    }
}

fn seed_log(dir: &TempDir, gaps_secs: &[i64], topic: Topic) -> Arc<EventLog> {
    let log = Arc::new(EventLog::open(dir.path(), Duration::ZERO).unwrap());
    let base = Utc.timestamp_opt(1_715_300_000, 0).unwrap();
    for gap in gaps_secs {
        let at = base + chrono::Duration::seconds(*gap);
        let mut event = BusEvent::new(topic, "test", at, serde_json::json!({ "t": gap }));
        event.produced_at = at;
        log.append(&mut event).unwrap();
    }
    log
}

async fn wait_terminal(coordinator: &ReplayCoordinator) -> TaskSnapshot {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = coordinator.status();
        if !snapshot.state.is_active() {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "replay task did not finish in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn fast_request() -> ReplayRequest {
    ReplayRequest {
        mode: ReplayMode::Fast,
        speed: 1.0,
        ..ReplayRequest::default()
    }
}

#[tokio::test]
async fn double_replay_dispatches_each_event_once() -> Result<()> {
    let dir = TempDir::new()?;
    let log = seed_log(&dir, &[0, 1], Topic::Tick);
    let dedup: Arc<dyn ConsumeDedupStore> = Arc::new(MemoryDedupStore::new());

    // First replay delivers both events.
    let consumer = RecordingConsumer::new("strategy-a");
    let coordinator = ReplayCoordinator::new(log.clone(), dedup.clone());
    coordinator.register_consumer(consumer.clone());
    coordinator.start(fast_request())?;
    let first = wait_terminal(&coordinator).await;
    assert_eq!(first.state, ReplayState::Done);
    assert_eq!(first.dispatched, 2);
    assert_eq!(first.skipped, 0);

    // Second replay with the same consumer id and dedup store skips both.
    let repeat = RecordingConsumer::new("strategy-a");
    let coordinator = ReplayCoordinator::new(log, dedup);
    coordinator.register_consumer(repeat.clone());
    coordinator.start(fast_request())?;
    let second = wait_terminal(&coordinator).await;
    assert_eq!(second.state, ReplayState::Done);
    assert_eq!(second.dispatched, 0);
    assert_eq!(second.skipped, 2);

    // Total deliveries across both replays: 2, not 4.
    assert_eq!(consumer.received().len() + repeat.received().len(), 2);
    Ok(())
}

#[tokio::test]
async fn realtime_pacing_takes_wall_time() -> Result<()> {
    let dir = TempDir::new()?;
    let log = seed_log(&dir, &[0, 1], Topic::Tick);
    let consumer = RecordingConsumer::new("strategy-a");
    let coordinator = ReplayCoordinator::new(log, Arc::new(MemoryDedupStore::new()));
    coordinator.register_consumer(consumer.clone());

    let started = Instant::now();
    coordinator.start(ReplayRequest {
        mode: ReplayMode::Realtime,
        speed: 1.0,
        ..ReplayRequest::default()
    })?;
    let snapshot = wait_terminal(&coordinator).await;

    assert_eq!(snapshot.state, ReplayState::Done);
    assert_eq!(snapshot.dispatched, 2);
    // Events one second apart at speed 1.0: the second dispatch waits ~1s.
    assert!(started.elapsed() >= Duration::from_millis(900));
    Ok(())
}

#[tokio::test]
async fn speed_divides_the_pacing_gap() -> Result<()> {
    let dir = TempDir::new()?;
    let log = seed_log(&dir, &[0, 2], Topic::Tick);
    let coordinator = ReplayCoordinator::new(log, Arc::new(MemoryDedupStore::new()));
    coordinator.register_consumer(RecordingConsumer::new("strategy-a"));

    let started = Instant::now();
    coordinator.start(ReplayRequest {
        mode: ReplayMode::Realtime,
        speed: 10.0,
        ..ReplayRequest::default()
    })?;
    let snapshot = wait_terminal(&coordinator).await;

    assert_eq!(snapshot.dispatched, 2);
    // A 2s gap at speed 10 is ~200ms.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");
    Ok(())
}

#[tokio::test]
async fn pause_gates_dispatch_and_resume_finishes() -> Result<()> {
    let dir = TempDir::new()?;
    let log = seed_log(&dir, &[0, 1, 2], Topic::Tick);
    let consumer = RecordingConsumer::new("strategy-a");
    let coordinator = ReplayCoordinator::new(log, Arc::new(MemoryDedupStore::new()));
    coordinator.register_consumer(consumer.clone());

    coordinator.start(ReplayRequest {
        mode: ReplayMode::Realtime,
        speed: 2.0,
        ..ReplayRequest::default()
    })?;
    let paused = coordinator.pause()?;
    assert_eq!(paused.state, ReplayState::Paused);

    // While paused the scan is gated, not canceled.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(coordinator.status().dispatched < 3);
    assert_eq!(coordinator.status().state, ReplayState::Paused);

    let resumed = coordinator.resume()?;
    assert_eq!(resumed.state, ReplayState::Running);
    let snapshot = wait_terminal(&coordinator).await;
    assert_eq!(snapshot.state, ReplayState::Done);
    assert_eq!(snapshot.dispatched, 3);
    assert_eq!(consumer.received().len(), 3);
    Ok(())
}

#[tokio::test]
async fn stop_cancels_promptly_and_frees_the_coordinator() -> Result<()> {
    let dir = TempDir::new()?;
    // Huge gap: without cancellation the task would sleep for minutes.
    let log = seed_log(&dir, &[0, 600], Topic::Tick);
    let coordinator = ReplayCoordinator::new(log, Arc::new(MemoryDedupStore::new()));
    coordinator.register_consumer(RecordingConsumer::new("strategy-a"));

    coordinator.start(ReplayRequest {
        mode: ReplayMode::Realtime,
        speed: 1.0,
        ..ReplayRequest::default()
    })?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stopped = coordinator.stop()?;
    assert_eq!(stopped.state, ReplayState::Stopped);

    // A stopped coordinator accepts a new task.
    tokio::time::sleep(Duration::from_millis(200)).await;
    coordinator.start(fast_request())?;
    let snapshot = wait_terminal(&coordinator).await;
    assert_eq!(snapshot.state, ReplayState::Done);
    Ok(())
}

#[tokio::test]
async fn start_rejects_while_a_task_is_active() -> Result<()> {
    let dir = TempDir::new()?;
    let log = seed_log(&dir, &[0, 600], Topic::Tick);
    let coordinator = ReplayCoordinator::new(log, Arc::new(MemoryDedupStore::new()));

    coordinator.start(ReplayRequest {
        mode: ReplayMode::Realtime,
        speed: 1.0,
        ..ReplayRequest::default()
    })?;
    assert!(coordinator.start(fast_request()).is_err());
    coordinator.stop()?;
    Ok(())
}

#[tokio::test]
async fn invalid_speed_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let log = seed_log(&dir, &[0], Topic::Tick);
    let coordinator = ReplayCoordinator::new(log, Arc::new(MemoryDedupStore::new()));

    for speed in [0.0, -1.0, f64::NAN] {
        let result = coordinator.start(ReplayRequest {
            mode: ReplayMode::Fast,
            speed,
            ..ReplayRequest::default()
        });
        assert!(result.is_err(), "speed {speed} should be rejected");
    }
    assert_eq!(coordinator.status().state, ReplayState::Idle);
    Ok(())
}

#[tokio::test]
async fn replayed_events_carry_the_replay_marker() -> Result<()> {
    let dir = TempDir::new()?;
    let log = seed_log(&dir, &[0], Topic::Tick);
    let consumer = RecordingConsumer::new("strategy-a");
    let coordinator = ReplayCoordinator::new(log, Arc::new(MemoryDedupStore::new()));
    coordinator.register_consumer(consumer.clone());

    let started = coordinator.start(fast_request())?;
    wait_terminal(&coordinator).await;

    let received = consumer.received();
    assert_eq!(received.len(), 1);
    assert!(received[0].replay);
    assert_eq!(received[0].replay_task_id.as_deref(), Some(started.id.as_str()));
    Ok(())
}

#[tokio::test]
async fn order_commands_are_dropped_by_default() -> Result<()> {
    let dir = TempDir::new()?;
    let log = seed_log(&dir, &[0], Topic::Tick);
    let base = Utc.timestamp_opt(1_715_300_005, 0).unwrap();
    let mut order = BusEvent::new(Topic::OrderCommand, "trader", base, serde_json::json!({}));
    order.produced_at = base;
    log.append(&mut order)?;

    let consumer = RecordingConsumer::new("strategy-a");
    let coordinator = ReplayCoordinator::new(log, Arc::new(MemoryDedupStore::new()));
    coordinator.register_consumer(consumer.clone());
    coordinator.start(fast_request())?;
    let snapshot = wait_terminal(&coordinator).await;

    assert_eq!(snapshot.dispatched, 1);
    let received = consumer.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].topic, Topic::Tick);
    Ok(())
}

#[tokio::test]
async fn marked_order_commands_hit_the_safety_guard() -> Result<()> {
    let dir = TempDir::new()?;
    let log = seed_log(&dir, &[0], Topic::OrderCommand);
    let consumer = RecordingConsumer::new("order-router");
    let coordinator = ReplayCoordinator::with_order_policy(
        log,
        Arc::new(MemoryDedupStore::new()),
        ReplayOrderPolicy::DispatchMarked,
    );
    coordinator.register_consumer(consumer.clone());
    coordinator.start(fast_request())?;
    wait_terminal(&coordinator).await;

    let received = consumer.received();
    assert_eq!(received.len(), 1);
    let marker = ReplayMarker::from_event(&received[0]).expect("marker expected");

    // The downstream order-dispatch guard rejects the replayed command
    // unless replay-order dispatch was explicitly enabled.
    assert!(OrderSafetyGuard::new(false).check(Some(&marker)).is_err());
    assert!(OrderSafetyGuard::new(true).check(Some(&marker)).is_ok());
    Ok(())
}

#[tokio::test]
async fn marker_store_failure_aborts_into_error_state() -> Result<()> {
    let dir = TempDir::new()?;
    let log = seed_log(&dir, &[0], Topic::Tick);
    let coordinator = ReplayCoordinator::new(log, Arc::new(BrokenDedupStore));
    coordinator.register_consumer(RecordingConsumer::new("strategy-a"));
    coordinator.start(fast_request())?;
    let snapshot = wait_terminal(&coordinator).await;

    assert_eq!(snapshot.state, ReplayState::Error);
    assert!(snapshot.last_error.is_some());
    Ok(())
}

#[tokio::test]
async fn consumer_errors_count_but_do_not_abort() -> Result<()> {
    struct FailingConsumer;

    #[async_trait]
    impl EventConsumer for FailingConsumer {
        fn consumer_id(&self) -> &str {
            "failing"
        }

        async fn handle(&self, _event: &BusEvent) -> Result<()> {
            anyhow::bail!("handler exploded")
        }
    }

    let dir = TempDir::new()?;
    let log = seed_log(&dir, &[0, 1], Topic::Tick);
    let coordinator = ReplayCoordinator::new(log, Arc::new(MemoryDedupStore::new()));
    coordinator.register_consumer(Arc::new(FailingConsumer));
    coordinator.start(fast_request())?;
    let snapshot = wait_terminal(&coordinator).await;

    assert_eq!(snapshot.state, ReplayState::Done);
    assert_eq!(snapshot.dispatched, 0);
    assert_eq!(snapshot.errors, 2);
    Ok(())
}

#[tokio::test]
async fn resume_from_cursor_skips_replayed_prefix() -> Result<()> {
    let dir = TempDir::new()?;
    let log = seed_log(&dir, &[0, 1, 2, 3], Topic::Tick);

    // First task consumes everything; keep its final cursor.
    let coordinator = ReplayCoordinator::new(log.clone(), Arc::new(MemoryDedupStore::new()));
    coordinator.register_consumer(RecordingConsumer::new("strategy-a"));
    coordinator.start(fast_request())?;
    let first = wait_terminal(&coordinator).await;
    let cursor = first.cursor.expect("cursor after scan");

    // Append two more events, then resume from the cursor with a fresh
    // dedup store: only the new suffix is delivered.
    let base = Utc.timestamp_opt(1_715_300_010, 0).unwrap();
    for i in 0..2 {
        let at = base + chrono::Duration::seconds(i);
        let mut event = BusEvent::new(Topic::Tick, "test", at, serde_json::json!({"extra": i}));
        event.produced_at = at;
        log.append(&mut event)?;
    }

    let tail = RecordingConsumer::new("strategy-b");
    let coordinator = ReplayCoordinator::new(log, Arc::new(MemoryDedupStore::new()));
    coordinator.register_consumer(tail.clone());
    coordinator.start(ReplayRequest {
        from_cursor: Some(cursor),
        ..fast_request()
    })?;
    let snapshot = wait_terminal(&coordinator).await;

    assert_eq!(snapshot.state, ReplayState::Done);
    assert_eq!(snapshot.dispatched, 2);
    assert_eq!(tail.received().len(), 2);
    Ok(())
}
