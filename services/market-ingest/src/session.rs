//! Tick ingestion session
//!
//! Consumes [`SourceEvent`]s from a tick source and turns them into minute
//! bars. Per tick: fingerprint dedup, clock-drift control, trading-day time
//! mapping, then minute aggregation with delta-encoded volume. On minute
//! rollover the finished bar is upserted, handed to the index engine and
//! appended to the event log. The per-tick handler runs under a panic
//! supervisor so a faulty callback never takes the process down.

use crate::source::SourceEvent;
use crate::status::RuntimeStatusProjector;
use crate::supervisor::SupervisorHandle;
use crate::timemap;
use chrono::{Local, NaiveDate, NaiveDateTime, Utc};
use event_store::{BusEvent, EventLog, Topic};
use futures::FutureExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use services_common::types::{event_time, truncate_to_minute};
use services_common::{BarStore, IngestConfig, MinuteBar, Tick, TradingCalendar, variety_of};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use index_engine::IndexHandle;

/// Event source label on envelopes produced here
const EVENT_SOURCE: &str = "market-ingest";

/// Content identity of a tick, used to drop double-delivered packets.
#[derive(Debug, Clone, PartialEq)]
struct TickFingerprint {
    trading_day: NaiveDate,
    action_day: NaiveDate,
    update_time: NaiveDateTime,
    last_price: f64,
    volume: i64,
    open_interest: f64,
}

impl TickFingerprint {
    fn of(tick: &Tick) -> Self {
        Self {
            trading_day: tick.trading_day,
            action_day: tick.action_day,
            update_time: tick.update_time,
            last_price: tick.last_price,
            volume: tick.volume,
            open_interest: tick.open_interest,
        }
    }
}

struct FingerprintEntry {
    fingerprint: TickFingerprint,
    /// Wall-clock arrival, which judges the dedup window
    arrived: Instant,
}

#[derive(Default)]
struct DriftState {
    paused: bool,
    resume_streak: u32,
}

#[derive(Default)]
struct IngestState {
    fingerprints: FxHashMap<String, FingerprintEntry>,
    last_cumulative: FxHashMap<String, i64>,
    open_bars: FxHashMap<String, MinuteBar>,
    drift: DriftState,
}

/// What the synchronous per-tick pipeline decided
enum TickDecision {
    /// Identical fingerprint within the dedup window
    DuplicateDropped,
    /// Drift beyond threshold; ingestion (now) paused
    DriftDropped { drift_secs: i64, newly_paused: bool },
    /// In-threshold tick while paused, streak not yet complete
    DriftGated { drift_secs: i64 },
    /// Tick aggregated; `rolled` is the finished bar of a minute rollover
    Accepted {
        drift_secs: Option<i64>,
        resumed: bool,
        rolled: Option<MinuteBar>,
    },
}

/// Wall-clock provider; injectable so drift behavior is testable
pub type WallClock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// The tick-ingestion/aggregation session
pub struct TickIngestSession {
    cfg: IngestConfig,
    calendar: Arc<dyn TradingCalendar>,
    bars: Arc<dyn BarStore>,
    log: Arc<EventLog>,
    status: Arc<RuntimeStatusProjector>,
    index: Option<IndexHandle>,
    wall_clock: WallClock,
    state: Mutex<IngestState>,
}

impl TickIngestSession {
    /// Build a session over the injected collaborators
    #[must_use]
    pub fn new(
        cfg: IngestConfig,
        calendar: Arc<dyn TradingCalendar>,
        bars: Arc<dyn BarStore>,
        log: Arc<EventLog>,
        status: Arc<RuntimeStatusProjector>,
    ) -> Self {
        Self {
            cfg,
            calendar,
            bars,
            log,
            status,
            index: None,
            wall_clock: Arc::new(|| Local::now().naive_local()),
            state: Mutex::new(IngestState::default()),
        }
    }

    /// Attach the weighted-index engine
    #[must_use]
    pub fn with_index(mut self, index: IndexHandle) -> Self {
        self.index = Some(index);
        self
    }

    /// Override the wall clock used for drift evaluation
    #[must_use]
    pub fn with_wall_clock(mut self, wall_clock: WallClock) -> Self {
        self.wall_clock = wall_clock;
        self
    }

    /// Consume source events until the channel closes. Disconnects are
    /// forwarded to the supervisor; tick handling is panic-supervised.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<SourceEvent>,
        supervisor: Option<SupervisorHandle>,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                SourceEvent::Connected => {
                    info!("front connected");
                    self.status.update(|s| s.connected = true);
                }
                SourceEvent::LoggedIn => {
                    info!("front login complete");
                    self.status.update(|s| s.logged_in = true);
                }
                SourceEvent::Disconnected { reason } => {
                    warn!(reason = %reason, "front disconnected");
                    self.status.update(|s| {
                        s.connected = false;
                        s.logged_in = false;
                        s.subscribed = false;
                    });
                    if let Some(handle) = &supervisor {
                        handle.notify_disconnect(&reason);
                    }
                }
                SourceEvent::Tick(tick) => {
                    let instrument = tick.instrument_id.clone();
                    match AssertUnwindSafe(self.handle_tick(tick)).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(instrument = %instrument, "tick rejected: {e:#}");
                        }
                        Err(panic) => {
                            error!(
                                instrument = %instrument,
                                backtrace = %std::backtrace::Backtrace::force_capture(),
                                "tick handler panicked: {}",
                                panic_message(&panic)
                            );
                        }
                    }
                }
            }
        }
        info!("source channel closed, ingest session ending");
    }

    /// Upsert every currently-open bar without waiting for rollover.
    /// Called at shutdown; bars stay open for further ticks.
    pub async fn flush_open_bars(&self) -> anyhow::Result<()> {
        let open: Vec<MinuteBar> = self.state.lock().open_bars.values().cloned().collect();
        for bar in &open {
            self.bars.upsert_bar(bar).await?;
        }
        info!(bars = open.len(), "flushed open bars");
        Ok(())
    }

    /// Full per-tick pipeline
    pub async fn handle_tick(&self, tick: Tick) -> anyhow::Result<()> {
        let Some(variety) = variety_of(&tick.instrument_id) else {
            warn!(instrument = %tick.instrument_id, "unresolvable variety, tick skipped");
            return Ok(());
        };
        let variety = variety.to_string();
        let adjusted = timemap::adjusted_time(tick.trading_day, tick.update_time, self.calendar.as_ref())?;

        let decision = self.decide(&tick, &variety, adjusted);
        match decision {
            TickDecision::DuplicateDropped => {
                self.status.update(|s| s.dedup_dropped += 1);
                debug!(instrument = %tick.instrument_id, "duplicate tick dropped");
            }
            TickDecision::DriftDropped { drift_secs, newly_paused } => {
                warn!(
                    instrument = %tick.instrument_id,
                    drift_secs,
                    "tick drift beyond threshold, ingestion paused"
                );
                self.status.update(|s| {
                    s.drift_seconds = drift_secs;
                    s.drift_paused = true;
                    if newly_paused {
                        s.drift_pause_count += 1;
                    }
                });
            }
            TickDecision::DriftGated { drift_secs } => {
                self.status.update(|s| s.drift_seconds = drift_secs);
            }
            TickDecision::Accepted { drift_secs, resumed, rolled } => {
                if resumed {
                    info!("drift pause cleared, ingestion resumed");
                }
                if let Some(bar) = rolled {
                    self.flush_bar(&bar).await?;
                }
                self.append_tick_event(&tick)?;
                self.status.update(|s| {
                    s.last_tick_time = Some(Utc::now());
                    if let Some(drift) = drift_secs {
                        s.drift_seconds = drift;
                    }
                    if resumed {
                        s.drift_paused = false;
                    }
                });
            }
        }
        Ok(())
    }

    /// Synchronous pipeline stage: dedup, drift, aggregation, all under the
    /// session state lock.
    fn decide(&self, tick: &Tick, variety: &str, adjusted: NaiveDateTime) -> TickDecision {
        let mut state = self.state.lock();

        // 1. Fingerprint dedup, judged by wall-clock arrival time.
        let fingerprint = TickFingerprint::of(tick);
        let now = Instant::now();
        let window = Duration::from_millis(self.cfg.dedup_window_ms);
        let duplicate = state.fingerprints.get(&tick.instrument_id).is_some_and(|entry| {
            entry.fingerprint == fingerprint && now.duration_since(entry.arrived) <= window
        });
        state.fingerprints.insert(
            tick.instrument_id.clone(),
            FingerprintEntry { fingerprint, arrived: now },
        );
        if duplicate {
            return TickDecision::DuplicateDropped;
        }

        // 2. Drift control. Only judged when the adjusted date is near the
        // wall clock; stale or historical data never trips the pause.
        let now_wall = (self.wall_clock)();
        let mut drift_secs = None;
        let mut resumed = false;
        let date_gap = (adjusted.date() - now_wall.date()).num_days().abs();
        if date_gap <= 1 {
            let drift = (now_wall - adjusted).num_seconds().abs();
            drift_secs = Some(drift);
            if drift > self.cfg.drift_threshold_secs as i64 {
                let newly_paused = !state.drift.paused;
                state.drift.paused = true;
                state.drift.resume_streak = 0;
                return TickDecision::DriftDropped { drift_secs: drift, newly_paused };
            }
            if state.drift.paused {
                state.drift.resume_streak += 1;
                if state.drift.resume_streak < self.cfg.drift_resume_ticks {
                    return TickDecision::DriftGated { drift_secs: drift };
                }
                state.drift.paused = false;
                state.drift.resume_streak = 0;
                resumed = true;
            }
        }

        // 3. Delta-encode volume from the cumulative session counter.
        let previous = state
            .last_cumulative
            .insert(tick.instrument_id.clone(), tick.volume);
        let volume_delta = match previous {
            // Cumulative counter went backwards: session reset, the new
            // value is the whole delta.
            Some(prev) if tick.volume >= prev => tick.volume - prev,
            _ => tick.volume,
        };

        // 4. Minute aggregation.
        let minute = truncate_to_minute(tick.update_time);
        let same_minute = state
            .open_bars
            .get(&tick.instrument_id)
            .map(|bar| bar.time == minute);
        let rolled = match same_minute {
            Some(true) => {
                if let Some(bar) = state.open_bars.get_mut(&tick.instrument_id) {
                    bar.apply(tick.last_price, volume_delta, tick.open_interest, tick.settlement);
                }
                None
            }
            Some(false) => {
                let finished = state.open_bars.remove(&tick.instrument_id);
                let bar = MinuteBar::open_from_tick(tick, variety, adjusted, volume_delta);
                state.open_bars.insert(tick.instrument_id.clone(), bar);
                finished
            }
            None => {
                let bar = MinuteBar::open_from_tick(tick, variety, adjusted, volume_delta);
                state.open_bars.insert(tick.instrument_id.clone(), bar);
                None
            }
        };

        TickDecision::Accepted { drift_secs, resumed, rolled }
    }

    /// Rollover path: persist the finished bar, notify the index engine,
    /// log the bar event.
    async fn flush_bar(&self, bar: &MinuteBar) -> anyhow::Result<()> {
        self.bars.upsert_bar(bar).await?;
        if let Some(index) = &self.index {
            index.on_bar(bar);
        }
        let mut event = BusEvent::new(
            Topic::Bar,
            EVENT_SOURCE,
            event_time(bar.time),
            serde_json::to_value(bar)?,
        );
        self.log.append(&mut event)?;
        debug!(instrument = %bar.instrument_id, minute = %bar.time, "minute bar closed");
        Ok(())
    }

    fn append_tick_event(&self, tick: &Tick) -> anyhow::Result<()> {
        let mut event = BusEvent::new(
            Topic::Tick,
            EVENT_SOURCE,
            event_time(tick.update_time),
            serde_json::to_value(tick)?,
        );
        self.log.append(&mut event)?;
        Ok(())
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
