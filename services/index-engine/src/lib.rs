//! Index Engine Service
//!
//! Derives the synthetic open-interest-weighted continuous contract ("L9")
//! per commodity variety from per-contract minute bars. Submissions arrive
//! on a bounded queue and are processed by a small worker pool; a full
//! queue drops the task rather than blocking the producer.

pub mod cache;

use anyhow::Result;
use cache::{LastObserved, MinuteCache};
use chrono::NaiveDateTime;
use event_store::{BusEvent, EventLog, Topic};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use services_common::constants::{INDEX_EXCHANGE, PERIOD_1M};
use services_common::types::event_time;
use services_common::{BarStore, IndexConfig, MinuteBar, index_instrument};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One unit of work: recompute a variety's index bar for a minute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexTask {
    /// Commodity variety, e.g. "rb"
    pub variety: String,
    /// Minute to compute
    pub minute: NaiveDateTime,
}

struct IndexShared {
    bars: Arc<dyn BarStore>,
    log: Arc<EventLog>,
    expected: FxHashMap<String, Vec<String>>,
    cache: Mutex<MinuteCache>,
}

/// Producer-side handle: feeds observed bars in and schedules recomputes
#[derive(Clone)]
pub struct IndexHandle {
    tx: mpsc::Sender<IndexTask>,
    shared: Arc<IndexShared>,
}

impl IndexHandle {
    /// Record a flushed per-contract bar and schedule its variety/minute.
    /// Synthetic index bars are ignored; they never feed themselves.
    pub fn on_bar(&self, bar: &MinuteBar) {
        if bar.is_index() {
            return;
        }
        self.shared.cache.lock().observe(bar);
        self.submit(IndexTask {
            variety: bar.variety.clone(),
            minute: bar.time,
        });
    }

    /// Non-blocking submission; a full queue drops the task
    pub fn submit(&self, task: IndexTask) {
        match self.tx.try_send(task) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!(variety = %task.variety, minute = %task.minute, "index queue full, dropping task");
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                warn!(variety = %task.variety, "index workers stopped, dropping task");
            }
        }
    }
}

/// Weighted-index calculator: bounded queue + worker pool
pub struct WeightedIndexCalculator {
    cfg: IndexConfig,
    shared: Arc<IndexShared>,
}

impl WeightedIndexCalculator {
    /// Build the calculator; varieties and their expected instrument sets
    /// come from configuration, registered before any tick flows.
    #[must_use]
    pub fn new(cfg: IndexConfig, bars: Arc<dyn BarStore>, log: Arc<EventLog>) -> Self {
        let expected: FxHashMap<String, Vec<String>> = cfg
            .varieties
            .iter()
            .map(|(variety, instruments)| (variety.clone(), instruments.clone()))
            .collect();
        info!(varieties = expected.len(), "index calculator registered varieties");
        let shared = Arc::new(IndexShared {
            bars,
            log,
            expected,
            cache: Mutex::new(MinuteCache::new(cfg.lookback_minutes)),
        });
        Self { cfg, shared }
    }

    /// Spawn the worker pool and hand back the producer handle
    #[must_use]
    pub fn start(self) -> (IndexHandle, Vec<tokio::task::JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<IndexTask>(self.cfg.queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = Vec::with_capacity(self.cfg.workers);
        for worker_id in 0..self.cfg.workers {
            let shared = Arc::clone(&self.shared);
            let rx = Arc::clone(&rx);
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, shared, rx).await;
            }));
        }
        info!(workers = self.cfg.workers, queue = self.cfg.queue_size, "index workers started");
        (
            IndexHandle {
                tx,
                shared: self.shared,
            },
            workers,
        )
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<IndexShared>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<IndexTask>>>,
) {
    loop {
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else {
            debug!(worker_id, "index queue closed, worker exiting");
            return;
        };
        let Some(bar) = compute_index_bar(&shared, &task) else {
            continue;
        };
        if let Err(e) = persist_index_bar(&shared, bar).await {
            warn!(worker_id, variety = %task.variety, "index bar persist failed: {e:#}");
        }
    }
}

async fn persist_index_bar(shared: &IndexShared, bar: MinuteBar) -> Result<()> {
    shared.bars.upsert_bar(&bar).await?;
    let mut event = BusEvent::new(
        Topic::Bar,
        "index-engine",
        event_time(bar.time),
        serde_json::to_value(&bar)?,
    );
    shared.log.append(&mut event)?;
    debug!(instrument = %bar.instrument_id, minute = %bar.time, "emitted index bar");
    Ok(())
}

/// OI-weighted composite across a variety's expected instruments.
///
/// A contract contributes its bar for the exact minute when present, else a
/// flat zero-volume bar carried forward from its last observed state.
/// Returns `None` when no contributing open interest exists.
fn compute_index_bar(shared: &IndexShared, task: &IndexTask) -> Option<MinuteBar> {
    let Some(expected) = shared.expected.get(&task.variety) else {
        warn!(variety = %task.variety, "no registered instruments for variety, skipping");
        return None;
    };

    let members: Vec<MinuteBar> = {
        let cache = shared.cache.lock();
        expected
            .iter()
            .filter_map(|instrument| {
                cache.bar_at(task.minute, instrument).cloned().or_else(|| {
                    cache
                        .last_observed(instrument)
                        .map(|last| carry_forward_bar(task, instrument, last))
                })
            })
            .collect()
    };

    let total_oi: f64 = members
        .iter()
        .map(|b| b.open_interest)
        .filter(|oi| *oi > 0.0)
        .sum();
    if total_oi <= 0.0 {
        return None;
    }

    let weighted = |field: fn(&MinuteBar) -> f64| -> f64 {
        members
            .iter()
            .filter(|b| b.open_interest > 0.0)
            .map(|b| field(b) * b.open_interest)
            .sum::<f64>()
            / total_oi
    };

    Some(MinuteBar {
        variety: task.variety.clone(),
        instrument_id: index_instrument(&task.variety),
        exchange: INDEX_EXCHANGE.to_string(),
        time: task.minute,
        adjusted_time: task.minute,
        period: PERIOD_1M.to_string(),
        open: weighted(|b| b.open),
        high: weighted(|b| b.high),
        low: weighted(|b| b.low),
        close: weighted(|b| b.close),
        volume: weighted(|b| b.volume as f64).round() as i64,
        open_interest: total_oi,
        settlement: weighted(|b| b.settlement),
    })
}

fn carry_forward_bar(task: &IndexTask, instrument: &str, last: LastObserved) -> MinuteBar {
    MinuteBar {
        variety: task.variety.clone(),
        instrument_id: instrument.to_string(),
        exchange: String::new(),
        time: task.minute,
        adjusted_time: task.minute,
        period: PERIOD_1M.to_string(),
        open: last.price,
        high: last.price,
        low: last.price,
        close: last.price,
        volume: 0,
        open_interest: last.open_interest,
        settlement: last.settlement,
    }
}
