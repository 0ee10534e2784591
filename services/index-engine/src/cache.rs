//! Bounded per-minute bar history
//!
//! Index synthesis needs the last few minutes of per-contract bars plus a
//! carry-forward of each contract's most recent state. History is keyed by
//! minute and evicted explicitly: after every observation, minutes older
//! than the lookback window are pruned, capping memory regardless of how
//! many contracts trade.

use chrono::{Duration, NaiveDateTime};
use rustc_hash::FxHashMap;
use services_common::MinuteBar;
use std::collections::BTreeMap;

/// Most recent state observed for a contract, used to synthesize flat
/// zero-volume bars for minutes it did not trade.
#[derive(Debug, Clone, Copy)]
pub struct LastObserved {
    /// Last close price
    pub price: f64,
    /// Last open interest
    pub open_interest: f64,
    /// Last settlement price
    pub settlement: f64,
}

/// Minute-keyed bar history with a fixed lookback window
pub struct MinuteCache {
    lookback: Duration,
    by_minute: BTreeMap<NaiveDateTime, FxHashMap<String, MinuteBar>>,
    last_observed: FxHashMap<String, LastObserved>,
}

impl MinuteCache {
    /// Cache retaining `lookback_minutes` of history
    #[must_use]
    pub fn new(lookback_minutes: i64) -> Self {
        Self {
            lookback: Duration::minutes(lookback_minutes),
            by_minute: BTreeMap::new(),
            last_observed: FxHashMap::default(),
        }
    }

    /// Record a flushed per-contract bar and prune expired minutes
    pub fn observe(&mut self, bar: &MinuteBar) {
        self.last_observed.insert(
            bar.instrument_id.clone(),
            LastObserved {
                price: bar.close,
                open_interest: bar.open_interest,
                settlement: bar.settlement,
            },
        );
        self.by_minute
            .entry(bar.time)
            .or_default()
            .insert(bar.instrument_id.clone(), bar.clone());

        if let Some((&latest, _)) = self.by_minute.last_key_value() {
            let cutoff = latest - self.lookback;
            self.by_minute = self.by_minute.split_off(&cutoff);
        }
    }

    /// Bar for a contract at an exact minute, if it traded
    #[must_use]
    pub fn bar_at(&self, minute: NaiveDateTime, instrument_id: &str) -> Option<&MinuteBar> {
        self.by_minute.get(&minute)?.get(instrument_id)
    }

    /// Carry-forward state for a contract
    #[must_use]
    pub fn last_observed(&self, instrument_id: &str) -> Option<LastObserved> {
        self.last_observed.get(instrument_id).copied()
    }

    /// Number of retained minutes
    #[must_use]
    pub fn minutes(&self) -> usize {
        self.by_minute.len()
    }
}
