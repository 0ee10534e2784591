//! Test utilities and fixtures for QuoteHub testing
//!
//! Builders for domain values and small doubles for the storage boundary,
//! shared by the service crates' test suites.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use services_common::{BarStore, MinuteBar, ServiceError, Tick};
use std::sync::atomic::{AtomicU32, Ordering};

/// Fixed trading day used across tests (a Friday)
#[must_use]
pub fn trading_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 10).unwrap()
}

/// Timestamp on the fixed trading day
#[must_use]
pub fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    trading_day().and_hms_opt(h, m, s).unwrap()
}

/// Builder for ticks with sensible defaults
#[derive(Debug, Clone)]
pub struct TickBuilder {
    tick: Tick,
}

impl TickBuilder {
    /// Tick for `instrument` at `update_time` with defaults elsewhere
    #[must_use]
    pub fn new(instrument: &str, update_time: NaiveDateTime) -> Self {
        Self {
            tick: Tick {
                instrument_id: instrument.to_string(),
                exchange: "SHFE".to_string(),
                trading_day: update_time.date(),
                action_day: update_time.date(),
                update_time,
                last_price: 3500.0,
                volume: 0,
                open_interest: 1_000.0,
                settlement: 0.0,
            },
        }
    }

    /// Set the last traded price
    #[must_use]
    pub fn price(mut self, price: f64) -> Self {
        self.tick.last_price = price;
        self
    }

    /// Set the cumulative session volume
    #[must_use]
    pub fn volume(mut self, volume: i64) -> Self {
        self.tick.volume = volume;
        self
    }

    /// Set the open interest
    #[must_use]
    pub fn open_interest(mut self, oi: f64) -> Self {
        self.tick.open_interest = oi;
        self
    }

    /// Set the settlement price
    #[must_use]
    pub fn settlement(mut self, settlement: f64) -> Self {
        self.tick.settlement = settlement;
        self
    }

    /// Set the exchange trading day
    #[must_use]
    pub fn trading_day(mut self, day: NaiveDate) -> Self {
        self.tick.trading_day = day;
        self
    }

    /// Finish the tick
    #[must_use]
    pub fn build(self) -> Tick {
        self.tick
    }
}

/// Minute bar with defaults, for cache and store tests
#[must_use]
pub fn bar(instrument: &str, time: NaiveDateTime, close: f64, oi: f64) -> MinuteBar {
    MinuteBar {
        variety: services_common::variety_of(instrument).unwrap_or("rb").to_string(),
        instrument_id: instrument.to_string(),
        exchange: "SHFE".to_string(),
        time,
        adjusted_time: time,
        period: "1m".to_string(),
        open: close,
        high: close,
        low: close,
        close,
        volume: 10,
        open_interest: oi,
        settlement: 0.0,
    }
}

/// Bar store that fails transiently a fixed number of times before
/// delegating to an in-memory store. Exercises the retry boundary.
pub struct FlakyBarStore {
    remaining_failures: AtomicU32,
    /// Bars that made it through
    pub inner: services_common::MemoryBarStore,
    /// Upsert attempts observed, including failures
    pub attempts: AtomicU32,
}

impl FlakyBarStore {
    /// Store failing the first `failures` upserts
    #[must_use]
    pub fn new(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            inner: services_common::MemoryBarStore::new(),
            attempts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl BarStore for FlakyBarStore {
    async fn upsert_bar(&self, bar: &MinuteBar) -> Result<(), ServiceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ServiceError::StorageBusy("simulated lock timeout".into()));
        }
        self.inner.upsert_bar(bar).await
    }
}

/// Bar store recording upserts in arrival order
#[derive(Default)]
pub struct RecordingBarStore {
    /// Upserted bars, oldest first
    pub upserts: Mutex<Vec<MinuteBar>>,
}

impl RecordingBarStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bars upserted so far
    #[must_use]
    pub fn bars(&self) -> Vec<MinuteBar> {
        self.upserts.lock().clone()
    }
}

#[async_trait]
impl BarStore for RecordingBarStore {
    async fn upsert_bar(&self, bar: &MinuteBar) -> Result<(), ServiceError> {
        self.upserts.lock().push(bar.clone());
        Ok(())
    }
}
