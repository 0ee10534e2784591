//! Core domain types for QuoteHub

use crate::constants::{INDEX_EXCHANGE, INDEX_SUFFIX, PERIOD_1M};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// One market-data update for one futures instrument.
///
/// Ticks are ephemeral: they exist only while the ingest callback runs and
/// are never stored directly. `volume` is the exchange's cumulative session
/// counter, not a per-tick delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Instrument identifier, e.g. "rb2405"
    pub instrument_id: String,
    /// Exchange code, e.g. "SHFE"
    pub exchange: String,
    /// Trading day the exchange attributes this tick to
    pub trading_day: NaiveDate,
    /// Calendar day the tick actually occurred on
    pub action_day: NaiveDate,
    /// Exchange-local timestamp of the update
    pub update_time: NaiveDateTime,
    /// Last traded price
    pub last_price: f64,
    /// Cumulative session volume
    pub volume: i64,
    /// Open interest
    pub open_interest: f64,
    /// Settlement price (0 until published)
    pub settlement: f64,
}

/// Aggregated OHLCV + settlement summary for one instrument and minute.
///
/// Unique on (time, `instrument_id`, exchange, period); an upsert with the
/// same key overwrites every non-key field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteBar {
    /// Commodity variety code, e.g. "rb"
    pub variety: String,
    /// Instrument identifier
    pub instrument_id: String,
    /// Exchange code
    pub exchange: String,
    /// Minute-truncated raw timestamp (key component)
    pub time: NaiveDateTime,
    /// Trading-day-mapped timestamp for night-session attribution
    pub adjusted_time: NaiveDateTime,
    /// Bar period, always "1m" here
    pub period: String,
    /// First traded price of the minute
    pub open: f64,
    /// Highest traded price of the minute
    pub high: f64,
    /// Lowest traded price of the minute
    pub low: f64,
    /// Last traded price of the minute
    pub close: f64,
    /// Volume traded during the minute (delta, not cumulative)
    pub volume: i64,
    /// Open interest after the last tick of the minute
    pub open_interest: f64,
    /// Settlement price after the last tick of the minute
    pub settlement: f64,
}

impl MinuteBar {
    /// Open a new bar from the first tick of a minute
    #[must_use]
    pub fn open_from_tick(tick: &Tick, variety: &str, adjusted: NaiveDateTime, volume_delta: i64) -> Self {
        Self {
            variety: variety.to_string(),
            instrument_id: tick.instrument_id.clone(),
            exchange: tick.exchange.clone(),
            time: truncate_to_minute(tick.update_time),
            adjusted_time: truncate_to_minute(adjusted),
            period: PERIOD_1M.to_string(),
            open: tick.last_price,
            high: tick.last_price,
            low: tick.last_price,
            close: tick.last_price,
            volume: volume_delta,
            open_interest: tick.open_interest,
            settlement: tick.settlement,
        }
    }

    /// Fold another tick of the same minute into the bar.
    ///
    /// High/low widen, close follows, volume accumulates, open interest and
    /// settlement take the latest value.
    pub fn apply(&mut self, price: f64, volume_delta: i64, open_interest: f64, settlement: f64) {
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.close = price;
        self.volume += volume_delta;
        self.open_interest = open_interest;
        self.settlement = settlement;
    }

    /// Whether this bar is a synthetic weighted-index bar
    #[must_use]
    pub fn is_index(&self) -> bool {
        self.exchange == INDEX_EXCHANGE
    }
}

/// Truncate a timestamp to the start of its minute
#[must_use]
pub fn truncate_to_minute(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Extract the commodity variety from an instrument id.
///
/// The variety is the leading alphabetic prefix: "rb2405" -> "rb". Returns
/// `None` for ids with no alphabetic prefix, which are not valid futures
/// instruments here.
#[must_use]
pub fn variety_of(instrument_id: &str) -> Option<&str> {
    let end = instrument_id
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(instrument_id.len());
    if end == 0 { None } else { Some(&instrument_id[..end]) }
}

/// Instrument id carried by a variety's weighted-index series, e.g. "rbl9"
#[must_use]
pub fn index_instrument(variety: &str) -> String {
    format!("{variety}{INDEX_SUFFIX}")
}

/// Envelope occurred-at time for an exchange-local timestamp.
///
/// Exchange timestamps are naive; envelopes carry them verbatim under the
/// UTC label so replay pacing and range filters stay consistent with the
/// feed regardless of the host timezone.
#[must_use]
pub fn event_time(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&naive)
}
