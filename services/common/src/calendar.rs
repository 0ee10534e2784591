//! Trading-day resolution

use crate::errors::ServiceError;
use chrono::{Datelike, Days, NaiveDate, Weekday};

/// Resolves the previous trading day for night-session attribution.
///
/// An authoritative implementation consults an exchange holiday calendar;
/// the weekday fallback below is used when none is available and treats
/// every Monday-Friday as a trading day.
pub trait TradingCalendar: Send + Sync {
    /// The trading day immediately before `day`
    fn prev_trading_day(&self, day: NaiveDate) -> Result<NaiveDate, ServiceError>;
}

/// Weekday-only fallback calendar: skips Saturday/Sunday, ignores holidays.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeekdayCalendar;

impl TradingCalendar for WeekdayCalendar {
    fn prev_trading_day(&self, day: NaiveDate) -> Result<NaiveDate, ServiceError> {
        let mut prev = day
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| ServiceError::Calendar(format!("day out of range: {day}")))?;
        while matches!(prev.weekday(), Weekday::Sat | Weekday::Sun) {
            prev = prev
                .checked_sub_days(Days::new(1))
                .ok_or_else(|| ServiceError::Calendar(format!("day out of range: {day}")))?;
        }
        Ok(prev)
    }
}
