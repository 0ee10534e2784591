//! Trading-day time mapping
//!
//! Day-session ticks (08:00-16:00) keep their timestamp. Everything else is
//! night session and is attributed to the previous trading day of the
//! tick's exchange trading day: times at or after 16:00 land on that day
//! itself, times before 08:00 (past midnight) land on the calendar day
//! after it.

use chrono::{Days, NaiveDateTime, Timelike};
use services_common::{ServiceError, TradingCalendar};

/// Day-session open hour (inclusive)
pub const DAY_SESSION_START_HOUR: u32 = 8;

/// Day-session close hour (exclusive)
pub const DAY_SESSION_END_HOUR: u32 = 16;

/// Map a tick's timestamp onto the calendar day it is attributed to
pub fn adjusted_time(
    trading_day: chrono::NaiveDate,
    update_time: NaiveDateTime,
    calendar: &dyn TradingCalendar,
) -> Result<NaiveDateTime, ServiceError> {
    let hour = update_time.hour();
    if (DAY_SESSION_START_HOUR..DAY_SESSION_END_HOUR).contains(&hour) {
        return Ok(update_time);
    }
    let prev = calendar.prev_trading_day(trading_day)?;
    let day = if hour < DAY_SESSION_START_HOUR {
        prev.checked_add_days(Days::new(1))
            .ok_or_else(|| ServiceError::Calendar(format!("day out of range: {prev}")))?
    } else {
        prev
    };
    Ok(day.and_time(update_time.time()))
}
