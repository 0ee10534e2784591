//! Shared domain types and service boundaries for QuoteHub
//!
//! Everything that more than one service needs lives here: the tick and
//! minute-bar domain model, configuration, the trading-day calendar, and the
//! bar-persistence boundary with its retry discipline.

pub mod calendar;
pub mod config;
pub mod constants;
pub mod errors;
pub mod storage;
pub mod types;

pub use calendar::{TradingCalendar, WeekdayCalendar};
pub use config::{
    EventLogConfig, HubConfig, IndexConfig, IngestConfig, ReconnectConfig, ReplayConfig,
};
pub use errors::ServiceError;
pub use storage::{BarStore, MemoryBarStore, RetryPolicy, RetryingBarStore};
pub use types::{MinuteBar, Tick, index_instrument, variety_of};
