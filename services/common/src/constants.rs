//! Named constants shared across QuoteHub services

/// Bar period identifier for one-minute bars
pub const PERIOD_1M: &str = "1m";

/// Exchange code carried by synthetic weighted-index bars
pub const INDEX_EXCHANGE: &str = "L9";

/// Instrument suffix appended to a variety for its weighted-index series
pub const INDEX_SUFFIX: &str = "l9";

/// Default configuration values
pub mod defaults {
    /// Tick fingerprint dedup window in milliseconds
    pub const DEDUP_WINDOW_MS: u64 = 2_000;
    /// Clock-drift pause threshold in seconds
    pub const DRIFT_THRESHOLD_SECS: u64 = 5;
    /// Consecutive in-threshold ticks required to clear a drift pause
    pub const DRIFT_RESUME_TICKS: u32 = 3;
    /// Tick recency window for the derived market-open flag, in seconds
    pub const STALENESS_WINDOW_SECS: u64 = 60;

    /// First reconnect backoff in milliseconds
    pub const INITIAL_BACKOFF_MS: u64 = 1_000;
    /// Reconnect backoff ceiling in milliseconds
    pub const MAX_BACKOFF_MS: u64 = 30_000;
    /// Uniform jitter applied around each backoff delay
    pub const JITTER_RATIO: f64 = 0.2;
    /// Grace period between a successful login and resubscription, in seconds
    pub const RELOGIN_GRACE_SECS: u64 = 5;
    /// Silence window before the network-suspect flag is raised, in seconds
    pub const WARN_WINDOW_SECS: u64 = 30;

    /// Weighted-index worker count
    pub const INDEX_WORKERS: usize = 1;
    /// Weighted-index submission queue capacity
    pub const INDEX_QUEUE_SIZE: usize = 256;
    /// Minutes of per-contract bar history retained for index synthesis
    pub const INDEX_LOOKBACK_MINUTES: i64 = 15;

    /// Event-log flush interval in milliseconds (0 flushes every append)
    pub const LOG_FLUSH_INTERVAL_MS: u64 = 1_000;

    /// Storage retry attempts for transient errors
    pub const STORAGE_RETRIES: u32 = 5;
    /// First storage retry delay in milliseconds
    pub const STORAGE_RETRY_BASE_MS: u64 = 50;
    /// Storage retry delay ceiling in milliseconds
    pub const STORAGE_RETRY_MAX_MS: u64 = 2_000;
}
