//! QuoteHub service configuration

use crate::constants::defaults;
use crate::errors::ServiceError;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for the market-ingest service binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Tick ingestion and aggregation settings
    pub ingest: IngestConfig,
    /// Front reconnection settings
    pub reconnect: ReconnectConfig,
    /// Weighted-index calculator settings
    pub index: IndexConfig,
    /// Event-log settings
    pub event_log: EventLogConfig,
    /// Replay coordinator settings
    pub replay: ReplayConfig,
}

/// Tick ingestion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Instruments subscribed at startup
    pub instruments: Vec<String>,
    /// Fingerprint dedup window in milliseconds
    pub dedup_window_ms: u64,
    /// Clock-drift pause threshold in seconds
    pub drift_threshold_secs: u64,
    /// Consecutive in-threshold ticks required to clear a drift pause
    pub drift_resume_ticks: u32,
    /// Tick recency window for the market-open flag, in seconds
    pub staleness_window_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            instruments: Vec::new(),
            dedup_window_ms: defaults::DEDUP_WINDOW_MS,
            drift_threshold_secs: defaults::DRIFT_THRESHOLD_SECS,
            drift_resume_ticks: defaults::DRIFT_RESUME_TICKS,
            staleness_window_secs: defaults::STALENESS_WINDOW_SECS,
        }
    }
}

/// Front reconnection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether the supervisor reconnects at all
    pub enabled: bool,
    /// First backoff delay in milliseconds
    pub initial_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: u64,
    /// Uniform jitter applied around each delay, in [0, 1]
    pub jitter_ratio: f64,
    /// Grace period between login and resubscription, in seconds
    pub relogin_grace_secs: u64,
    /// Tick silence window before network-suspect is raised, in seconds
    pub warn_window_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff_ms: defaults::INITIAL_BACKOFF_MS,
            max_backoff_ms: defaults::MAX_BACKOFF_MS,
            jitter_ratio: defaults::JITTER_RATIO,
            relogin_grace_secs: defaults::RELOGIN_GRACE_SECS,
            warn_window_secs: defaults::WARN_WINDOW_SECS,
        }
    }
}

/// Weighted-index calculator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Worker count
    pub workers: usize,
    /// Submission queue capacity
    pub queue_size: usize,
    /// Minutes of per-contract history retained
    pub lookback_minutes: i64,
    /// Expected instrument set per variety, registered at startup
    pub varieties: FxHashMap<String, Vec<String>>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            workers: defaults::INDEX_WORKERS,
            queue_size: defaults::INDEX_QUEUE_SIZE,
            lookback_minutes: defaults::INDEX_LOOKBACK_MINUTES,
            varieties: FxHashMap::default(),
        }
    }
}

/// Event-log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    /// Directory holding day segments
    pub dir: PathBuf,
    /// Flush interval in milliseconds; 0 flushes every append
    pub flush_interval_ms: u64,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/events"),
            flush_interval_ms: defaults::LOG_FLUSH_INTERVAL_MS,
        }
    }
}

/// Replay coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Whether order-command events may be re-dispatched (marked) on replay
    pub allow_order_dispatch: bool,
    /// Consumer delivery-marker file
    pub dedup_path: PathBuf,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            allow_order_dispatch: false,
            dedup_path: PathBuf::from("./data/consume-markers.log"),
        }
    }
}

impl HubConfig {
    /// Validate startup configuration. Failures here are the only fatal
    /// errors in the system.
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.ingest.dedup_window_ms == 0 {
            return Err(ServiceError::Config("ingest.dedup_window_ms must be > 0".into()));
        }
        if self.ingest.drift_resume_ticks == 0 {
            return Err(ServiceError::Config("ingest.drift_resume_ticks must be > 0".into()));
        }
        if self.reconnect.max_backoff_ms < self.reconnect.initial_backoff_ms {
            return Err(ServiceError::Config(
                "reconnect.max_backoff_ms must be >= initial_backoff_ms".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_ratio) {
            return Err(ServiceError::Config("reconnect.jitter_ratio must be in [0, 1]".into()));
        }
        if self.index.workers == 0 {
            return Err(ServiceError::Config("index.workers must be >= 1".into()));
        }
        if self.index.queue_size == 0 {
            return Err(ServiceError::Config("index.queue_size must be > 0".into()));
        }
        if self.index.lookback_minutes <= 0 {
            return Err(ServiceError::Config("index.lookback_minutes must be > 0".into()));
        }
        for (variety, instruments) in &self.index.varieties {
            if instruments.is_empty() {
                return Err(ServiceError::Config(format!(
                    "index.varieties.{variety} has no instruments"
                )));
            }
        }
        Ok(())
    }
}
