//! Bar persistence boundary
//!
//! Persistence-engine internals live outside this repository; every producer
//! (live ingestion, weighted index, backfill) talks to the same `BarStore`
//! trait. Transient storage errors are retried here, at the boundary, so
//! aggregation and replay logic never carry retry loops of their own.

use crate::constants::defaults;
use crate::errors::ServiceError;
use crate::types::MinuteBar;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Idempotent minute-bar persistence.
///
/// Implementations must tolerate concurrent upserts of the same key from
/// multiple producers; a conflicting key overwrites every non-key field.
#[async_trait]
pub trait BarStore: Send + Sync {
    /// Insert or overwrite the bar identified by
    /// (time, `instrument_id`, exchange, period)
    async fn upsert_bar(&self, bar: &MinuteBar) -> Result<(), ServiceError>;
}

/// Key uniquely identifying a persisted bar
pub type BarKey = (chrono::NaiveDateTime, String, String, String);

/// In-memory store used by tests and the standalone service binary.
#[derive(Debug, Default)]
pub struct MemoryBarStore {
    bars: Mutex<FxHashMap<BarKey, MinuteBar>>,
}

impl MemoryBarStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a bar by key
    #[must_use]
    pub fn get(&self, time: chrono::NaiveDateTime, instrument_id: &str) -> Option<MinuteBar> {
        self.bars
            .lock()
            .iter()
            .find(|((t, i, _, _), _)| *t == time && i == instrument_id)
            .map(|(_, bar)| bar.clone())
    }

    /// Number of distinct bar keys stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.lock().len()
    }

    /// Whether the store holds no bars
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.lock().is_empty()
    }

    /// All stored bars in unspecified order
    #[must_use]
    pub fn all(&self) -> Vec<MinuteBar> {
        self.bars.lock().values().cloned().collect()
    }
}

#[async_trait]
impl BarStore for MemoryBarStore {
    async fn upsert_bar(&self, bar: &MinuteBar) -> Result<(), ServiceError> {
        let key = (
            bar.time,
            bar.instrument_id.clone(),
            bar.exchange.clone(),
            bar.period.clone(),
        );
        self.bars.lock().insert(key, bar.clone());
        Ok(())
    }
}

/// Retry policy for the persistence boundary
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before the error surfaces to the caller
    pub max_retries: u32,
    /// First retry delay
    pub base_delay: Duration,
    /// Retry delay ceiling
    pub max_delay: Duration,
    /// Uniform jitter around each delay, in [0, 1]
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::STORAGE_RETRIES,
            base_delay: Duration::from_millis(defaults::STORAGE_RETRY_BASE_MS),
            max_delay: Duration::from_millis(defaults::STORAGE_RETRY_MAX_MS),
            jitter_ratio: defaults::JITTER_RATIO,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based): bounded exponential + jitter
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let exp_ms = base_ms
            .saturating_mul(1u64 << shift)
            .min(u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX));
        if self.jitter_ratio <= 0.0 {
            return Duration::from_millis(exp_ms);
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter_ratio..=self.jitter_ratio);
        Duration::from_millis((exp_ms as f64 * factor).max(0.0) as u64)
    }
}

/// Wraps a [`BarStore`] with bounded exponential-backoff retries for
/// transient errors. Permanent errors pass through untouched.
pub struct RetryingBarStore {
    inner: Arc<dyn BarStore>,
    policy: RetryPolicy,
}

impl RetryingBarStore {
    /// Wrap `inner` with the default policy
    #[must_use]
    pub fn new(inner: Arc<dyn BarStore>) -> Self {
        Self::with_policy(inner, RetryPolicy::default())
    }

    /// Wrap `inner` with an explicit policy
    #[must_use]
    pub fn with_policy(inner: Arc<dyn BarStore>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl BarStore for RetryingBarStore {
    async fn upsert_bar(&self, bar: &MinuteBar) -> Result<(), ServiceError> {
        let mut attempt = 0u32;
        loop {
            match self.inner.upsert_bar(bar).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.policy.max_retries => {
                    attempt += 1;
                    let delay = self.policy.delay(attempt);
                    debug!(
                        instrument = %bar.instrument_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient upsert failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(instrument = %bar.instrument_id, "upsert retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}
