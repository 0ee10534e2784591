//! Front reconnection supervisor
//!
//! Connected -> Disconnected -> Reconnecting -> Connected, looping on
//! failure. Backoff is bounded exponential with uniform jitter; attempts
//! continue indefinitely until login and resubscription both succeed. The
//! backoff and relogin-grace sleeps are deliberately not interruptible; a
//! reconnect loop runs to completion once entered.

use crate::source::TickSource;
use crate::status::RuntimeStatusProjector;
use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use services_common::ReconnectConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Pure backoff ladder: min(initial * 2^(attempt-1), max) with uniform
/// jitter of +/- `jitter_ratio` around the result.
#[must_use]
pub fn backoff_delay(cfg: &ReconnectConfig, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let exp_ms = cfg
        .initial_backoff_ms
        .saturating_mul(1u64 << shift)
        .min(cfg.max_backoff_ms);
    if cfg.jitter_ratio <= 0.0 {
        return Duration::from_millis(exp_ms);
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-cfg.jitter_ratio..=cfg.jitter_ratio);
    Duration::from_millis((exp_ms as f64 * factor).max(0.0) as u64)
}

/// Handle through which the session reports disconnects
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl SupervisorHandle {
    /// Queue a disconnect notification
    pub fn notify_disconnect(&self, reason: &str) {
        if self.tx.send(reason.to_string()).is_err() {
            warn!("supervisor stopped, disconnect not handled");
        }
    }
}

/// Keeps the tick source's connection alive
pub struct ReconnectSupervisor {
    cfg: ReconnectConfig,
    source: Arc<dyn TickSource>,
    status: Arc<RuntimeStatusProjector>,
    instruments: Vec<String>,
    reconnecting: AtomicBool,
}

impl ReconnectSupervisor {
    /// Supervisor over `source`, resubscribing `instruments` after relogin
    #[must_use]
    pub fn new(
        cfg: ReconnectConfig,
        source: Arc<dyn TickSource>,
        status: Arc<RuntimeStatusProjector>,
        instruments: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            source,
            status,
            instruments,
            reconnecting: AtomicBool::new(false),
        })
    }

    /// Spawn the notification pump; returns the handle the session reports
    /// disconnects through.
    #[must_use]
    pub fn start(self: &Arc<Self>) -> (SupervisorHandle, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let supervisor = Arc::clone(self);
        let pump = tokio::spawn(async move {
            while let Some(reason) = rx.recv().await {
                supervisor.on_disconnect(&reason).await;
            }
        });
        (SupervisorHandle { tx }, pump)
    }

    /// Disconnect entry point: mark status down, then run the reconnect
    /// loop unless disabled or one is already in flight.
    pub async fn on_disconnect(&self, reason: &str) {
        warn!(reason = %reason, "handling front disconnect");
        self.status.update(|s| {
            s.connected = false;
            s.logged_in = false;
            s.subscribed = false;
        });
        if !self.cfg.enabled {
            info!("reconnection disabled, staying down");
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("reconnect loop already running");
            return;
        }
        self.reconnect_loop().await;
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    async fn reconnect_loop(&self) {
        let mut attempt: u32 = 1;
        loop {
            let delay = backoff_delay(&self.cfg, attempt);
            self.status.update(|s| {
                s.reconnect_attempts = attempt;
                s.next_retry_at =
                    Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            });
            info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect backoff");
            tokio::time::sleep(delay).await;

            match self.try_recover().await {
                Ok(()) => {
                    self.status.update(|s| {
                        s.connected = true;
                        s.logged_in = true;
                        s.subscribed = true;
                        s.reconnect_attempts = 0;
                        s.next_retry_at = None;
                    });
                    info!(attempt, "reconnect complete, subscriptions restored");
                    return;
                }
                Err(e) => {
                    warn!(attempt, "reconnect attempt failed: {e:#}");
                    attempt += 1;
                }
            }
        }
    }

    async fn try_recover(&self) -> Result<()> {
        self.source.connect().await?;
        self.source.login().await?;
        // Fronts reject subscriptions fired straight after login; give the
        // session time to settle before resubscribing.
        tokio::time::sleep(Duration::from_secs(self.cfg.relogin_grace_secs)).await;
        self.source.subscribe(&self.instruments).await?;
        Ok(())
    }

    /// Advisory tick-silence monitor: once per second, flag network-suspect
    /// when connected and logged in but no tick arrived within the warn
    /// window. Logs once per transition and never triggers reconnection.
    #[must_use]
    pub fn spawn_monitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let warn_window = Duration::from_secs(supervisor.cfg.warn_window_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let snapshot = supervisor.status.read();
                let silent = snapshot.connected
                    && snapshot.logged_in
                    && snapshot.last_tick_time.is_some_and(|last| {
                        Utc::now()
                            .signed_duration_since(last)
                            .to_std()
                            .is_ok_and(|age| age > warn_window)
                    });
                if silent != snapshot.network_suspect {
                    if silent {
                        warn!("no tick within warn window, network suspect");
                    } else {
                        info!("tick flow restored");
                    }
                    supervisor.status.update(|s| s.network_suspect = silent);
                }
            }
        })
    }
}
