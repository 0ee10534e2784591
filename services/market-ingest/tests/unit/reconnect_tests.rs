//! Reconnect supervisor tests: backoff discipline, recovery, re-entry guard

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use market_ingest::source::TickSource;
use market_ingest::status::RuntimeStatusProjector;
use market_ingest::supervisor::ReconnectSupervisor;
use parking_lot::Mutex;
use services_common::ReconnectConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Source whose first `fail_logins` login attempts fail
struct ScriptedSource {
    fail_logins: AtomicU32,
    connects: AtomicU32,
    logins: AtomicU32,
    login_delay: Duration,
    subscriptions: Mutex<Vec<Vec<String>>>,
}

impl ScriptedSource {
    fn new(fail_logins: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_logins: AtomicU32::new(fail_logins),
            connects: AtomicU32::new(0),
            logins: AtomicU32::new(0),
            login_delay: Duration::ZERO,
            subscriptions: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TickSource for ScriptedSource {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn login(&self) -> Result<()> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if !self.login_delay.is_zero() {
            tokio::time::sleep(self.login_delay).await;
        }
        let failing = self
            .fail_logins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("front rejected login")
        }
        Ok(())
    }

    async fn subscribe(&self, instruments: &[String]) -> Result<()> {
        self.subscriptions.lock().push(instruments.to_vec());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

fn fast_cfg() -> ReconnectConfig {
    ReconnectConfig {
        enabled: true,
        initial_backoff_ms: 5,
        max_backoff_ms: 40,
        jitter_ratio: 0.0,
        relogin_grace_secs: 0,
        warn_window_secs: 1,
    }
}

#[tokio::test]
async fn reconnects_after_failed_logins_and_resubscribes() -> Result<()> {
    let source = ScriptedSource::new(2);
    let status = Arc::new(RuntimeStatusProjector::new(Duration::from_secs(60)));
    let instruments = vec!["rb2405".to_string(), "rb2410".to_string()];
    let supervisor = ReconnectSupervisor::new(
        fast_cfg(),
        source.clone(),
        status.clone(),
        instruments.clone(),
    );

    supervisor.on_disconnect("transport reset").await;

    assert_eq!(source.logins.load(Ordering::SeqCst), 3);
    assert_eq!(source.subscriptions.lock().as_slice(), &[instruments]);

    let snapshot = status.read();
    assert!(snapshot.connected);
    assert!(snapshot.logged_in);
    assert!(snapshot.subscribed);
    assert_eq!(snapshot.reconnect_attempts, 0);
    assert!(snapshot.next_retry_at.is_none());
    Ok(())
}

#[tokio::test]
async fn disabled_reconnect_stays_down() -> Result<()> {
    let source = ScriptedSource::new(0);
    let status = Arc::new(RuntimeStatusProjector::new(Duration::from_secs(60)));
    let cfg = ReconnectConfig {
        enabled: false,
        ..fast_cfg()
    };
    let supervisor = ReconnectSupervisor::new(cfg, source.clone(), status.clone(), Vec::new());

    supervisor.on_disconnect("transport reset").await;

    assert_eq!(source.connects.load(Ordering::SeqCst), 0);
    let snapshot = status.read();
    assert!(!snapshot.connected);
    assert!(!snapshot.logged_in);
    Ok(())
}

#[tokio::test]
async fn concurrent_disconnects_run_one_reconnect_loop() -> Result<()> {
    let source = ScriptedSource::new(0);
    let status = Arc::new(RuntimeStatusProjector::new(Duration::from_secs(60)));
    let supervisor =
        ReconnectSupervisor::new(fast_cfg(), source.clone(), status.clone(), Vec::new());

    // Both notifications race; the re-entry guard admits exactly one loop.
    tokio::join!(
        supervisor.on_disconnect("first"),
        supervisor.on_disconnect("second"),
    );

    assert_eq!(source.logins.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn network_suspect_flags_on_tick_silence_and_clears() -> Result<()> {
    let source = ScriptedSource::new(0);
    let status = Arc::new(RuntimeStatusProjector::new(Duration::from_secs(60)));
    let supervisor =
        ReconnectSupervisor::new(fast_cfg(), source, status.clone(), Vec::new());

    status.update(|s| {
        s.connected = true;
        s.logged_in = true;
        s.last_tick_time = Some(Utc::now() - chrono::Duration::seconds(10));
    });
    let monitor = supervisor.spawn_monitor();

    // Warn window is 1s and the last tick is 10s old: suspect.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(status.read().network_suspect);

    // A fresh tick clears the flag on the next monitor pass.
    status.update(|s| s.last_tick_time = Some(Utc::now()));
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(!status.read().network_suspect);

    monitor.abort();
    Ok(())
}
