//! Simulated tick source
//!
//! Random-walk tick generator used by the standalone binary when no real
//! front is wired in; exercises the whole ingest pipeline end to end.

use crate::source::{SourceEvent, TickSource};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;
use parking_lot::Mutex;
use rand::Rng;
use services_common::Tick;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Simulated front pushing random-walk ticks for its instruments
pub struct SimTickSource {
    tx: mpsc::Sender<SourceEvent>,
    exchange: String,
    tick_interval: Duration,
    generator: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SimTickSource {
    /// Source pushing into `tx`, one tick per instrument per interval
    #[must_use]
    pub fn new(tx: mpsc::Sender<SourceEvent>, exchange: &str, tick_interval: Duration) -> Self {
        Self {
            tx,
            exchange: exchange.to_string(),
            tick_interval,
            generator: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TickSource for SimTickSource {
    async fn connect(&self) -> Result<()> {
        self.tx.send(SourceEvent::Connected).await?;
        Ok(())
    }

    async fn login(&self) -> Result<()> {
        self.tx.send(SourceEvent::LoggedIn).await?;
        Ok(())
    }

    async fn subscribe(&self, instruments: &[String]) -> Result<()> {
        let tx = self.tx.clone();
        let exchange = self.exchange.clone();
        let interval = self.tick_interval;
        let instruments = instruments.to_vec();
        info!(instruments = instruments.len(), "simulated subscription active");

        let task = tokio::spawn(async move {
            let mut prices: Vec<f64> = instruments.iter().map(|_| 3500.0).collect();
            let mut cumulative: Vec<i64> = instruments.iter().map(|_| 0).collect();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = Local::now().naive_local();
                for (i, instrument) in instruments.iter().enumerate() {
                    let (step, lot) = {
                        let mut rng = rand::thread_rng();
                        (rng.gen_range(-2.0..=2.0), rng.gen_range(1..=20))
                    };
                    prices[i] = (prices[i] + step).max(1.0);
                    cumulative[i] += lot;
                    let tick = Tick {
                        instrument_id: instrument.clone(),
                        exchange: exchange.clone(),
                        trading_day: now.date(),
                        action_day: now.date(),
                        update_time: now,
                        last_price: prices[i],
                        volume: cumulative[i],
                        open_interest: 10_000.0 + f64::from(i as u32) * 1_000.0,
                        settlement: 0.0,
                    };
                    if tx.send(SourceEvent::Tick(tick)).await.is_err() {
                        return;
                    }
                }
            }
        });
        if let Some(old) = self.generator.lock().replace(task) {
            old.abort();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(task) = self.generator.lock().take() {
            task.abort();
        }
        self.tx
            .send(SourceEvent::Disconnected {
                reason: "simulated disconnect".to_string(),
            })
            .await?;
        Ok(())
    }
}
