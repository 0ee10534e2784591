//! Market Ingest Service binary
//!
//! Wires the whole live pipeline together: one explicitly-constructed
//! EventLog injected into every collaborator, the weighted-index engine,
//! the status projector, the reconnect supervisor and the ingest session.
//! Only configuration validation failures are fatal.

use anyhow::{Context, Result};
use clap::Parser;
use index_engine::WeightedIndexCalculator;
use market_ingest::session::TickIngestSession;
use market_ingest::sim::SimTickSource;
use market_ingest::source::{TickSource, source_channel};
use market_ingest::status::RuntimeStatusProjector;
use market_ingest::supervisor::ReconnectSupervisor;
use services_common::{HubConfig, MemoryBarStore, RetryingBarStore};
use event_store::{EventLog, FileDedupStore, ReplayCoordinator, ReplayOrderPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "market-ingest";

#[derive(Parser)]
#[command(name = SERVICE_NAME, about = "QuoteHub tick ingestion service")]
struct Args {
    /// JSON configuration file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Simulated tick interval in milliseconds
    #[arg(long, default_value_t = 500)]
    sim_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Err(e) = config.validate() {
        // The one fatal error class in the system.
        error!("configuration rejected: {e}");
        std::process::exit(1);
    }
    if config.ingest.instruments.is_empty() {
        // Demo universe for the simulated front.
        config.ingest.instruments = vec!["rb2405".to_string(), "rb2410".to_string()];
        config
            .index
            .varieties
            .insert("rb".to_string(), config.ingest.instruments.clone());
    }
    info!("starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));

    // One event log, constructed here, injected everywhere.
    let log = Arc::new(EventLog::open(
        &config.event_log.dir,
        Duration::from_millis(config.event_log.flush_interval_ms),
    )?);
    let _flusher = log.start_flush_task();

    let bars = Arc::new(RetryingBarStore::new(Arc::new(MemoryBarStore::new())));
    let status = Arc::new(RuntimeStatusProjector::new(Duration::from_secs(
        config.ingest.staleness_window_secs,
    )));

    let (index_handle, _index_workers) =
        WeightedIndexCalculator::new(config.index.clone(), bars.clone(), log.clone()).start();

    // Replay control surface; driven by the external API layer.
    let replay_dedup = Arc::new(FileDedupStore::open(&config.replay.dedup_path)?);
    let order_policy = if config.replay.allow_order_dispatch {
        ReplayOrderPolicy::DispatchMarked
    } else {
        ReplayOrderPolicy::Drop
    };
    let _replay = ReplayCoordinator::with_order_policy(log.clone(), replay_dedup, order_policy);

    let (source_tx, source_rx) = source_channel();
    let source: Arc<SimTickSource> = Arc::new(SimTickSource::new(
        source_tx,
        "SHFE",
        Duration::from_millis(args.sim_interval_ms),
    ));

    let supervisor = ReconnectSupervisor::new(
        config.reconnect.clone(),
        source.clone() as Arc<dyn TickSource>,
        status.clone(),
        config.ingest.instruments.clone(),
    );
    let (supervisor_handle, _pump) = supervisor.start();
    let _monitor = supervisor.spawn_monitor();

    let session = Arc::new(
        TickIngestSession::new(
            config.ingest.clone(),
            Arc::new(services_common::WeekdayCalendar),
            bars.clone(),
            log.clone(),
            status.clone(),
        )
        .with_index(index_handle),
    );

    source.connect().await?;
    source.login().await?;
    source.subscribe(&config.ingest.instruments).await?;
    status.update(|s| s.subscribed = true);

    let session_task = tokio::spawn(session.clone().run(source_rx, Some(supervisor_handle)));

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown requested, flushing open bars");
    source.disconnect().await.ok();
    session.flush_open_bars().await?;
    log.flush()?;
    session_task.abort();

    info!("{} stopped", SERVICE_NAME);
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<HubConfig> {
    match path {
        None => Ok(HubConfig::default()),
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
        }
    }
}

/// Initialize tracing with environment filter
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", SERVICE_NAME.replace('-', "_")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();
}
