//! Tick source boundary
//!
//! The native market-data callback API lives behind this trait: the
//! ingestion and aggregation logic depends only on `TickSource` and the
//! `SourceEvent` stream, never on a concrete vendor gateway type.

use anyhow::Result;
use async_trait::async_trait;
use services_common::Tick;
use tokio::sync::mpsc;

/// Notification pushed by a tick source
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// Transport connection established
    Connected,
    /// Session authenticated
    LoggedIn,
    /// Connection lost; the supervisor takes over
    Disconnected {
        /// Vendor-reported reason
        reason: String,
    },
    /// One market-data update
    Tick(Tick),
}

/// Connection lifecycle of a market-data front.
///
/// Implementations push [`SourceEvent`]s into the channel handed to them at
/// construction; delivery is a single path per source, so per-instrument
/// tick processing stays sequential.
#[async_trait]
pub trait TickSource: Send + Sync {
    /// Establish the transport connection
    async fn connect(&self) -> Result<()>;

    /// Authenticate the session
    async fn login(&self) -> Result<()>;

    /// Subscribe market data for `instruments`
    async fn subscribe(&self, instruments: &[String]) -> Result<()>;

    /// Tear the connection down
    async fn disconnect(&self) -> Result<()>;
}

/// Channel capacity between a source and the ingest session
pub const SOURCE_CHANNEL_CAPACITY: usize = 4096;

/// Build the source-to-session channel
#[must_use]
pub fn source_channel() -> (mpsc::Sender<SourceEvent>, mpsc::Receiver<SourceEvent>) {
    mpsc::channel(SOURCE_CHANNEL_CAPACITY)
}
