//! Market Ingest Service
//!
//! Owns the live path from raw futures ticks to persisted minute bars:
//! - tick source boundary and the ingestion/aggregation session
//! - reconnect supervisor with bounded-exponential backoff
//! - runtime status projection with bounded fan-out
//! - trading-day time mapping for night-session attribution

pub mod session;
pub mod sim;
pub mod source;
pub mod status;
pub mod supervisor;
pub mod timemap;

pub use session::{TickIngestSession, WallClock};
pub use source::{SourceEvent, TickSource, source_channel};
pub use status::{RuntimeSnapshot, RuntimeStatusProjector, SubscriptionHandle};
pub use supervisor::{ReconnectSupervisor, SupervisorHandle, backoff_delay};
