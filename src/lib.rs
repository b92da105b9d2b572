//! Telemetry pipeline for GAIA air-quality stations.
//!
//! Polls a station's `/realtime/` endpoint, decodes whichever optional
//! sections its hardware model reports, discovers the channel set from the
//! first payload, and keeps rolling statistics per channel.
//!
//! ```no_run
//! # async fn demo() -> Result<(), gaia_station::ConnectionError> {
//! let session = gaia_station::connect("192.168.1.40").await?;
//! for channel in session.channels() {
//!     if let Some(stats) = session.snapshot().get(&channel.id) {
//!         println!("{}: {}", channel.name, stats.latest);
//!     }
//! }
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod station;
pub mod stats;
pub mod utils;

pub use config::StationConfig;
pub use error::{
    ConfigError, ConnectionError, CycleError, DecodeError, FieldDecodeWarning, TransportError,
};
pub use models::{
    Channel, ChannelId, ChannelKind, ChannelStats, ConnectionHealth, DeviceSnapshot, NumericType,
    RawReadingSet, Reading, StateClass, Visibility, WindowSummary,
};
pub use orchestrator::{
    connect, connect_with_config, CycleReport, PollOrchestrator, SessionHandle, StationState,
};
pub use registry::ChannelRegistry;
pub use station::{HttpTransport, Transport};
pub use stats::{RollingWindow, StatisticsEngine};
pub use utils::{Clock, ManualClock, SystemClock};
