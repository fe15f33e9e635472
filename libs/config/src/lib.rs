//! # Remote Transport Configuration
//!
//! Read-only configuration surface consumed by the transport core: medium
//! bootstrap, liveness timeouts, idle CPU level, inbound lanes, give-up
//! durations and diagnostics cadence.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use transport_config::TransportSettings;
//!
//! let settings = TransportSettings::load(Some(std::path::Path::new("config/transport.toml")))?;
//! assert!(settings.streams.inbound_lanes >= 1);
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod defaults;
pub mod settings;

// Re-export commonly used types
pub use settings::{
    AgentSettings, DiagnosticSettings, MediumSettings, NodeSettings, StreamSettings,
    TransportSettings,
};
