//! Transport Settings Module
//!
//! Loads the read-only configuration surface of the transport core from an
//! optional TOML file with `REMOTE_` environment overrides, e.g.
//! `REMOTE_MEDIUM__IDLE_CPU_LEVEL=10` or `REMOTE_STREAMS__INBOUND_LANES=1`.

use crate::defaults;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "REMOTE";

/// Separator between nested keys in environment overrides
pub const ENV_SEPARATOR: &str = "__";

/// Complete transport configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct TransportSettings {
    /// Node identity and bind address
    pub transport: NodeSettings,

    /// Messaging medium
    pub medium: MediumSettings,

    /// Inbound and outbound streams
    pub streams: StreamSettings,

    /// Periodic diagnostic drain
    pub diagnostics: DiagnosticSettings,

    /// Dedicated polling thread
    pub agent: AgentSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct NodeSettings {
    pub system_name: String,
    pub bind_host: String,
    pub bind_port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct MediumSettings {
    /// Launch the medium inside this process instead of connecting to an external one
    pub embedded: bool,
    /// Explicit medium directory; a unique one is generated when absent
    pub directory: Option<PathBuf>,
    pub delete_directory_on_shutdown: bool,
    pub client_liveness_timeout_ms: u64,
    pub image_liveness_timeout_ms: u64,
    pub driver_timeout_ms: u64,
    /// 1..=10, trades CPU usage for latency
    pub idle_cpu_level: u8,
    /// Periodically log the medium's counters
    pub log_counters: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct StreamSettings {
    pub inbound_lanes: usize,
    pub lane_buffer_size: usize,
    pub give_up_message_after_ms: u64,
    pub give_up_system_message_after_ms: u64,
    /// Enable the dedicated large-message stream
    pub large_messages: bool,
    pub outbound_queue_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DiagnosticSettings {
    pub initial_delay_ms: u64,
    pub interval_ms: u64,
    /// Relative paths resolve against the medium directory
    pub log_file: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct AgentSettings {
    pub stop_timeout_ms: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            system_name: defaults::transport::SYSTEM_NAME.to_string(),
            bind_host: defaults::transport::BIND_HOST.to_string(),
            bind_port: defaults::transport::BIND_PORT,
        }
    }
}

impl Default for MediumSettings {
    fn default() -> Self {
        Self {
            embedded: defaults::medium::EMBEDDED,
            directory: None,
            delete_directory_on_shutdown: defaults::medium::DELETE_DIRECTORY_ON_SHUTDOWN,
            client_liveness_timeout_ms: defaults::medium::CLIENT_LIVENESS_TIMEOUT_MS,
            image_liveness_timeout_ms: defaults::medium::IMAGE_LIVENESS_TIMEOUT_MS,
            driver_timeout_ms: defaults::medium::DRIVER_TIMEOUT_MS,
            idle_cpu_level: defaults::medium::IDLE_CPU_LEVEL,
            log_counters: false,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            inbound_lanes: defaults::streams::INBOUND_LANES,
            lane_buffer_size: defaults::streams::LANE_BUFFER_SIZE,
            give_up_message_after_ms: defaults::streams::GIVE_UP_MESSAGE_AFTER_MS,
            give_up_system_message_after_ms: defaults::streams::GIVE_UP_SYSTEM_MESSAGE_AFTER_MS,
            large_messages: false,
            outbound_queue_size: defaults::streams::OUTBOUND_QUEUE_SIZE,
        }
    }
}

impl Default for DiagnosticSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: defaults::diagnostics::INITIAL_DELAY_MS,
            interval_ms: defaults::diagnostics::INTERVAL_MS,
            log_file: PathBuf::from(defaults::diagnostics::LOG_FILE),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            stop_timeout_ms: defaults::agent::STOP_TIMEOUT_MS,
        }
    }
}

impl MediumSettings {
    pub fn client_liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.client_liveness_timeout_ms)
    }

    pub fn image_liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.image_liveness_timeout_ms)
    }

    pub fn driver_timeout(&self) -> Duration {
        Duration::from_millis(self.driver_timeout_ms)
    }
}

impl StreamSettings {
    pub fn give_up_message_after(&self) -> Duration {
        Duration::from_millis(self.give_up_message_after_ms)
    }

    pub fn give_up_system_message_after(&self) -> Duration {
        Duration::from_millis(self.give_up_system_message_after_ms)
    }
}

impl DiagnosticSettings {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl AgentSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl TransportSettings {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load configuration, reading overrides from `env` instead of the process
    /// environment when given
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading transport config: {:?}", path);
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator(ENV_SEPARATOR)
                .try_parsing(true)
                .source(env),
        );

        let config = builder.build().context("Failed to build transport configuration")?;

        let mut settings: Self = config
            .try_deserialize()
            .context("Failed to deserialize transport configuration")?;

        settings.expand_paths()?;
        settings.validate()?;

        debug!(?settings, "Transport configuration loaded");
        Ok(settings)
    }

    /// Parse configuration from a TOML string without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut settings: Self =
            toml::from_str(content).context("Failed to parse transport configuration")?;
        settings.expand_paths()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Render the effective configuration, used for startup diagnostics
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render transport configuration")
    }

    /// Expand `~` and environment variables in path values
    pub fn expand_paths(&mut self) -> Result<()> {
        if let Some(dir) = &self.medium.directory {
            let raw = dir.to_string_lossy();
            let expanded = shellexpand::full(&raw)
                .with_context(|| format!("Failed to expand medium directory {raw}"))?;
            self.medium.directory = Some(PathBuf::from(expanded.as_ref()));
        }
        Ok(())
    }

    /// Reject values the transport cannot run with
    pub fn validate(&self) -> Result<()> {
        if !defaults::medium::IDLE_CPU_LEVEL_RANGE.contains(&self.medium.idle_cpu_level) {
            bail!(
                "medium.idle_cpu_level must be within 1..=10, got {}",
                self.medium.idle_cpu_level
            );
        }
        if self.streams.inbound_lanes == 0 {
            bail!("streams.inbound_lanes must be at least 1");
        }
        if self.streams.lane_buffer_size == 0 || self.streams.outbound_queue_size == 0 {
            bail!("streams buffer sizes must be non-zero");
        }
        if self.streams.give_up_message_after_ms == 0
            || self.streams.give_up_system_message_after_ms == 0
        {
            bail!("streams give-up durations must be non-zero");
        }
        if self.diagnostics.interval_ms == 0 {
            bail!("diagnostics.interval_ms must be non-zero");
        }
        Ok(())
    }
}
