//! Transport configuration defaults
//!
//! Default values used when a key is absent from the configuration file
//! and not overridden through the environment.

/// Node identity and bind address defaults
pub mod transport {
    /// Human-readable system name, also embedded in medium directory names
    pub const SYSTEM_NAME: &str = "remote";

    /// Bind host for the inbound channel
    pub const BIND_HOST: &str = "0.0.0.0";

    /// Bind port for the inbound channel
    pub const BIND_PORT: u16 = 25520;
}

/// Messaging medium defaults
pub mod medium {
    /// Launch an embedded medium inside this process
    pub const EMBEDDED: bool = true;

    /// Delete the embedded medium directory on shutdown
    pub const DELETE_DIRECTORY_ON_SHUTDOWN: bool = true;

    /// Client liveness timeout (milliseconds)
    pub const CLIENT_LIVENESS_TIMEOUT_MS: u64 = 20_000;

    /// Image liveness timeout (milliseconds)
    pub const IMAGE_LIVENESS_TIMEOUT_MS: u64 = 10_000;

    /// Driver timeout (milliseconds)
    pub const DRIVER_TIMEOUT_MS: u64 = 20_000;

    /// CPU usage level, 1 (lowest latency cost) to 10 (busy spin)
    pub const IDLE_CPU_LEVEL: u8 = 5;

    /// Valid range for `idle_cpu_level`
    pub const IDLE_CPU_LEVEL_RANGE: std::ops::RangeInclusive<u8> = 1..=10;
}

/// Stream defaults
pub mod streams {
    /// Parallel inbound lanes for the ordinary stream
    pub const INBOUND_LANES: usize = 4;

    /// Per-lane buffer between the fan-in and the lane consumer
    pub const LANE_BUFFER_SIZE: usize = 1024;

    /// Give up sending an ordinary or large message after (milliseconds)
    pub const GIVE_UP_MESSAGE_AFTER_MS: u64 = 60_000;

    /// Give up sending a control message after (milliseconds), six hours
    pub const GIVE_UP_SYSTEM_MESSAGE_AFTER_MS: u64 = 6 * 60 * 60 * 1000;

    /// Outbound queue capacity per association
    pub const OUTBOUND_QUEUE_SIZE: usize = 3072;
}

/// Periodic diagnostics defaults
pub mod diagnostics {
    /// Delay before the first diagnostic drain (milliseconds)
    pub const INITIAL_DELAY_MS: u64 = 3_000;

    /// Period between diagnostic drains (milliseconds)
    pub const INTERVAL_MS: u64 = 5_000;

    /// Diagnostic log file name, relative to the medium directory
    pub const LOG_FILE: &str = "diagnostics.log";
}

/// Agent runner defaults
pub mod agent {
    /// Upper bound on waiting for the agent thread to exit (milliseconds)
    pub const STOP_TIMEOUT_MS: u64 = 5_000;
}
