//! Messaging medium boundary
//!
//! The UDP pub/sub medium is an external collaborator. The transport drives it
//! only through the traits in this module: connecting a client, adding
//! subscriptions and publications on `udp://host:port` channels, reading its
//! diagnostic log, and receiving its availability and error callbacks through
//! a [`MediumEventHandler`].

use crate::diagnostics::DiagnosticLogReader;
use crate::error::{MediumError, Result, TransportError};
use crate::idle::{IdleStrategy, ThreadingMode};
use bytes::Bytes;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Scheme of every channel string handed to the medium
pub const CHANNEL_SCHEME: &str = "udp";

/// Channel endpoint, rendered as `udp://host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Channel string understood by the medium
    pub fn channel(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", CHANNEL_SCHEME, self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(CHANNEL_SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| {
                TransportError::configuration(format!("channel '{s}' must start with udp://"), Some("endpoint"))
            })?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(|| {
            TransportError::configuration(format!("channel '{s}' is missing a port"), Some("endpoint"))
        })?;
        if host.is_empty() {
            return Err(TransportError::configuration(
                format!("channel '{s}' is missing a host"),
                Some("endpoint"),
            ));
        }
        let port = port.parse::<u16>().map_err(|e| {
            TransportError::configuration(format!("invalid port in channel '{s}': {e}"), Some("endpoint"))
        })?;
        Ok(Self::new(host, port))
    }
}

/// A remote publisher's session as seen by a local subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub session_id: i32,
    pub stream_id: i32,
    pub source_identity: String,
}

/// Callbacks the medium invokes on its own threads
pub trait MediumEventHandler: Send + Sync {
    fn on_session_available(&self, image: &Image);

    fn on_session_unavailable(&self, image: &Image);

    /// Returns `TransportError::Terminated` once the transport escalated a
    /// fatal error
    fn on_error(&self, error: MediumError) -> Result<()>;
}

/// Parameters for opening a client connection
#[derive(Clone)]
pub struct MediumContext {
    pub directory: PathBuf,
    pub driver_timeout: Duration,
    pub handler: Arc<dyn MediumEventHandler>,
}

impl fmt::Debug for MediumContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediumContext")
            .field("directory", &self.directory)
            .field("driver_timeout", &self.driver_timeout)
            .finish_non_exhaustive()
    }
}

/// Client side of the medium
pub trait Medium: Send + Sync {
    fn connect(&self, ctx: MediumContext) -> Result<Box<dyn MediumConnection>>;

    /// Open the medium's diagnostic log at `path`
    fn open_diagnostics(&self, path: &Path) -> Result<Box<dyn DiagnosticLogReader>>;
}

/// Named medium counter, logged when counter logging is enabled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumCounter {
    pub label: String,
    pub value: i64,
}

/// Open client connection
pub trait MediumConnection: Send + Sync {
    fn add_subscription(&self, channel: &Endpoint, stream_id: i32) -> Result<Box<dyn Subscription>>;

    fn add_publication(&self, channel: &Endpoint, stream_id: i32) -> Result<Arc<dyn Publication>>;

    fn counters(&self) -> Vec<MediumCounter>;

    fn close(&self) -> Result<()>;
}

/// Fragment flag bits
pub mod flags {
    pub const BEGIN: u8 = 0x80;
    pub const END: u8 = 0x40;
    pub const UNFRAGMENTED: u8 = BEGIN | END;
}

/// One received datagram fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub session_id: i32,
    pub flags: u8,
    pub payload: Bytes,
}

impl Fragment {
    pub fn unfragmented(session_id: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            session_id,
            flags: flags::UNFRAGMENTED,
            payload: payload.into(),
        }
    }

    pub fn is_begin(&self) -> bool {
        self.flags & flags::BEGIN != 0
    }

    pub fn is_end(&self) -> bool {
        self.flags & flags::END != 0
    }
}

/// Inbound channel, polled from the agent runner thread
pub trait Subscription: Send {
    /// Deliver up to `limit` fragments to `handler`, returning how many were delivered
    fn poll(&mut self, handler: &mut dyn FnMut(Fragment), limit: usize) -> usize;

    fn is_closed(&self) -> bool;

    fn close(&mut self);
}

/// Result of a non-blocking publication offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Accepted,
    /// Flow control window exhausted, retry later
    BackPressured,
    /// No subscriber connected yet, retry later
    NotConnected,
    /// Medium busy with an administrative action, retry
    AdminAction,
    /// Publication closed, retrying is pointless
    Closed,
}

/// Outbound channel
pub trait Publication: Send + Sync {
    fn offer(&self, buffer: &[u8]) -> OfferOutcome;

    fn close(&self);
}

/// Parameters for launching an embedded medium
#[derive(Debug, Clone)]
pub struct EmbeddedMediumContext {
    pub directory: PathBuf,
    pub client_liveness_timeout: Duration,
    pub image_liveness_timeout: Duration,
    pub driver_timeout: Duration,
    pub threading_mode: ThreadingMode,
    pub idle_strategy: IdleStrategy,
}

/// Launches the medium inside this process
pub trait EmbeddedMediumLauncher: Send + Sync {
    fn launch(&self, ctx: EmbeddedMediumContext) -> Result<Box<dyn EmbeddedMedium>>;
}

/// Running embedded medium, closed exactly once by the lifecycle
pub trait EmbeddedMedium: Send {
    fn directory(&self) -> &Path;

    fn close(&mut self) -> Result<()>;
}
