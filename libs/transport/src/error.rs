//! Transport Error Types
//!
//! Error handling for medium failures, stream pipeline failures and the
//! transport lifecycle.

use std::time::Duration;
use thiserror::Error;

/// Errors reported by the messaging medium through its error channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediumError {
    /// The medium stopped hearing from this client within the liveness timeout
    #[error("client liveness timeout: {0}")]
    ClientLivenessTimeout(String),

    /// The client stopped hearing from the medium within the driver timeout
    #[error("driver timeout: {0}")]
    DriverTimeout(String),

    /// Marker raised after escalation already terminated the transport
    #[error("medium client terminated")]
    Terminated,

    /// Anything else, transient from the transport's point of view
    #[error("{0}")]
    Other(String),
}

/// How the lifecycle reacts to a [`MediumError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Loss of contact with the medium, terminate
    Fatal,
    /// Already handled by a previous escalation
    AlreadyTerminated,
    /// Log and continue
    Transient,
}

impl MediumError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            MediumError::ClientLivenessTimeout(_) | MediumError::DriverTimeout(_) => ErrorClass::Fatal,
            MediumError::Terminated => ErrorClass::AlreadyTerminated,
            MediumError::Other(_) => ErrorClass::Transient,
        }
    }
}

/// Main transport error type
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Error surfaced by the medium
    #[error("Medium error: {0}")]
    Medium(#[from] MediumError),

    /// Startup failed, nothing was left running
    #[error("Startup failed: {message}")]
    Startup { message: String },

    /// Start called on a component that already left its initial state
    #[error("{component} already started")]
    AlreadyStarted { component: String },

    /// Operation requires a running transport
    #[error("Transport not running: {operation}")]
    NotRunning { operation: String },

    /// Fatal medium error escalated, the owning runtime is terminating
    #[error("Transport terminated: {cause}")]
    Terminated { cause: MediumError },

    /// Outbound send could not make progress within the give-up duration
    #[error("Gave up sending on stream {stream_id} after {after:?}")]
    GaveUp { stream_id: i32, after: Duration },

    /// Bounded wait exceeded
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Pipeline torn down through an abort switch
    #[error("Stream aborted: {reason}")]
    StreamAborted { reason: String },

    /// Downstream or publication closed
    #[error("Stream closed: {message}")]
    StreamClosed { message: String },

    /// Inbound buffer could not be decoded into an envelope
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a startup error
    pub fn startup(message: impl Into<String>) -> Self {
        Self::Startup {
            message: message.into(),
        }
    }

    /// Create an already-started error
    pub fn already_started(component: impl Into<String>) -> Self {
        Self::AlreadyStarted {
            component: component.into(),
        }
    }

    /// Create a not-running error
    pub fn not_running(operation: impl Into<String>) -> Self {
        Self::NotRunning {
            operation: operation.into(),
        }
    }

    /// Create a terminated error
    pub fn terminated(cause: MediumError) -> Self {
        Self::Terminated { cause }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create an aborted-stream error
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::StreamAborted {
            reason: reason.into(),
        }
    }

    /// Create a closed-stream error
    pub fn closed(message: impl Into<String>) -> Self {
        Self::StreamClosed {
            message: message.into(),
        }
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create an I/O error from a source
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: format!("{}: {}", message.into(), source),
        }
    }

    /// Whether this error means the transport is already going down
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportError::Terminated { .. } | TransportError::Medium(MediumError::Terminated)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_medium_error_classification() {
        assert_eq!(
            MediumError::ClientLivenessTimeout("no heartbeat".into()).classify(),
            ErrorClass::Fatal
        );
        assert_eq!(
            MediumError::DriverTimeout("driver gone".into()).classify(),
            ErrorClass::Fatal
        );
        assert_eq!(MediumError::Terminated.classify(), ErrorClass::AlreadyTerminated);
        assert_eq!(
            MediumError::Other("channel endpoint error".into()).classify(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_terminal_errors() {
        assert!(TransportError::terminated(MediumError::DriverTimeout("x".into())).is_terminal());
        assert!(TransportError::from(MediumError::Terminated).is_terminal());
        assert!(!TransportError::aborted("lane 2 failed").is_terminal());
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::GaveUp {
            stream_id: 2,
            after: Duration::from_millis(250),
        };
        assert_eq!(err.to_string(), "Gave up sending on stream 2 after 250ms");

        let err = TransportError::timeout("agent runner stop", Duration::from_secs(5));
        assert_eq!(err.to_string(), "Timeout error: agent runner stop exceeded 5000ms");
    }
}
