//! Custom error types for the acquisition harness.
//!
//! `DaqError` is the single error type returned by the library. It is built with
//! `thiserror` and groups failures into the categories the session cares about:
//!
//! - **Build errors** (`Configuration`, `Config`, `DegenerateSegment`, `OutOfRange`):
//!   detected while loading configuration or constructing the protocol. They are
//!   fatal before any hardware is touched.
//! - **Transport errors** (`Transport`): a device was unreachable or rejected a
//!   command. Retryable up to a bound, then fatal to that worker only.
//! - **Log errors** (`Io`, `Csv`, `Serialization`): a log or artifact write failed.
//!   Fatal to the worker that owns the file; the worker still disconnects.
//!
//! By using `#[from]`, `DaqError` is created from the underlying error types with `?`.

use crate::protocol::ChannelId;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Transport Errors
// =============================================================================

/// Coarse classification of a device transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Device could not be reached (bus down, resource busy, cable pulled).
    Unreachable,
    /// Device answered but refused the command.
    Rejected,
    /// No answer within the transport timeout.
    Timeout,
    /// Answer could not be parsed.
    Protocol,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TransportErrorKind::Unreachable => "unreachable",
            TransportErrorKind::Rejected => "rejected",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Protocol => "protocol",
        };
        write!(f, "{}", label)
    }
}

/// Failure reported by a device capability call.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Device '{device}' {kind} error: {message}")]
pub struct TransportError {
    /// Device identifier the failure came from.
    pub device: String,
    /// What went wrong.
    pub kind: TransportErrorKind,
    /// Driver supplied detail.
    pub message: String,
}

impl TransportError {
    /// Create a transport error for `device`.
    pub fn new(
        device: impl Into<String>,
        kind: TransportErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for the acquisition harness.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid or physically infeasible.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// A protocol segment would have zero length.
    #[error("Degenerate segment on channel {channel} at {offset:?}: start and end offsets coincide")]
    DegenerateSegment {
        /// Channel the segment belongs to.
        channel: ChannelId,
        /// Offset where start and end coincide.
        offset: Duration,
    },

    /// A requested flow or concentration cannot be delivered by the gas line.
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Device transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// File I/O failure (log or artifact).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV log write failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Protocol artifact (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl DaqError {
    /// True for failures raised while loading configuration or building the protocol.
    ///
    /// These abort a session before any worker starts.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            DaqError::Config(_)
                | DaqError::Configuration(_)
                | DaqError::DegenerateSegment { .. }
                | DaqError::OutOfRange(_)
        )
    }

    /// True for failures of the device transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, DaqError::Transport(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_display_names_device_and_kind() {
        let err = TransportError::new("mfc-7", TransportErrorKind::Timeout, "no reply");
        assert_eq!(err.to_string(), "Device 'mfc-7' timeout error: no reply");
    }

    #[test]
    fn classifies_build_errors() {
        assert!(DaqError::OutOfRange("too much".into()).is_build_error());
        assert!(DaqError::DegenerateSegment {
            channel: ChannelId(8),
            offset: Duration::from_secs(60),
        }
        .is_build_error());
        assert!(DaqError::Configuration("bad".into()).is_build_error());

        let io = DaqError::Io(std::io::Error::other("disk full"));
        assert!(!io.is_build_error());

        let transport: DaqError =
            TransportError::new("smu", TransportErrorKind::Unreachable, "gone").into();
        assert!(transport.is_transport());
        assert!(!transport.is_build_error());
    }
}
