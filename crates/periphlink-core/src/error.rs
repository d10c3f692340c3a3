//! Error handling for Periphlink
//!
//! Provides error types for every layer of the communication engine:
//! - Transport errors (opening, timeouts, link faults)
//! - Frame errors (alignment, content validation, decoding)
//! - Protocol errors (responses that do not fit the command/response contract)
//! - Command errors (what a caller awaiting a response can observe)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Transport error type
///
/// Raised by the byte channel itself. Every I/O call is bounded, so a silent
/// peripheral surfaces as [`TransportError::Timeout`] rather than a stall.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A bounded I/O call did not complete in time
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// Hardware or link fault reported by the transport
    #[error("I/O error: {reason}")]
    Io {
        /// The reason reported by the transport.
        reason: String,
    },

    /// I/O attempted on a transport that is not open
    #[error("Transport is not open")]
    NotOpen,

    /// The device identifier could not be opened
    #[error("Failed to open {device}: {reason}")]
    OpenFailed {
        /// The device identifier.
        device: String,
        /// The reason the open failed.
        reason: String,
    },

    /// The profile asks for settings the transport cannot apply
    #[error("Invalid serial settings: {reason}")]
    InvalidSettings {
        /// The reason the settings were rejected.
        reason: String,
    },
}

impl TransportError {
    /// Build a timeout error from a duration
    pub fn timeout(timeout: std::time::Duration) -> Self {
        TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Build an I/O error from anything printable
    pub fn io(reason: impl std::fmt::Display) -> Self {
        TransportError::Io {
            reason: reason.to_string(),
        }
    }
}

/// Frame error type
///
/// Raised by the framed reader while turning raw bytes into records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Alignment could not be restored, or no delimiter was found at all
    #[error("Framing error: {reason}")]
    Framing {
        /// Description of the misalignment.
        reason: String,
    },

    /// A well-framed record failed content validation
    #[error("Improper record format: {record:?}")]
    Format {
        /// The offending record.
        record: String,
    },

    /// Bytes could not be decoded as UTF-8
    #[error("Non UTF-8 data received, probably wrong device or baud rate: {reason}")]
    Decode {
        /// Decoder diagnostics.
        reason: String,
    },
}

/// Protocol error type
///
/// Anomalies in the command/response conversation. These are logged and
/// surfaced as events; they do not close the connection by themselves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A block ended while no command was waiting for it
    #[error("Response block with no pending command ({} lines)", lines.len())]
    OrphanResponse {
        /// The lines of the discarded block.
        lines: Vec<String>,
    },

    /// A line matched none of the known response shapes
    #[error("Unrecognized response line: {line:?}")]
    UnrecognizedLine {
        /// The offending line.
        line: String,
    },
}

/// Command error type
///
/// What a caller awaiting a response block can observe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The connection closed while the command was outstanding
    #[error("Command cancelled: {command}")]
    Cancelled {
        /// The command that will never be answered.
        command: String,
    },

    /// No live session to send the command on
    #[error("Not connected")]
    NotConnected,

    /// Too many commands are waiting for responses
    #[error("Command queue is full ({capacity} pending)")]
    QueueFull {
        /// The configured queue capacity.
        capacity: usize,
    },

    /// Writing the command failed; the link is being torn down
    #[error("Failed to send command: {reason}")]
    Link {
        /// The transport failure.
        reason: String,
    },
}

/// Main error type for Periphlink
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport error
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Frame error
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Protocol error
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Command error
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Connect called on a manager that already has a live session
    #[error("Already connected to {device}")]
    AlreadyConnected {
        /// The device of the live session.
        device: String,
    },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Transport(TransportError::Timeout { .. }))
    }

    /// Check if this error means the current link can no longer be trusted
    ///
    /// Link failures close the session and, when enabled, start reconnecting.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Error::Transport(_)
                | Error::Frame(_)
                | Error::Io(_)
                | Error::Command(CommandError::Link { .. })
        )
    }

    /// Check if this error is an expected negative outcome while probing a port
    pub fn is_probe_negative(&self) -> bool {
        matches!(
            self,
            Error::Transport(TransportError::Timeout { .. })
                | Error::Transport(TransportError::Io { .. })
                | Error::Frame(_)
        )
    }

    /// Check if this is a protocol anomaly
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;
