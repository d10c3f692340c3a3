//! Data models for connections, frames and device readings
//!
//! This module provides:
//! - Connection state machine values
//! - Last-known position of a motion controller
//! - Validated frames and the response blocks assembled from them
//! - Numeric readings decoded from load-cell records

pub mod profile;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// State of a managed connection
///
/// Owned by the connection manager; only its methods move it from one value
/// to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    /// No session, and none being attempted
    #[default]
    Disconnected,
    /// Opening the transport and running the handshake
    Connecting,
    /// Handshake succeeded and the read loop is running
    Connected,
    /// The link failed and a delayed retry is scheduled
    Reconnecting,
}

impl ConnectionState {
    /// Check if a transition from this state to `target` is valid.
    ///
    /// Returns `true` for valid transitions:
    /// - Disconnected → Connecting
    /// - Connecting → Connected, Reconnecting, Disconnected
    /// - Connected → Reconnecting, Disconnected
    /// - Reconnecting → Connecting, Disconnected
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        use ConnectionState::*;
        if *self == target {
            return true;
        }
        matches!(
            (self, target),
            (Disconnected, Connecting)
                | (Connecting, Connected | Reconnecting | Disconnected)
                | (Connected, Reconnecting | Disconnected)
                | (Reconnecting, Connecting | Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

/// Identifier of one connection session, used to correlate log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new unique session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Last known X/Y/Z coordinates of a motion controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    /// X-axis position
    pub x: f64,
    /// Y-axis position
    pub y: f64,
    /// Z-axis position
    pub z: f64,
}

impl Position {
    /// Create a new position with X, Y, Z coordinates
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X:{:.2} Y:{:.2} Z:{:.2}", self.x, self.y, self.z)
    }
}

/// A validated, correctly delimited unit of device output
///
/// The text always ends with the delimiter it was framed on; fixed-length
/// frames additionally have exactly the expected length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    text: String,
    delimiter_len: usize,
}

impl Frame {
    /// Wrap framed text; `delimiter` must be the suffix the text was framed on
    pub fn new(text: String, delimiter: &str) -> Self {
        debug_assert!(text.ends_with(delimiter), "frame {text:?} lacks delimiter");
        Self {
            text,
            delimiter_len: delimiter.len(),
        }
    }

    /// Full text including the delimiter
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Text without the delimiter or any stray carriage return
    pub fn content(&self) -> &str {
        let end = self.text.len().saturating_sub(self.delimiter_len);
        self.text.get(..end).unwrap_or_default().trim_end_matches('\r')
    }

    /// Length in bytes including the delimiter
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// True for a bare delimiter
    pub fn is_empty(&self) -> bool {
        self.content().is_empty()
    }

    /// Consume the frame, returning the full text
    pub fn into_string(self) -> String {
        self.text
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.content())
    }
}

/// Ordered lines a command/response device sent back for one command
///
/// The terminating line (e.g. `ok`) is included as the last entry.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResponseBlock {
    /// The command this block answers, once correlated
    pub command: Option<String>,
    /// Response lines without delimiters, terminator last
    pub lines: Vec<String>,
}

impl ResponseBlock {
    /// Create an empty block
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line
    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    /// Number of lines, terminator included
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// True if nothing has been accumulated
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The terminating line, if the block is complete
    pub fn terminator(&self) -> Option<&str> {
        self.lines.last().map(String::as_str)
    }

    /// Lines before the terminator
    pub fn payload(&self) -> &[String] {
        match self.lines.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }
}

/// A numeric value decoded from a load-cell record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Signed magnitude
    pub value: f64,
    /// Unit suffix from the record, if the device sends one
    pub unit: Option<String>,
    /// Host time the record was framed
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// Create a reading stamped with the current time
    pub fn now(value: f64, unit: Option<String>) -> Self {
        Self {
            value,
            unit,
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.unit {
            Some(unit) => write!(f, "{:+.3} {}", self.value, unit),
            None => write!(f, "{:+.5}", self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Reconnecting.can_transition_to(Connected));
    }

    #[test]
    fn test_frame_content_strips_delimiter() {
        let frame = Frame::new("+001.234 lbs\r\n".to_string(), "\r\n");
        assert_eq!(frame.content(), "+001.234 lbs");
        assert_eq!(frame.len(), 14);

        let line = Frame::new("ok\r\n".to_string(), "\n");
        assert_eq!(line.content(), "ok");
    }

    #[test]
    fn test_deserialized_frame_with_bad_delimiter_length() {
        let frame: Frame = serde_json::from_str(r#"{"text":"ok","delimiter_len":5}"#).unwrap();
        assert_eq!(frame.content(), "");
        assert!(frame.is_empty());

        // A cut inside a multi-byte character
        let frame: Frame = serde_json::from_str(r#"{"text":"21°\n","delimiter_len":2}"#).unwrap();
        assert_eq!(frame.content(), "");
    }

    #[test]
    fn test_response_block_payload() {
        let mut block = ResponseBlock::new();
        block.push("X:1.00 Y:2.00 Z:3.00");
        block.push("ok");
        assert_eq!(block.terminator(), Some("ok"));
        assert_eq!(block.payload(), &["X:1.00 Y:2.00 Z:3.00".to_string()]);
        assert!(ResponseBlock::new().payload().is_empty());
    }
}
