//! Per-device serial configuration
//!
//! A [`DeviceProfile`] is supplied once when a connection manager is built and
//! never mutated afterwards. Durations are stored as milliseconds so profiles
//! round-trip cleanly through JSON and TOML settings files.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Parity setting of a serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parity::None => write!(f, "N"),
            Parity::Even => write!(f, "E"),
            Parity::Odd => write!(f, "O"),
        }
    }
}

/// Line settings applied when the transport is opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5 to 8)
    pub data_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Assert DTR after opening; some controller boards stay silent otherwise
    pub assert_dtr: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            assert_dtr: false,
        }
    }
}

impl fmt::Display for SerialSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.baud_rate, self.data_bits, self.parity, self.stop_bits
        )
    }
}

/// How long to wait between reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Same delay before every attempt
    Fixed {
        /// Delay in milliseconds
        delay_ms: u64,
    },
    /// Delay doubles after each failed attempt, capped
    Exponential {
        /// First delay in milliseconds
        initial_ms: u64,
        /// Upper bound in milliseconds
        max_ms: u64,
    },
}

impl ReconnectPolicy {
    /// Delay before the given attempt (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            ReconnectPolicy::Exponential { initial_ms, max_ms } => {
                let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
                Duration::from_millis(initial_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed { delay_ms: 5000 }
    }
}

/// Immutable configuration of one device connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    /// Human readable label used in diagnostics
    pub label: String,
    /// Line settings
    pub serial: SerialSettings,
    /// Deadline for each read during normal operation
    pub read_timeout_ms: u64,
    /// Deadline for each write
    pub write_timeout_ms: u64,
    /// Deadline for the identifying read right after opening
    pub handshake_timeout_ms: u64,
    /// Pause between read-loop iterations so sibling ports are not starved
    pub loop_delay_ms: u64,
    /// Maximum number of commands awaiting responses
    pub max_pending_commands: usize,
    /// Reconnect timing
    pub reconnect: ReconnectPolicy,
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self {
            label: "serial device".to_string(),
            serial: SerialSettings::default(),
            read_timeout_ms: 2000,
            write_timeout_ms: 2000,
            handshake_timeout_ms: 5000,
            loop_delay_ms: 0,
            max_pending_commands: 100,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl DeviceProfile {
    /// Create a profile with a label and line settings, defaults elsewhere
    pub fn new(label: impl Into<String>, serial: SerialSettings) -> Self {
        Self {
            label: label.into(),
            serial,
            ..Self::default()
        }
    }

    /// Read deadline
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Write deadline
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Handshake deadline
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Pacing delay between read-loop iterations
    pub fn loop_delay(&self) -> Duration {
        Duration::from_millis(self.loop_delay_ms)
    }

    /// Check that the profile describes something a transport can apply
    pub fn validate(&self) -> Result<(), String> {
        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(format!("data bits must be 5-8, got {}", self.serial.data_bits));
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            return Err(format!("stop bits must be 1 or 2, got {}", self.serial.stop_bits));
        }
        if self.serial.baud_rate == 0 {
            return Err("baud rate must be > 0".to_string());
        }
        if self.read_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err("read and write timeouts must be > 0".to_string());
        }
        if self.handshake_timeout_ms == 0 {
            return Err("handshake timeout must be > 0".to_string());
        }
        if self.max_pending_commands == 0 {
            return Err("max pending commands must be > 0".to_string());
        }
        Ok(())
    }
}
