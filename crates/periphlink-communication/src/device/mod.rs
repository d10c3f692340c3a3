//! Device protocols
//!
//! A [`DeviceProtocol`] supplies everything device-specific to a
//! [`ConnectionManager`](crate::ConnectionManager): line settings, framing,
//! the identifying handshake, and how received frames are interpreted. The
//! manager owns the lifecycle; protocols never open, close or loop.

pub mod gcode;
pub mod load_cell;

use crate::communication::{FrameSpec, LineClass, Link};
use async_trait::async_trait;
use periphlink_core::{DeviceEntry, DeviceKind, DeviceProfile, Frame, Reading, Result};
use std::sync::Arc;

pub use gcode::{GcodeController, GcodeDevice, GcodeResponseClassifier};
pub use load_cell::{ContinuousLoadCell, QueryLoadCell};

/// How the read loop treats incoming frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// The device emits records on its own; every read must produce one and
    /// a read timeout means the link is dead
    Streaming,
    /// The device only speaks when spoken to; a read timeout is an idle tick
    CommandResponse,
}

/// Device-specific behavior plugged into a connection manager
#[async_trait]
pub trait DeviceProtocol: Send + Sync {
    /// Profile used to open and pace the connection
    fn profile(&self) -> &DeviceProfile;

    /// Human readable label
    fn label(&self) -> &str {
        &self.profile().label
    }

    /// How to frame this device's output
    fn frame_spec(&self) -> FrameSpec;

    /// Streaming or command/response
    fn mode(&self) -> SessionMode;

    /// Line terminator appended to commands
    fn command_terminator(&self) -> &str {
        "\n"
    }

    /// Decide whether the freshly opened link leads to this kind of device
    ///
    /// `Ok(false)` and probe-negative errors (timeouts, garbage, bad records)
    /// both mean "not this device".
    async fn handshake(&self, link: &mut Link) -> Result<bool>;

    /// Called before each read in streaming mode; query devices send their
    /// prompt here
    async fn poll(&self, _link: &mut Link) -> Result<()> {
        Ok(())
    }

    /// Role of one line in a command/response conversation
    fn classify(&self, _line: &str) -> LineClass {
        LineClass::Unknown
    }

    /// Numeric value carried by a streaming frame
    fn reading(&self, _frame: &Frame) -> Option<Reading> {
        None
    }
}

/// Build the protocol for a configured device
pub fn from_entry(entry: &DeviceEntry) -> Arc<dyn DeviceProtocol> {
    match entry.kind {
        DeviceKind::Gcode => {
            let mut device = GcodeDevice::new(entry.profile.clone().unwrap_or_else(|| {
                let mut profile = GcodeDevice::default_profile();
                profile.label = entry.name.clone();
                profile
            }));
            if let Some(id) = &entry.identification {
                device = device.with_identification(id.clone());
            }
            Arc::new(device.with_ignore_prefixes(entry.ignore_prefixes.iter().cloned()))
        }
        DeviceKind::ContinuousLoadCell => {
            Arc::new(ContinuousLoadCell::new(entry.profile.clone().unwrap_or_else(
                || {
                    let mut profile = ContinuousLoadCell::default_profile();
                    profile.label = entry.name.clone();
                    profile
                },
            )))
        }
        DeviceKind::QueryLoadCell => {
            Arc::new(QueryLoadCell::new(entry.profile.clone().unwrap_or_else(|| {
                let mut profile = QueryLoadCell::default_profile();
                profile.label = entry.name.clone();
                profile
            })))
        }
    }
}

/// Build the protocol for a device kind with its default profile
pub fn for_kind(kind: DeviceKind) -> Arc<dyn DeviceProtocol> {
    match kind {
        DeviceKind::Gcode => Arc::new(GcodeDevice::new(GcodeDevice::default_profile())),
        DeviceKind::ContinuousLoadCell => {
            Arc::new(ContinuousLoadCell::new(ContinuousLoadCell::default_profile()))
        }
        DeviceKind::QueryLoadCell => Arc::new(QueryLoadCell::new(QueryLoadCell::default_profile())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_entry_uses_defaults_and_name() {
        let entry = DeviceEntry {
            name: "bench scale".to_string(),
            kind: DeviceKind::QueryLoadCell,
            port: None,
            profile: None,
            identification: None,
            ignore_prefixes: Vec::new(),
        };
        let protocol = from_entry(&entry);
        assert_eq!(protocol.label(), "bench scale");
        assert_eq!(protocol.profile().serial.baud_rate, 4800);
        assert_eq!(protocol.mode(), SessionMode::Streaming);
    }

    #[test]
    fn test_for_kind_modes() {
        assert_eq!(for_kind(DeviceKind::Gcode).mode(), SessionMode::CommandResponse);
        assert_eq!(
            for_kind(DeviceKind::ContinuousLoadCell).mode(),
            SessionMode::Streaming
        );
    }
}
