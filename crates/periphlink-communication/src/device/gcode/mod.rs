//! G-code motion controller support
//!
//! Marlin-style controllers print a banner after reset, then answer each
//! command with optional report lines and a final `ok`.
//!
//! - [`GcodeDevice`]: the [`DeviceProtocol`] (handshake, framing, line roles)
//! - [`GcodeResponseClassifier`]: line classification and position parsing
//! - [`GcodeController`]: motion commands over a connection manager

pub mod controller;
pub mod response_parser;

pub use controller::GcodeController;
pub use response_parser::{parse_position, GcodeResponseClassifier};

use super::{DeviceProtocol, SessionMode};
use crate::communication::framing::{check_utf8, READ_BLOCK_SIZE};
use crate::communication::{FrameSpec, LineClass, Link};
use async_trait::async_trait;
use parking_lot::RwLock;
use periphlink_core::{DeviceProfile, Position, ReconnectPolicy, Result, SerialSettings};
use std::sync::Arc;
use tokio::time::Instant;

/// Banner substring identifying the default controller
pub const DEFAULT_IDENTIFICATION: &str = "Pulse D-224";

/// Motion controller protocol
#[derive(Debug, Clone)]
pub struct GcodeDevice {
    profile: DeviceProfile,
    identification: String,
    classifier: GcodeResponseClassifier,
    position: Arc<RwLock<Position>>,
}

impl GcodeDevice {
    /// Create with an explicit profile and the default identification
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            identification: DEFAULT_IDENTIFICATION.to_string(),
            classifier: GcodeResponseClassifier::new(),
            position: Arc::new(RwLock::new(Position::default())),
        }
    }

    /// 250000-8-N-1 with DTR, 200 ms deadlines, 5 s banner wait
    pub fn default_profile() -> DeviceProfile {
        let serial = SerialSettings {
            baud_rate: 250_000,
            data_bits: 8,
            assert_dtr: true,
            ..SerialSettings::default()
        };
        DeviceProfile {
            read_timeout_ms: 200,
            write_timeout_ms: 200,
            handshake_timeout_ms: 5000,
            loop_delay_ms: 0,
            reconnect: ReconnectPolicy::Fixed { delay_ms: 5000 },
            ..DeviceProfile::new("gcode controller", serial)
        }
    }

    /// Expect a different banner substring
    pub fn with_identification(mut self, identification: impl Into<String>) -> Self {
        self.identification = identification.into();
        self
    }

    /// Ignore additional line prefixes
    pub fn with_ignore_prefixes(mut self, prefixes: impl IntoIterator<Item = String>) -> Self {
        self.classifier = self.classifier.with_ignore_prefixes(prefixes);
        self
    }

    /// Use a custom classifier
    pub fn with_classifier(mut self, classifier: GcodeResponseClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Banner substring this device waits for
    pub fn identification(&self) -> &str {
        &self.identification
    }

    /// Last reported position
    pub fn position(&self) -> Position {
        *self.position.read()
    }
}

#[async_trait]
impl DeviceProtocol for GcodeDevice {
    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn frame_spec(&self) -> FrameSpec {
        FrameSpec::lines()
    }

    fn mode(&self) -> SessionMode {
        SessionMode::CommandResponse
    }

    async fn handshake(&self, link: &mut Link) -> Result<bool> {
        let deadline = Instant::now() + self.profile.handshake_timeout();
        let mut banner: Vec<u8> = Vec::new();

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            match link.load_raw(READ_BLOCK_SIZE, left).await {
                Ok(bytes) => banner.extend_from_slice(&bytes),
                Err(e) if e.is_timeout() => break,
                Err(e) => return Err(e),
            }
            check_utf8(&banner)?;

            if let Some(tail) = after_banner_line(&banner, self.identification.as_bytes()) {
                tracing::debug!("{}: banner identified ({} bytes)", self.label(), banner.len());
                link.unread(tail)?;
                return Ok(true);
            }
        }

        tracing::info!(
            "{}: {:?} not found in {} banner bytes",
            self.label(),
            self.identification,
            banner.len()
        );
        Ok(false)
    }

    fn classify(&self, line: &str) -> LineClass {
        let class = self.classifier.classify(line);
        if class == LineClass::Partial {
            if let Some(position) = parse_position(line) {
                *self.position.write() = position;
            }
        }
        class
    }
}

/// Bytes following the line that carries `identification`, if it was seen
///
/// A banner line still missing its newline yields an empty tail.
fn after_banner_line<'a>(banner: &'a [u8], identification: &[u8]) -> Option<&'a [u8]> {
    let found = banner
        .windows(identification.len().max(1))
        .position(|w| w == identification)?;
    let rest = &banner[found + identification.len()..];
    Some(match rest.iter().position(|&b| b == b'\n') {
        Some(newline) => &rest[newline + 1..],
        None => &[],
    })
}
