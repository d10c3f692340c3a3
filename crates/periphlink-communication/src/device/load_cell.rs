//! Load cell protocols
//!
//! Two variants of the same instrument family:
//! - [`ContinuousLoadCell`] streams fixed 18-byte records (`+0001.234    lbs\r\n`)
//!   without being asked
//! - [`QueryLoadCell`] stays silent until it receives `?`, then answers with
//!   one 10-byte record (`+0001.234\r`)

use super::{DeviceProtocol, SessionMode};
use crate::communication::{FrameSpec, Link};
use async_trait::async_trait;
use periphlink_core::{
    DeviceProfile, Frame, Parity, Reading, ReconnectPolicy, Result, SerialSettings,
};
use regex::Regex;
use std::sync::OnceLock;

/// Record length of the streaming variant, delimiter included
pub const CONTINUOUS_RECORD_LEN: usize = 18;

/// Record length of the query variant, delimiter included
pub const QUERY_RECORD_LEN: usize = 10;

/// Prompt that makes the query variant send one record
pub const QUERY_PROMPT: &str = "?";

fn continuous_format() -> Regex {
    static FORMAT: OnceLock<Regex> = OnceLock::new();
    FORMAT
        .get_or_init(|| Regex::new(r"^[+-]\d+\.\d+\s+lbs\r\n$").expect("invalid regex pattern"))
        .clone()
}

fn query_format() -> Regex {
    static FORMAT: OnceLock<Regex> = OnceLock::new();
    FORMAT
        .get_or_init(|| Regex::new(r"^[+-]\d+\.\d+\r$").expect("invalid regex pattern"))
        .clone()
}

/// Split `+0001.234    lbs` into value and optional unit
fn parse_reading(content: &str) -> Option<Reading> {
    let mut parts = content.split_whitespace();
    let value = parts.next()?.parse::<f64>().ok()?;
    let unit = parts.next().map(str::to_string);
    Some(Reading::now(value, unit))
}

/// Load cell that streams records continuously
#[derive(Debug, Clone)]
pub struct ContinuousLoadCell {
    profile: DeviceProfile,
}

impl ContinuousLoadCell {
    /// Create with an explicit profile
    pub fn new(profile: DeviceProfile) -> Self {
        Self { profile }
    }

    /// 9600-8-N-1, 2 s deadlines, 5 s reconnect delay
    pub fn default_profile() -> DeviceProfile {
        DeviceProfile {
            read_timeout_ms: 2000,
            write_timeout_ms: 2000,
            handshake_timeout_ms: 2000,
            loop_delay_ms: 0,
            reconnect: ReconnectPolicy::Fixed { delay_ms: 5000 },
            ..DeviceProfile::new("continuous load cell", SerialSettings::default())
        }
    }
}

#[async_trait]
impl DeviceProtocol for ContinuousLoadCell {
    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn frame_spec(&self) -> FrameSpec {
        FrameSpec::fixed(CONTINUOUS_RECORD_LEN, "\r\n").with_format(continuous_format())
    }

    fn mode(&self) -> SessionMode {
        SessionMode::Streaming
    }

    async fn handshake(&self, link: &mut Link) -> Result<bool> {
        let frame = link.next_frame(self.profile.handshake_timeout()).await?;
        tracing::debug!("{}: identified by record {:?}", self.label(), frame.content());
        Ok(true)
    }

    fn reading(&self, frame: &Frame) -> Option<Reading> {
        parse_reading(frame.content())
    }
}

/// Load cell that answers one record per query
#[derive(Debug, Clone)]
pub struct QueryLoadCell {
    profile: DeviceProfile,
}

impl QueryLoadCell {
    /// Create with an explicit profile
    pub fn new(profile: DeviceProfile) -> Self {
        Self { profile }
    }

    /// 4800-7-E-2, 500 ms deadlines, 100 ms between queries
    pub fn default_profile() -> DeviceProfile {
        let serial = SerialSettings {
            baud_rate: 4800,
            data_bits: 7,
            parity: Parity::Even,
            stop_bits: 2,
            assert_dtr: false,
        };
        DeviceProfile {
            read_timeout_ms: 500,
            write_timeout_ms: 500,
            handshake_timeout_ms: 500,
            loop_delay_ms: 100,
            reconnect: ReconnectPolicy::Fixed { delay_ms: 5000 },
            ..DeviceProfile::new("query load cell", serial)
        }
    }
}

#[async_trait]
impl DeviceProtocol for QueryLoadCell {
    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn frame_spec(&self) -> FrameSpec {
        FrameSpec::fixed(QUERY_RECORD_LEN, "\r").with_format(query_format())
    }

    fn mode(&self) -> SessionMode {
        SessionMode::Streaming
    }

    async fn handshake(&self, link: &mut Link) -> Result<bool> {
        // Unprompted, this device says nothing.
        match link.next_frame(self.profile.read_timeout()).await {
            Ok(frame) => {
                tracing::info!(
                    "{}: unsolicited record {:?}, not a query device",
                    self.label(),
                    frame.content()
                );
                return Ok(false);
            }
            Err(e) if e.is_timeout() => {
                if link.pending_input() > 0 {
                    tracing::info!(
                        "{}: {} unsolicited bytes, not a query device",
                        self.label(),
                        link.pending_input()
                    );
                    return Ok(false);
                }
            }
            Err(e) => return Err(e),
        }

        link.write(QUERY_PROMPT).await?;
        let frame = link.next_frame(self.profile.handshake_timeout()).await?;
        tracing::debug!("{}: answered query with {:?}", self.label(), frame.content());
        Ok(true)
    }

    async fn poll(&self, link: &mut Link) -> Result<()> {
        link.write(QUERY_PROMPT).await
    }

    fn reading(&self, frame: &Frame) -> Option<Reading> {
        parse_reading(frame.content())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuous_format() {
        let format = continuous_format();
        assert!(format.is_match("+0001.234    lbs\r\n"));
        assert!(format.is_match("-12.5 lbs\r\n"));
        assert!(!format.is_match("+0001.234    kgs\r\n"));
        assert!(!format.is_match("0001.234     lbs\r\n"));
        assert_eq!("+0001.234    lbs\r\n".len(), CONTINUOUS_RECORD_LEN);
    }

    #[test]
    fn test_query_format() {
        let format = query_format();
        assert!(format.is_match("+0001.234\r"));
        assert!(!format.is_match("+0001.234\n"));
        assert!(!format.is_match("?0001.234\r"));
        assert_eq!("+0001.234\r".len(), QUERY_RECORD_LEN);
    }

    #[test]
    fn test_reading_from_frame() {
        let cell = ContinuousLoadCell::new(ContinuousLoadCell::default_profile());
        let frame = Frame::new("-0012.500    lbs\r\n".to_string(), "\r\n");
        let reading = cell.reading(&frame).unwrap();
        assert_eq!(reading.value, -12.5);
        assert_eq!(reading.unit.as_deref(), Some("lbs"));

        let query = QueryLoadCell::new(QueryLoadCell::default_profile());
        let frame = Frame::new("+0001.234\r".to_string(), "\r");
        let reading = query.reading(&frame).unwrap();
        assert!((reading.value - 1.234).abs() < 1e-9);
        assert!(reading.unit.is_none());
    }

    #[test]
    fn test_default_profiles() {
        let query = QueryLoadCell::default_profile();
        assert_eq!(query.serial.to_string(), "4800-7-E-2");
        assert_eq!(query.loop_delay_ms, 100);
        assert!(query.validate().is_ok());

        let continuous = ContinuousLoadCell::default_profile();
        assert_eq!(continuous.serial.to_string(), "9600-8-N-1");
        assert_eq!(continuous.read_timeout_ms, 2000);
    }
}
