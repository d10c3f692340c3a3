//! An open transport paired with its frame reader
//!
//! Device protocols drive handshakes and polls through a [`Link`]; they never
//! see the raw transport handle or the session internals.

use super::framing::{FrameSpec, FramedReader};
use super::Transport;
use periphlink_core::{DeviceProfile, Error, Frame, Result};
use std::time::Duration;

/// Open transport plus the reader framing its input
pub struct Link {
    transport: Box<dyn Transport>,
    reader: FramedReader,
    profile: DeviceProfile,
    device: String,
}

impl Link {
    /// Open `device` with the profile's line settings
    pub async fn open(
        mut transport: Box<dyn Transport>,
        device: &str,
        profile: &DeviceProfile,
        spec: FrameSpec,
    ) -> Result<Self> {
        spec.validate().map_err(Error::config)?;
        transport.open(device, &profile.serial).await?;
        Ok(Self {
            transport,
            reader: FramedReader::new(spec),
            profile: profile.clone(),
            device: device.to_string(),
        })
    }

    /// Device identifier this link was opened on
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Profile the link was opened with
    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Read the next validated frame
    pub async fn next_frame(&mut self, timeout: Duration) -> Result<Frame> {
        self.reader
            .next_frame(self.transport.as_mut(), timeout)
            .await
    }

    /// Read raw bytes, bypassing framing
    pub async fn load_raw(&mut self, max_count: usize, timeout: Duration) -> Result<Vec<u8>> {
        Ok(self.transport.load_bytes(max_count, timeout).await?)
    }

    /// Hand raw bytes read past a handshake back to the frame reader
    pub fn unread(&mut self, bytes: &[u8]) -> Result<()> {
        self.reader.push_input(bytes)
    }

    /// Bytes received but not yet framed
    pub fn pending_input(&self) -> usize {
        self.reader.residual().len()
    }

    /// Write text within the profile's write deadline
    pub async fn write(&mut self, text: &str) -> Result<()> {
        let timeout = self.profile.write_timeout();
        tracing::trace!("-> {:?}", text);
        Ok(self.transport.write_string(text, timeout).await?)
    }

    /// Close the transport and drop buffered input
    pub async fn close(&mut self) {
        self.reader.reset();
        self.transport.close().await;
    }

    /// Whether the transport is still open
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }
}
