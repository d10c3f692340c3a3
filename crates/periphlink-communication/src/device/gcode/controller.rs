//! G-code controller
//!
//! Pairs a [`GcodeDevice`] with a [`ConnectionManager`] and offers the
//! motion commands used to drive a three-axis stage.

use super::{parse_position, GcodeDevice};
use crate::communication::{ConnectionManager, TransportFactory};
use periphlink_core::{ConnectionState, DeviceEvent, Error, Position, ResponseBlock, Result};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Motion controller connection
pub struct GcodeController {
    device: Arc<GcodeDevice>,
    manager: ConnectionManager,
}

impl GcodeController {
    /// Create a controller whose connections use `factory`
    pub fn new(device: GcodeDevice, factory: TransportFactory) -> Self {
        let device = Arc::new(device);
        let manager = ConnectionManager::new(device.clone(), factory);
        Self { device, manager }
    }

    /// Create a controller on real serial ports
    pub fn serial(device: GcodeDevice) -> Self {
        Self::new(device, crate::communication::serial_factory())
    }

    /// The underlying connection manager
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Connect and wait for the identification banner
    pub async fn connect(&mut self, device_id: &str) -> Result<bool> {
        self.manager.connect(device_id).await
    }

    /// Disconnect; pending commands are cancelled
    pub async fn disconnect(&mut self) {
        self.manager.disconnect().await
    }

    /// Connection state
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.manager.subscribe()
    }

    /// Send a raw command and wait for its response block
    pub async fn send_command(&self, command: &str) -> Result<ResponseBlock> {
        Ok(self.manager.send_command(command).await?)
    }

    /// Home all axes (G28)
    pub async fn home(&self) -> Result<ResponseBlock> {
        self.send_command("G28").await
    }

    /// Linear move to an absolute position at `feed` mm/min (G1)
    pub async fn move_to(&self, x: f64, y: f64, z: f64, feed: f64) -> Result<ResponseBlock> {
        self.send_command(&format!("G1 X{} Y{} Z{} F{}", x, y, z, feed))
            .await
    }

    /// Ask for the current position (M114)
    ///
    /// The position report also updates [`GcodeController::position`].
    pub async fn query_position(&self) -> Result<Position> {
        let block = self.send_command("M114").await?;
        block
            .payload()
            .iter()
            .rev()
            .find_map(|line| parse_position(line))
            .ok_or_else(|| Error::other("M114 response carried no position report"))
    }

    /// Last position reported by the controller
    pub fn position(&self) -> Position {
        self.device.position()
    }
}
