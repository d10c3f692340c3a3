//! Byte transports and the layers stacked on them
//!
//! - [`Transport`]: bounded-time access to one physical byte channel
//! - [`framing`]: turns arbitrarily chunked bytes into validated frames
//! - [`command_queue`]: correlates commands with multi-line response blocks
//! - [`manager`]: connect, handshake, read loop, disconnect, reconnect

pub mod command_queue;
pub mod framing;
pub mod link;
pub mod manager;
pub mod scripted;
pub mod serial;

use async_trait::async_trait;
use periphlink_core::{SerialSettings, TransportError};
use std::sync::Arc;
use std::time::Duration;

pub use command_queue::{CommandQueue, LineClass, PendingCommand, ResponseFuture};
pub use framing::{FrameSpec, FramedReader, Framing};
pub use link::Link;
pub use manager::ConnectionManager;
pub use scripted::{Script, ScriptedRead, ScriptedTransport};
pub use serial::{list_ports, SerialPortInfo, SerialTransport};

/// Asynchronous byte-level transport to a peripheral.
///
/// Every I/O call carries its own deadline and fails with
/// [`TransportError::Timeout`] instead of blocking indefinitely, so a device
/// that silently withholds bytes cannot stall the engine.
#[async_trait]
pub trait Transport: Send {
    /// Open the device identifier with the given line settings.
    ///
    /// Opening an already open transport closes the previous handle first.
    async fn open(&mut self, device_id: &str, settings: &SerialSettings)
        -> Result<(), TransportError>;

    /// Release the channel. Idempotent; safe on a transport never opened.
    async fn close(&mut self);

    /// Wait up to `timeout` for input and return between 1 and `max_count`
    /// bytes.
    ///
    /// Returns whatever is available once at least one byte has arrived; a
    /// short result is normal. Never returns an empty buffer.
    async fn load_bytes(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Write the whole string within `timeout`.
    async fn write_string(&mut self, text: &str, timeout: Duration)
        -> Result<(), TransportError>;

    /// Whether the channel is currently open
    fn is_open(&self) -> bool;
}

/// Creates a fresh transport for every connection attempt
pub type TransportFactory = Arc<dyn Fn() -> Box<dyn Transport> + Send + Sync>;

/// Factory producing real serial port transports
pub fn serial_factory() -> TransportFactory {
    Arc::new(|| Box::new(SerialTransport::new()) as Box<dyn Transport>)
}
