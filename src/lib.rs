//! # Periphlink
//!
//! A communication engine for serial peripherals that speak line- or
//! fixed-record-oriented text protocols over unreliable byte streams.
//!
//! ## Architecture
//!
//! Periphlink is organized as a workspace with multiple crates:
//!
//! 1. **periphlink-core** - Errors, data model, profiles, events, settings files
//! 2. **periphlink-communication** - Transports, framing, command correlation,
//!    connection management and device protocols
//! 3. **periphlink** - Logging setup and the `periphlink` command-line tool
//!
//! ## Features
//!
//! - **Bounded I/O**: every read and write carries its own deadline
//! - **Resynchronization**: fixed-length records realign after joining a stream mid-record
//! - **Command correlation**: multi-line responses matched to commands in FIFO order
//! - **Reconnection**: failed links are retried with fixed or exponential backoff
//! - **Probing**: find which port hosts a device by trying its handshake

pub use periphlink_communication::{
    device, list_ports, ConnectionManager, ContinuousLoadCell, DeviceProtocol, FrameSpec,
    FramedReader, GcodeController, GcodeDevice, QueryLoadCell, Script, SerialPortInfo,
    SessionMode, Transport,
};

pub use periphlink_core::{
    ConnectionState, DeviceEntry, DeviceEvent, DeviceKind, DeviceProfile, Error, Frame,
    PeriphlinkConfig, Position, Reading, ResponseBlock, Result,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    /// Human readable, one event per line
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Initialize logging
///
/// Sets up structured logging with:
/// - RUST_LOG environment variable support, INFO by default
/// - Text or JSON output on stderr, leaving stdout for command output
/// - Span fields (device, label, session id) on every session event
pub fn init_logging(format: LogFormat) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(tracing::Level::INFO.to_string()));

    let result = match format {
        LogFormat::Text => {
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_line_number(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(false);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()
        }
    };

    result.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}
