//! # Periphlink Core
//!
//! Core types, errors, events and settings for Periphlink.
//! Provides the data model shared by the transport, framing and
//! connection-management layers.

pub mod config;
pub mod core;
pub mod data;
pub mod error;

pub use core::event::{DeviceEvent, EventDispatcher};

pub use data::{
    profile::{DeviceProfile, Parity, ReconnectPolicy, SerialSettings},
    ConnectionState, Frame, Position, Reading, ResponseBlock, SessionId,
};

pub use config::{DeviceEntry, DeviceKind, PeriphlinkConfig};

pub use error::{CommandError, Error, FrameError, ProtocolError, Result, TransportError};
