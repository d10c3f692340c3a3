//! # Periphlink Communication
//!
//! Talks to line- and record-oriented serial peripherals over unreliable
//! byte streams. Provides bounded-time transports (serial and scripted),
//! frame extraction with resynchronization, command/response correlation,
//! and connection lifecycle management with automatic reconnection.
//! Includes protocols for G-code motion controllers and load cells.

pub mod communication;
pub mod device;

pub use communication::{
    list_ports, serial_factory, CommandQueue, ConnectionManager, FrameSpec, FramedReader, Framing,
    LineClass, Link, PendingCommand, ResponseFuture, Script, ScriptedRead, ScriptedTransport,
    SerialPortInfo, SerialTransport, Transport, TransportFactory,
};

pub use device::{
    ContinuousLoadCell, DeviceProtocol, GcodeController, GcodeDevice, GcodeResponseClassifier,
    QueryLoadCell, SessionMode,
};
