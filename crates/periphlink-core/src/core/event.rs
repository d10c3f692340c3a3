//! Event system for device sessions
//!
//! Provides:
//! - Event types for connection state changes and device output
//! - Event dispatcher publishing events to any number of subscribers

use crate::data::{ConnectionState, Frame, Reading};
use tokio::sync::broadcast;

/// Events published by a connection manager
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Connection state changed
    StateChanged {
        /// Device identifier of the session
        device: String,
        /// The new state
        state: ConnectionState,
    },
    /// A streaming device produced a validated frame
    Data(Frame),
    /// A streaming device's frame decoded to a numeric reading
    Reading(Reading),
    /// Protocol anomaly worth surfacing (orphan response, unknown line)
    Anomaly(String),
    /// The live link failed; a reconnect may follow
    LinkError(String),
}

impl std::fmt::Display for DeviceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceEvent::StateChanged { device, state } => write!(f, "{}: {}", device, state),
            DeviceEvent::Data(frame) => write!(f, "Data: {}", frame),
            DeviceEvent::Reading(reading) => write!(f, "Reading: {}", reading),
            DeviceEvent::Anomaly(msg) => write!(f, "Anomaly: {}", msg),
            DeviceEvent::LinkError(msg) => write!(f, "Link error: {}", msg),
        }
    }
}

/// Event dispatcher for publishing events to subscribers
#[derive(Clone)]
pub struct EventDispatcher {
    /// Broadcast sender channel for device events.
    tx: broadcast::Sender<DeviceEvent>,
}

impl EventDispatcher {
    /// Create a new event dispatcher
    ///
    /// # Arguments
    /// * `buffer_size` - Size of the broadcast buffer (default 256)
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Subscribe to events
    ///
    /// A receiver that falls more than `buffer_size` events behind sees
    /// `RecvError::Lagged` and resumes from the oldest retained event.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of subscribers reached; publishing with nobody
    /// listening is not an error for a device session.
    pub fn publish(&self, event: DeviceEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Get number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(256)
    }
}
