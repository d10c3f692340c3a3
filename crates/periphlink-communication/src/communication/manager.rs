//! Connection lifecycle management
//!
//! A [`ConnectionManager`] owns one device connection: it opens the
//! transport, runs the protocol's handshake, and then hands the link to a
//! session task that loops reading frames until told to stop or until the
//! link fails. A failed link is closed, every pending command is cancelled,
//! and, while reconnection is enabled, the session waits out the reconnect
//! policy's delay and tries again.
//!
//! Callers talk to the session task over channels only; the task owns the
//! transport, the frame reader and the command queue exclusively.

use super::command_queue::{CommandQueue, PendingCommand, ResponseFuture};
use super::link::Link;
use super::{serial_factory, TransportFactory};
use crate::device::{DeviceProtocol, SessionMode};
use parking_lot::RwLock;
use periphlink_core::{
    CommandError, ConnectionState, DeviceEvent, Error, EventDispatcher, ResponseBlock, Result,
    SessionId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// State shared between a manager and its session task
#[derive(Clone)]
struct Shared {
    protocol: Arc<dyn DeviceProtocol>,
    factory: TransportFactory,
    state: Arc<RwLock<ConnectionState>>,
    device: Arc<RwLock<Option<String>>>,
    events: EventDispatcher,
    reconnect: Arc<AtomicBool>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let prev = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, next)
        };
        if prev == next {
            return;
        }
        if !prev.can_transition_to(next) {
            tracing::warn!("Unexpected state change {} -> {}", prev, next);
        }

        let device = self.device.read().clone().unwrap_or_default();
        tracing::info!("{}: {} -> {}", self.protocol.label(), prev, next);
        self.events.publish(DeviceEvent::StateChanged {
            device,
            state: next,
        });
    }

    /// Open the device and run the handshake
    ///
    /// `Ok(None)` means the device did not identify itself; probe-negative
    /// errors are folded into it.
    async fn establish(&self, device_id: &str) -> Result<Option<Link>> {
        let label = self.protocol.label();
        let mut link = Link::open(
            (self.factory)(),
            device_id,
            self.protocol.profile(),
            self.protocol.frame_spec(),
        )
        .await?;

        match self.protocol.handshake(&mut link).await {
            Ok(true) => {
                tracing::info!("{} identified on {}", label, device_id);
                Ok(Some(link))
            }
            Ok(false) => {
                tracing::info!("{} not found on {}", label, device_id);
                link.close().await;
                Ok(None)
            }
            Err(e) if e.is_probe_negative() => {
                tracing::info!("{} not found on {}: {}", label, device_id, e);
                link.close().await;
                Ok(None)
            }
            Err(e) => {
                link.close().await;
                Err(e)
            }
        }
    }
}

struct SessionHandle {
    id: SessionId,
    requests: mpsc::UnboundedSender<PendingCommand>,
    shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Manages the connection to one device
pub struct ConnectionManager {
    shared: Shared,
    auto_reconnect: bool,
    session: Option<SessionHandle>,
}

impl ConnectionManager {
    /// Create a manager whose connections use transports from `factory`
    pub fn new(protocol: Arc<dyn DeviceProtocol>, factory: TransportFactory) -> Self {
        Self {
            shared: Shared {
                protocol,
                factory,
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                device: Arc::new(RwLock::new(None)),
                events: EventDispatcher::default(),
                reconnect: Arc::new(AtomicBool::new(false)),
            },
            auto_reconnect: true,
            session: None,
        }
    }

    /// Create a manager talking to real serial ports
    pub fn serial(protocol: Arc<dyn DeviceProtocol>) -> Self {
        Self::new(protocol, serial_factory())
    }

    /// Enable or disable reconnecting after a link failure (default: enabled)
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// The device protocol
    pub fn protocol(&self) -> &Arc<dyn DeviceProtocol> {
        &self.shared.protocol
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// True once connected and until the link fails or is closed
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Device identifier of the current or most recent session
    pub fn device_id(&self) -> Option<String> {
        self.shared.device.read().clone()
    }

    /// ID of the running session, if any
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Subscribe to state changes, data and anomalies
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    /// The event dispatcher, for callers that publish alongside the session
    pub fn events(&self) -> &EventDispatcher {
        &self.shared.events
    }

    fn session_running(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.task.is_finished())
    }

    /// Connect to `device_id`
    ///
    /// Returns `Ok(true)` once the device has identified itself and the read
    /// loop is running, `Ok(false)` if it did not identify (timeout, garbage,
    /// wrong banner), and `Err` if the transport could not be opened.
    pub async fn connect(&mut self, device_id: &str) -> Result<bool> {
        if self.session_running() {
            return Err(Error::AlreadyConnected {
                device: self.device_id().unwrap_or_default(),
            });
        }
        self.session = None;

        *self.shared.device.write() = Some(device_id.to_string());
        self.shared.set_state(ConnectionState::Connecting);

        match self.shared.establish(device_id).await {
            Ok(Some(link)) => {
                self.shared
                    .reconnect
                    .store(self.auto_reconnect, Ordering::SeqCst);
                self.shared.set_state(ConnectionState::Connected);
                self.spawn_session(link);
                Ok(true)
            }
            Ok(None) => {
                self.shared.set_state(ConnectionState::Disconnected);
                Ok(false)
            }
            Err(e) => {
                tracing::error!("Failed to connect to {}: {}", device_id, e);
                self.shared.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    fn spawn_session(&mut self, link: Link) {
        let id = SessionId::new();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let span = tracing::info_span!(
            "session",
            label = %self.shared.protocol.label(),
            device = %link.device(),
            id = %id
        );
        let session = Session {
            shared: self.shared.clone(),
            queue: CommandQueue::new(self.shared.protocol.profile().max_pending_commands),
            link,
            requests: requests_rx,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(session.run().instrument(span));

        self.session = Some(SessionHandle {
            id,
            requests: requests_tx,
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Stop the session and release the device
    ///
    /// Disables reconnection, cancels pending commands and closes the
    /// transport. Safe to call any number of times, in any state.
    pub async fn disconnect(&mut self) {
        self.shared.reconnect.store(false, Ordering::SeqCst);

        if let Some(session) = self.session.take() {
            // A full channel already carries a shutdown request.
            let _ = session.shutdown.try_send(());
            if let Err(e) = session.task.await {
                tracing::warn!("Session task ended abnormally: {}", e);
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Check whether the device answers on `device_id`
    ///
    /// Opens, handshakes and closes again without starting a session. Every
    /// failure, including failure to open, is a negative result.
    pub async fn probe(&self, device_id: &str) -> bool {
        if self.session_running() {
            tracing::warn!(
                "{}: not probing {} while a session is running",
                self.shared.protocol.label(),
                device_id
            );
            return false;
        }

        match self.shared.establish(device_id).await {
            Ok(Some(mut link)) => {
                link.close().await;
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::info!(
                    "{}: probe of {} failed: {}",
                    self.shared.protocol.label(),
                    device_id,
                    e
                );
                false
            }
        }
    }

    /// First identifier in `device_ids` on which the device answers
    pub async fn find_device<S: AsRef<str>>(&self, device_ids: &[S]) -> Option<String> {
        for id in device_ids {
            if self.probe(id.as_ref()).await {
                return Some(id.as_ref().to_string());
            }
        }
        tracing::info!("{} not found on any port", self.shared.protocol.label());
        None
    }

    /// Send a command; the returned future resolves to its response block
    ///
    /// Commands are written in call order. The future fails with
    /// [`CommandError::NotConnected`] when there is no live session, and with
    /// [`CommandError::Cancelled`] if the connection closes first.
    pub fn send_command(&self, command: impl Into<String>) -> ResponseFuture {
        let command = command.into();
        let session = match &self.session {
            Some(session) if self.is_connected() => session,
            _ => return ResponseFuture::failed(command, CommandError::NotConnected),
        };

        let (future, responder) = ResponseFuture::channel(command.clone());
        match session.requests.send(PendingCommand::new(command, responder)) {
            Ok(()) => future,
            Err(mpsc::error::SendError(pending)) => {
                ResponseFuture::failed(pending.command, CommandError::NotConnected)
            }
        }
    }
}

enum Exit {
    Shutdown,
    Failed(Error),
}

/// Everything the session task owns
struct Session {
    shared: Shared,
    link: Link,
    queue: CommandQueue,
    requests: mpsc::UnboundedReceiver<PendingCommand>,
    shutdown: mpsc::Receiver<()>,
}

impl Session {
    async fn run(mut self) {
        loop {
            let failure = match self.drive().await {
                Exit::Shutdown => break,
                Exit::Failed(e) => e,
            };

            tracing::error!("Link failed: {}", failure);
            self.shared
                .events
                .publish(DeviceEvent::LinkError(failure.to_string()));
            self.close().await;

            if !self.shared.reconnect.load(Ordering::SeqCst) {
                break;
            }
            self.shared.set_state(ConnectionState::Reconnecting);
            if !self.reconnect().await {
                break;
            }
            self.shared.set_state(ConnectionState::Connected);
        }

        self.close().await;
        self.cancel_requests();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    async fn close(&mut self) {
        self.link.close().await;
        self.queue.cancel_all();
    }

    /// Cancel commands accepted while connected but never written
    fn cancel_requests(&mut self) {
        while let Ok(pending) = self.requests.try_recv() {
            let command = pending.command.clone();
            pending.respond(Err(CommandError::Cancelled { command }));
        }
    }

    /// Read loop; returns when asked to stop or when the link fails
    ///
    /// In command/response mode a new request interrupts the pending read so
    /// it is written at once; reads keep partial input across interruption.
    async fn drive(&mut self) -> Exit {
        let protocol = self.shared.protocol.clone();
        let read_timeout = protocol.profile().read_timeout();
        let loop_delay = protocol.profile().loop_delay();
        let wake_on_request = protocol.mode() == SessionMode::CommandResponse;
        let mut next: Option<PendingCommand> = None;

        loop {
            match self.shutdown.try_recv() {
                Err(mpsc::error::TryRecvError::Empty) => {}
                _ => return Exit::Shutdown,
            }

            if let Err(e) = self.write_requests(next.take()).await {
                return Exit::Failed(e);
            }

            let Session {
                shared,
                link,
                queue,
                requests,
                shutdown,
            } = &mut *self;
            let step = read_step(protocol.as_ref(), link, queue, &shared.events, read_timeout);
            let result = tokio::select! {
                biased;
                _ = shutdown.recv() => return Exit::Shutdown,
                request = requests.recv(), if wake_on_request => match request {
                    Some(pending) => {
                        next = Some(pending);
                        continue;
                    }
                    None => return Exit::Shutdown,
                },
                result = step => result,
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_link_failure() => return Exit::Failed(e),
                Err(e) => {
                    tracing::warn!("{}", e);
                    self.shared.events.publish(DeviceEvent::Anomaly(e.to_string()));
                }
            }

            if !loop_delay.is_zero() {
                tokio::select! {
                    _ = self.shutdown.recv() => return Exit::Shutdown,
                    _ = tokio::time::sleep(loop_delay) => {}
                }
            }
        }
    }

    /// Write `first`, then every queued request
    async fn write_requests(&mut self, first: Option<PendingCommand>) -> Result<()> {
        let protocol = self.shared.protocol.clone();
        let mut first = first;
        loop {
            let pending = match first.take() {
                Some(pending) => pending,
                None => match self.requests.try_recv() {
                    Ok(pending) => pending,
                    Err(_) => return Ok(()),
                },
            };
            if self.queue.is_full() {
                self.queue.push(pending);
                continue;
            }

            let line = format!("{}{}", pending.command, protocol.command_terminator());
            if let Err(e) = self.link.write(&line).await {
                pending.respond(Err(CommandError::Link {
                    reason: e.to_string(),
                }));
                return Err(e);
            }

            match protocol.mode() {
                SessionMode::CommandResponse => {
                    self.queue.push(pending);
                }
                SessionMode::Streaming => {
                    // Streaming devices never answer; the write is the result.
                    let block = ResponseBlock {
                        command: Some(pending.command.clone()),
                        lines: Vec::new(),
                    };
                    pending.respond(Ok(block));
                }
            }
        }
    }

    /// Try to re-establish the link; false if shut down meanwhile
    async fn reconnect(&mut self) -> bool {
        let device = self.shared.device.read().clone().unwrap_or_default();
        let policy = self.shared.protocol.profile().reconnect;
        let mut attempt = 0u32;

        loop {
            let delay = policy.delay_for(attempt);
            tracing::info!("Reconnecting to {} in {:?}", device, delay);
            tokio::select! {
                _ = self.shutdown.recv() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            self.cancel_requests();
            if !self.shared.reconnect.load(Ordering::SeqCst) {
                return false;
            }

            self.shared.set_state(ConnectionState::Connecting);
            let shared = self.shared.clone();
            let outcome = tokio::select! {
                _ = self.shutdown.recv() => return false,
                outcome = shared.establish(&device) => outcome,
            };
            match outcome {
                Ok(Some(link)) => {
                    self.link = link;
                    return true;
                }
                Ok(None) => tracing::warn!("{} did not identify on {}", shared.protocol.label(), device),
                Err(e) => tracing::warn!("Reconnect attempt {} failed: {}", attempt + 1, e),
            }

            self.shared.set_state(ConnectionState::Reconnecting);
            attempt = attempt.saturating_add(1);
        }
    }
}

/// One read-loop iteration
async fn read_step(
    protocol: &dyn DeviceProtocol,
    link: &mut Link,
    queue: &mut CommandQueue,
    events: &EventDispatcher,
    read_timeout: std::time::Duration,
) -> Result<()> {
    match protocol.mode() {
        SessionMode::Streaming => {
            protocol.poll(link).await?;
            let frame = link.next_frame(read_timeout).await?;
            tracing::trace!("<- {:?}", frame.as_str());
            if let Some(reading) = protocol.reading(&frame) {
                events.publish(DeviceEvent::Reading(reading));
            }
            events.publish(DeviceEvent::Data(frame));
            Ok(())
        }
        SessionMode::CommandResponse => match link.next_frame(read_timeout).await {
            Ok(frame) => {
                let line = frame.content();
                tracing::trace!("<- {:?}", line);
                let class = protocol.classify(line);
                if let Err(e) = queue.accept(line, class) {
                    tracing::warn!("{}", e);
                    events.publish(DeviceEvent::Anomaly(e.to_string()));
                }
                Ok(())
            }
            // Idle: the device only talks when spoken to.
            Err(e) if e.is_timeout() => Ok(()),
            Err(e) => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::Script;
    use crate::device::ContinuousLoadCell;
    use periphlink_core::DeviceProfile;

    fn fast_profile() -> DeviceProfile {
        DeviceProfile {
            read_timeout_ms: 50,
            write_timeout_ms: 50,
            handshake_timeout_ms: 50,
            ..ContinuousLoadCell::default_profile()
        }
    }

    #[tokio::test]
    async fn test_send_without_session_fails() {
        let script = Script::new();
        let manager = ConnectionManager::new(
            Arc::new(ContinuousLoadCell::new(fast_profile())),
            script.factory(),
        );
        assert_eq!(manager.send_command("T").await, Err(CommandError::NotConnected));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.session_id().is_none());
    }

    #[tokio::test]
    async fn test_open_failure_is_error() {
        let script = Script::new();
        script.fail_opens(1);
        let mut manager = ConnectionManager::new(
            Arc::new(ContinuousLoadCell::new(fast_profile())),
            script.factory(),
        );
        let result = manager.connect("/dev/ttyUSB0").await;
        assert!(matches!(
            result,
            Err(Error::Transport(periphlink_core::TransportError::OpenFailed { .. }))
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
