//! Serial port transport
//!
//! Provides low-level serial port operations for direct hardware connection
//! to peripherals via USB or RS-232.
//!
//! Supports:
//! - Port enumeration and discovery
//! - Baud rate, data bits, parity and stop bit configuration
//! - DTR assertion for boards that wait for it
//! - Deadline-bounded reads and writes

use super::Transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use periphlink_core::{Parity, SerialSettings, TransportError};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Per-call timeout handed to the OS; deadlines are enforced by looping on it
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// Manufacturer name if available
    pub manufacturer: Option<String>,

    /// Serial number if available
    pub serial_number: Option<String>,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            manufacturer: None,
            serial_number: None,
            vid: None,
            pid: None,
        }
    }
}

impl From<&serialport::SerialPortInfo> for SerialPortInfo {
    fn from(port: &serialport::SerialPortInfo) -> Self {
        let mut info = SerialPortInfo::new(&port.port_name, get_port_description(port));
        if let serialport::SerialPortType::UsbPort(usb_info) = &port.port_type {
            info.vid = Some(usb_info.vid);
            info.pid = Some(usb_info.pid);
            info.manufacturer = usb_info.manufacturer.clone();
            info.serial_number = usb_info.serial_number.clone();
        }
        info
    }
}

/// List available serial ports on the system
///
/// Ports are ordered deterministically: ttyACM* first, then ttyUSB*, then
/// COM ports, each numerically, then everything else by name. The engine
/// never discovers devices on its own; callers feed these identifiers to a
/// connection manager.
pub fn list_ports() -> periphlink_core::Result<Vec<SerialPortInfo>> {
    match serialport::available_ports() {
        Ok(ports) => {
            let mut infos: Vec<SerialPortInfo> = ports.iter().map(SerialPortInfo::from).collect();
            infos.sort_by_key(|p| port_sort_key(&p.port_name));
            Ok(infos)
        }
        Err(e) => {
            tracing::error!("Failed to enumerate serial ports: {}", e);
            Err(periphlink_core::Error::other(format!(
                "Failed to enumerate ports: {}",
                e
            )))
        }
    }
}

fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    let numbered = [("ttyACM", 0u8), ("ttyUSB", 1), ("COM", 2)];
    for (prefix, rank) in numbered {
        if let Some(rest) = basename.strip_prefix(prefix) {
            if let Ok(num) = rest.parse::<usize>() {
                return (rank, num, basename.to_string());
            }
        }
    }
    (3, 0, basename.to_string())
}

/// Get a user-friendly description for a port
fn get_port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

fn to_serialport_parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Even => serialport::Parity::Even,
        Parity::Odd => serialport::Parity::Odd,
    }
}

fn to_data_bits(bits: u8) -> Result<serialport::DataBits, TransportError> {
    match bits {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        _ => Err(TransportError::InvalidSettings {
            reason: format!("Invalid data bits: {}", bits),
        }),
    }
}

fn to_stop_bits(bits: u8) -> Result<serialport::StopBits, TransportError> {
    match bits {
        1 => Ok(serialport::StopBits::One),
        2 => Ok(serialport::StopBits::Two),
        _ => Err(TransportError::InvalidSettings {
            reason: format!("Invalid stop bits: {}", bits),
        }),
    }
}

type SharedPort = Arc<Mutex<Box<dyn serialport::SerialPort>>>;

/// Real serial port transport using the serialport crate
///
/// Blocking port calls run on tokio's blocking pool; each one loops on a
/// short OS timeout until its own deadline passes or the port is closed.
/// A load interrupted by its caller keeps running and its bytes are handed
/// to the next load, so no input is lost. Closing stops any call still in
/// flight and waits for it before releasing the port.
#[derive(Default)]
pub struct SerialTransport {
    port: Option<SharedPort>,
    device: String,
    closing: Arc<AtomicBool>,
    reader: Option<JoinHandle<Result<Vec<u8>, TransportError>>>,
    writer: Option<JoinHandle<Result<(), TransportError>>>,
}

impl SerialTransport {
    /// Create a closed transport
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&mut self, port: Box<dyn serialport::SerialPort>, device_id: &str) {
        self.port = Some(Arc::new(Mutex::new(port)));
        self.device = device_id.to_string();
        self.closing = Arc::new(AtomicBool::new(false));
    }

    fn port(&self) -> Result<SharedPort, TransportError> {
        self.port.clone().ok_or(TransportError::NotOpen)
    }

    /// Wait for a write abandoned by its caller
    async fn settle_writer(&mut self) {
        if let Some(writer) = self.writer.take() {
            match writer.await {
                Ok(Err(e)) => tracing::debug!("Abandoned write on {} failed: {}", self.device, e),
                Err(e) => tracing::warn!("Serial writer for {} failed: {}", self.device, e),
                Ok(Ok(())) => {}
            }
        }
    }
}

fn open_blocking(
    device_id: &str,
    settings: &SerialSettings,
) -> Result<Box<dyn serialport::SerialPort>, TransportError> {
    let builder = serialport::new(device_id, settings.baud_rate)
        .timeout(POLL_INTERVAL)
        .data_bits(to_data_bits(settings.data_bits)?)
        .stop_bits(to_stop_bits(settings.stop_bits)?)
        .parity(to_serialport_parity(settings.parity))
        .flow_control(serialport::FlowControl::None);

    let mut port = builder.open().map_err(|e| TransportError::OpenFailed {
        device: device_id.to_string(),
        reason: e.to_string(),
    })?;

    if settings.assert_dtr {
        if let Err(e) = port.write_data_terminal_ready(true) {
            tracing::warn!("Failed to assert DTR on {}: {} (continuing)", device_id, e);
        }
    }

    Ok(port)
}

fn read_blocking(
    port: &SharedPort,
    closing: &AtomicBool,
    max_count: usize,
    timeout: Duration,
) -> Result<Vec<u8>, TransportError> {
    let deadline = Instant::now() + timeout;
    let mut collected = Vec::with_capacity(max_count);
    let mut buf = vec![0u8; max_count];

    while collected.len() < max_count {
        if closing.load(Ordering::Acquire) {
            return Err(TransportError::NotOpen);
        }
        let want = max_count - collected.len();
        // Locked per poll so writes can go out while a read waits.
        let outcome = port.lock().read(&mut buf[..want]);
        match outcome {
            Ok(0) => {}
            Ok(n) => {
                collected.extend_from_slice(&buf[..n]);
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::io(e)),
        }

        // Nothing pending right now: hand back what we have, or keep waiting.
        if !collected.is_empty() {
            break;
        }
        if Instant::now() >= deadline {
            return Err(TransportError::timeout(timeout));
        }
    }

    Ok(collected)
}

fn write_blocking(
    port: &SharedPort,
    closing: &AtomicBool,
    data: &[u8],
    timeout: Duration,
) -> Result<(), TransportError> {
    let deadline = Instant::now() + timeout;
    let mut written = 0;
    let mut port = port.lock();

    while written < data.len() {
        if closing.load(Ordering::Acquire) {
            return Err(TransportError::NotOpen);
        }
        match port.write(&data[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(TransportError::io(e)),
        }
        if written < data.len() && Instant::now() >= deadline {
            return Err(TransportError::timeout(timeout));
        }
    }

    port.flush().map_err(TransportError::io)
}

fn worker_failed(e: tokio::task::JoinError) -> TransportError {
    TransportError::io(format!("serial worker failed: {}", e))
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(
        &mut self,
        device_id: &str,
        settings: &SerialSettings,
    ) -> Result<(), TransportError> {
        self.close().await;

        let id = device_id.to_string();
        let settings_copy = settings.clone();
        let port = tokio::task::spawn_blocking(move || open_blocking(&id, &settings_copy))
            .await
            .map_err(worker_failed)??;

        tracing::debug!("Opened {} at {}", device_id, settings);
        self.attach(port, device_id);
        Ok(())
    }

    async fn close(&mut self) {
        self.closing.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                tracing::warn!("Serial reader for {} failed: {}", self.device, e);
            }
        }
        self.settle_writer().await;

        if self.port.take().is_some() {
            tracing::debug!("Closed {}", self.device);
        }
    }

    async fn load_bytes(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if max_count == 0 {
            return Err(TransportError::io("load of zero bytes requested"));
        }
        let port = self.port()?;

        // A load whose caller went away before it finished is resumed.
        if self.reader.is_none() {
            let closing = self.closing.clone();
            self.reader = Some(tokio::task::spawn_blocking(move || {
                read_blocking(&port, &closing, max_count, timeout)
            }));
        }
        let Some(reader) = self.reader.as_mut() else {
            return Err(TransportError::NotOpen);
        };
        let joined = reader.await;
        self.reader = None;
        joined.map_err(worker_failed)?
    }

    async fn write_string(&mut self, text: &str, timeout: Duration) -> Result<(), TransportError> {
        let port = self.port()?;
        self.settle_writer().await;

        let closing = self.closing.clone();
        let data = text.as_bytes().to_vec();
        let writer = self.writer.insert(tokio::task::spawn_blocking(move || {
            write_blocking(&port, &closing, &data, timeout)
        }));
        let joined = writer.await;
        self.writer = None;
        joined.map_err(worker_failed)?
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_sorting() {
        let mut names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "COM10",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "COM3",
            "/dev/ttyACM10",
        ];
        names.sort_by_key(|n| port_sort_key(n));
        assert_eq!(
            names,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "COM3",
                "COM10",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_invalid_line_settings() {
        assert!(to_data_bits(9).is_err());
        assert!(to_stop_bits(0).is_err());
        assert!(matches!(to_data_bits(7), Ok(serialport::DataBits::Seven)));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_io() {
        let mut transport = SerialTransport::new();
        assert!(!transport.is_open());
        assert_eq!(
            transport.load_bytes(4, Duration::from_millis(10)).await,
            Err(TransportError::NotOpen)
        );
        assert_eq!(
            transport.write_string("?", Duration::from_millis(10)).await,
            Err(TransportError::NotOpen)
        );
        // Closing twice is harmless
        transport.close().await;
        transport.close().await;
    }

    #[cfg(unix)]
    fn pty_transport() -> (serialport::TTYPort, SerialTransport) {
        use serialport::SerialPort as _;

        let (master, mut slave) = serialport::TTYPort::pair().unwrap();
        slave.set_timeout(POLL_INTERVAL).unwrap();
        let mut transport = SerialTransport::new();
        transport.attach(Box::new(slave), "pty");
        (master, transport)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_stops_interrupted_read() {
        let (_master, mut transport) = pty_transport();
        let port = Arc::downgrade(transport.port.as_ref().unwrap());

        let interrupted = tokio::time::timeout(
            Duration::from_millis(50),
            transport.load_bytes(16, Duration::from_secs(2)),
        )
        .await;
        assert!(interrupted.is_err());

        let started = Instant::now();
        transport.close().await;
        assert!(started.elapsed() < Duration::from_millis(500));
        // The OS handle is gone, so the device can be reopened at once
        assert!(port.upgrade().is_none());
        assert!(!transport.is_open());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_interrupted_read_is_resumed() {
        let (mut master, mut transport) = pty_transport();

        let interrupted = tokio::time::timeout(
            Duration::from_millis(50),
            transport.load_bytes(16, Duration::from_secs(2)),
        )
        .await;
        assert!(interrupted.is_err());

        master.write_all(b"ok\n").unwrap();
        let bytes = transport
            .load_bytes(16, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(bytes, b"ok\n");
        transport.close().await;
    }

    #[tokio::test]
    async fn test_open_missing_device_fails() {
        let mut transport = SerialTransport::new();
        let result = transport
            .open("/dev/periphlink-does-not-exist", &SerialSettings::default())
            .await;
        assert!(matches!(result, Err(TransportError::OpenFailed { .. })));
        assert!(!transport.is_open());
    }
}
