// src/io/serial/transport.rs
//
// Serial transport for the sensor node.
// Owns the OS port handle inside a blocking reader thread, pushes received
// chunks to the supervisor and services write requests between reads.
// No retry logic lives here: a failed open or a dead port is reported and
// the supervisor decides what to do.

use async_trait::async_trait;
use serde::Serialize;
use std::io::{Read, Write};
use std::sync::mpsc as std_mpsc;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::utils::{
    to_serialport_data_bits, to_serialport_parity, to_serialport_stop_bits, LineSettings,
};

/// Read timeout for the blocking port. Also bounds how long the reader
/// takes to notice the stop flag.
const READ_TIMEOUT: Duration = Duration::from_millis(50);
/// How long a write waits for the reader thread to report the result.
const TRANSMIT_TIMEOUT: Duration = Duration::from_millis(500);
/// How long close() waits for the reader thread before detaching it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const EVENT_CHANNEL_CAPACITY: usize = 256;
const TRANSMIT_CHANNEL_CAPACITY: usize = 32;

// ============================================================================
// Types
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to open {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("Serial I/O error: {0}")]
    Io(String),
    #[error("Not connected to device")]
    NotConnected,
    #[error("Serial port closed")]
    Closed,
}

/// Notifications pushed by an open transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Raw bytes as read from the port
    Data(Vec<u8>),
    /// Non-fatal or fatal I/O problem; fatal ones are followed by `Closed`
    Error(String),
    /// The port went away (EOF, unplugged, read failure)
    Closed,
}

/// Byte channel to the device.
///
/// `open` resolves once the port is ready and returns the stream of
/// incoming notifications. Implementations must not retry internally.
#[async_trait]
pub trait Transport: Send + 'static {
    async fn open(
        &mut self,
        port: &str,
        baud_rate: u32,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError>;

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Release the port. Safe to call when nothing is open.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Write request handed to the reader thread
struct TransmitRequest {
    data: Vec<u8>,
    result_tx: oneshot::Sender<Result<(), TransportError>>,
}

type TransmitSender = std_mpsc::SyncSender<TransmitRequest>;

/// Everything the reader thread needs to open the port
#[derive(Clone, Debug)]
struct PortConfig {
    port: String,
    baud_rate: u32,
    line: LineSettings,
}

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    /// USB-UART bridge chip when the VID:PID is a known one
    pub bridge: Option<&'static str>,
}

// ============================================================================
// Serial Transport
// ============================================================================

/// `Transport` over a local serial port (serialport crate)
pub struct SerialTransport {
    line: LineSettings,
    stop_flag: Arc<AtomicBool>,
    transmit_tx: Option<TransmitSender>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl SerialTransport {
    pub fn new(line: LineSettings) -> Self {
        Self {
            line,
            stop_flag: Arc::new(AtomicBool::new(true)),
            transmit_tx: None,
            reader: None,
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(
        &mut self,
        port: &str,
        baud_rate: u32,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        // Never leave a previous reader running
        self.close().await?;

        let stop_flag = Arc::new(AtomicBool::new(false));
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (transmit_tx, transmit_rx) = std_mpsc::sync_channel(TRANSMIT_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        let config = PortConfig {
            port: port.to_string(),
            baud_rate,
            line: self.line,
        };
        let flag = stop_flag.clone();
        let handle = tokio::task::spawn_blocking(move || {
            run_port_blocking(config, flag, transmit_rx, event_tx, ready_tx)
        });

        // Registered before awaiting so a caller-side timeout can still stop the thread
        self.stop_flag = stop_flag;
        self.reader = Some(handle);

        match ready_rx.await {
            Ok(Ok(())) => {
                self.transmit_tx = Some(transmit_tx);
                Ok(event_rx)
            }
            Ok(Err(e)) => {
                self.reader = None;
                Err(e)
            }
            Err(_) => {
                self.reader = None;
                Err(TransportError::Closed)
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let tx = self.transmit_tx.as_ref().ok_or(TransportError::NotConnected)?;

        let (result_tx, result_rx) = oneshot::channel();
        tx.try_send(TransmitRequest {
            data: data.to_vec(),
            result_tx,
        })
        .map_err(|e| TransportError::Io(format!("Failed to queue transmit request: {}", e)))?;

        match tokio::time::timeout(TRANSMIT_TIMEOUT, result_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Io(format!(
                "Transmit timed out after {:?}",
                TRANSMIT_TIMEOUT
            ))),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.transmit_tx = None;

        if let Some(handle) = self.reader.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(TransportError::Io(format!("Serial reader task failed: {}", e)))
                }
                Err(_) => {
                    // Still stuck inside the OS open call; it checks the flag when it returns
                    tlog!("[serial] Reader did not stop within {:?}, detaching", CLOSE_TIMEOUT);
                }
            }
        }
        Ok(())
    }
}

/// Blocking open + read loop. Runs on the blocking pool.
/// The stop flag is checked right after open and on every loop iteration.
fn run_port_blocking(
    config: PortConfig,
    stop_flag: Arc<AtomicBool>,
    transmit_rx: std_mpsc::Receiver<TransmitRequest>,
    event_tx: mpsc::Sender<TransportEvent>,
    ready_tx: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut port = match serialport::new(&config.port, config.baud_rate)
        .data_bits(to_serialport_data_bits(config.line.data_bits))
        .stop_bits(to_serialport_stop_bits(config.line.stop_bits))
        .parity(to_serialport_parity(config.line.parity))
        .timeout(READ_TIMEOUT)
        .open()
    {
        Ok(p) => p,
        Err(e) => {
            let _ = ready_tx.send(Err(TransportError::Open {
                port: config.port.clone(),
                reason: e.to_string(),
            }));
            return;
        }
    };

    // The opener gave up while the OS call was pending; the port drops here
    if stop_flag.load(Ordering::SeqCst) || ready_tx.send(Ok(())).is_err() {
        return;
    }

    tlog!(
        "[serial] Opened {} at {} baud ({})",
        config.port,
        config.baud_rate,
        config.line.describe()
    );

    let mut buf = [0u8; 256];
    while !stop_flag.load(Ordering::SeqCst) {
        // Process pending transmit requests (non-blocking)
        while let Ok(req) = transmit_rx.try_recv() {
            let result = port
                .write_all(&req.data)
                .and_then(|_| port.flush())
                .map_err(|e| TransportError::Io(format!("Serial write error: {}", e)));
            let _ = req.result_tx.send(result);
        }

        match port.read(&mut buf) {
            Ok(n) if n > 0 => {
                if event_tx
                    .blocking_send(TransportEvent::Data(buf[..n].to_vec()))
                    .is_err()
                {
                    // Nobody listening any more
                    break;
                }
            }
            Ok(_) => {
                // EOF - port closed/disconnected
                let _ = event_tx.blocking_send(TransportEvent::Closed);
                return;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Timeout is expected for serial reads
            }
            Err(e) => {
                let _ = event_tx.blocking_send(TransportEvent::Error(format!("Read error: {}", e)));
                let _ = event_tx.blocking_send(TransportEvent::Closed);
                return;
            }
        }
    }

    tlog!("[serial] Closed {}", config.port);
}

// ============================================================================
// Port Enumeration
// ============================================================================

/// USB-UART bridges found on ESP8266 boards, by VID:PID
const KNOWN_BRIDGES: &[(u16, u16, &str)] = &[
    (0x1a86, 0x7523, "CH340"),
    (0x1a86, 0x55d4, "CH9102"),
    (0x10c4, 0xea60, "CP210x"),
    (0x0403, 0x6001, "FT232R"),
    (0x0403, 0x6015, "FT231X"),
];

/// Bridge chip name for a USB VID:PID, if it is one a sensor node uses
pub fn known_bridge(vid: u16, pid: u16) -> Option<&'static str> {
    KNOWN_BRIDGES
        .iter()
        .find(|(v, p, _)| *v == vid && *p == pid)
        .map(|(_, _, name)| *name)
}

/// List serial ports a sensor node could be on. Ports behind a known
/// bridge come first, then the rest by name.
///
/// macOS `/dev/tty.*` callout twins are skipped since they block on open
/// waiting for carrier detect.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, String> {
    let ports =
        serialport::available_ports().map_err(|e| format!("Failed to enumerate ports: {}", e))?;

    let mut listed: Vec<SerialPortInfo> = ports
        .into_iter()
        .filter(|p| !(cfg!(target_os = "macos") && p.port_name.starts_with("/dev/tty.")))
        .map(describe_port)
        .collect();
    sort_node_candidates(&mut listed);
    Ok(listed)
}

fn describe_port(port: serialport::SerialPortInfo) -> SerialPortInfo {
    let mut info = SerialPortInfo {
        port_name: port.port_name,
        port_type: String::new(),
        manufacturer: None,
        product: None,
        serial_number: None,
        vid: None,
        pid: None,
        bridge: None,
    };
    info.port_type = match port.port_type {
        serialport::SerialPortType::UsbPort(usb) => {
            info.bridge = known_bridge(usb.vid, usb.pid);
            info.vid = Some(usb.vid);
            info.pid = Some(usb.pid);
            info.manufacturer = usb.manufacturer;
            info.product = usb.product;
            info.serial_number = usb.serial_number;
            "USB"
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth",
        serialport::SerialPortType::PciPort => "PCI",
        serialport::SerialPortType::Unknown => "Unknown",
    }
    .to_string();
    info
}

fn sort_node_candidates(ports: &mut [SerialPortInfo]) {
    ports.sort_by(|a, b| {
        b.bridge
            .is_some()
            .cmp(&a.bridge.is_some())
            .then_with(|| a.port_name.cmp(&b.port_name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let mut transport = SerialTransport::new(LineSettings::default());
        let result = transport
            .open("/dev/sensorlink-does-not-exist", 115200)
            .await;
        assert!(matches!(result, Err(TransportError::Open { .. })));
    }

    #[tokio::test]
    async fn test_write_without_open_is_not_connected() {
        let mut transport = SerialTransport::new(LineSettings::default());
        assert_eq!(
            transport.write(b"PING\n").await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut transport = SerialTransport::new(LineSettings::default());
        assert!(transport.close().await.is_ok());
        assert!(transport.close().await.is_ok());
    }

    #[test]
    fn test_error_messages() {
        let err = TransportError::Open {
            port: "/dev/ttyUSB0".to_string(),
            reason: "No such file or directory".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to open /dev/ttyUSB0: No such file or directory"
        );
    }

    fn usb_port(name: &str, vid: u16, pid: u16) -> serialport::SerialPortInfo {
        serialport::SerialPortInfo {
            port_name: name.to_string(),
            port_type: serialport::SerialPortType::UsbPort(serialport::UsbPortInfo {
                vid,
                pid,
                serial_number: None,
                manufacturer: Some("wch.cn".to_string()),
                product: None,
            }),
        }
    }

    #[test]
    fn test_known_bridges() {
        assert_eq!(known_bridge(0x1a86, 0x7523), Some("CH340"));
        assert_eq!(known_bridge(0x10c4, 0xea60), Some("CP210x"));
        assert_eq!(known_bridge(0x2341, 0x0043), None);
    }

    #[test]
    fn test_describe_usb_port_tags_bridge() {
        let info = describe_port(usb_port("/dev/ttyUSB0", 0x1a86, 0x7523));
        assert_eq!(info.port_type, "USB");
        assert_eq!(info.bridge, Some("CH340"));
        assert_eq!((info.vid, info.pid), (Some(0x1a86), Some(0x7523)));
        assert_eq!(info.manufacturer.as_deref(), Some("wch.cn"));

        let info = describe_port(serialport::SerialPortInfo {
            port_name: "/dev/ttyS0".to_string(),
            port_type: serialport::SerialPortType::PciPort,
        });
        assert_eq!(info.port_type, "PCI");
        assert_eq!(info.bridge, None);
        assert_eq!(info.vid, None);
    }

    #[test]
    fn test_bridged_ports_listed_first() {
        let mut ports = vec![
            describe_port(serialport::SerialPortInfo {
                port_name: "/dev/ttyS0".to_string(),
                port_type: serialport::SerialPortType::Unknown,
            }),
            describe_port(usb_port("/dev/ttyACM0", 0x2341, 0x0043)),
            describe_port(usb_port("/dev/ttyUSB1", 0x10c4, 0xea60)),
            describe_port(usb_port("/dev/ttyUSB0", 0x1a86, 0x7523)),
        ];
        sort_node_candidates(&mut ports);
        let names: Vec<&str> = ports.iter().map(|p| p.port_name.as_str()).collect();
        assert_eq!(
            names,
            ["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyACM0", "/dev/ttyS0"]
        );
    }
}
