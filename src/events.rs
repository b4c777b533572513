// src/events.rs
//
// Typed notifications published by the link manager.
// Consumers (console logger, backend forwarder, status server) each hold a
// broadcast receiver; a slow consumer loses events rather than stalling the link.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::io::serial::SensorReading;

/// Capacity of the event broadcast channel
pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything the link manager reports
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum LinkEvent {
    Connected,
    ConnectionFailed { error: String },
    ConnectionLost,
    ReconnectFailed,
    SensorData(SensorReading),
    DeviceError(String),
    RawMessage(String),
    Log(LogEntry),
    Shutdown,
}

impl LinkEvent {
    /// Event name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            LinkEvent::Connected => "connected",
            LinkEvent::ConnectionFailed { .. } => "connectionFailed",
            LinkEvent::ConnectionLost => "connectionLost",
            LinkEvent::ReconnectFailed => "reconnectFailed",
            LinkEvent::SensorData(_) => "sensorData",
            LinkEvent::DeviceError(_) => "deviceError",
            LinkEvent::RawMessage(_) => "rawMessage",
            LinkEvent::Log(_) => "log",
            LinkEvent::Shutdown => "shutdown",
        }
    }
}

/// Fan-out point for link events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LinkEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }

    /// Publish to every current subscriber. Having none is not an error.
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.tx.send(event);
    }
}

/// Print every event to the console log, one line each, until shutdown.
pub fn spawn_event_logger(
    mut events: broadcast::Receiver<LinkEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    log_event(&event);
                    if event == LinkEvent::Shutdown {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tlog!("[events] Console logger skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &LinkEvent) {
    match event {
        LinkEvent::Connected => tlog!("[events] Device connected"),
        LinkEvent::ConnectionFailed { error } => tlog!("[events] Connection failed: {}", error),
        LinkEvent::ConnectionLost => tlog!("[events] Connection lost, attempting to reconnect"),
        LinkEvent::ReconnectFailed => tlog!("[events] All reconnect attempts failed"),
        LinkEvent::SensorData(r) => tlog!(
            "[events] Reading from {}: {:.1}C {:.1}% co2={} tvoc={}",
            r.device_id,
            r.dht22.temperature,
            r.dht22.humidity,
            r.ccs811.co2,
            r.ccs811.tvoc
        ),
        LinkEvent::DeviceError(text) => tlog!("[events] Device error: {}", text),
        LinkEvent::RawMessage(text) => tlog!("[events] Raw message: {}", text),
        // Already written by the supervisor when it was produced
        LinkEvent::Log(_) => {}
        LinkEvent::Shutdown => tlog!("[events] Graceful shutdown completed"),
    }
}
