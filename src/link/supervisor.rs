// src/link/supervisor.rs
//
// Link supervisor.
// A single task owns the transport, the framer and all timers; callers talk
// to it through `LinkManager` (command channel + oneshot replies), so every
// state transition is serialized. Heartbeat, reconnect timer, transport
// events and commands are multiplexed with one `select!`.

use chrono::{DateTime, Utc};
use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

use super::{ConnectionState, LinkError, LinkState};
use crate::events::{EventBus, LinkEvent, LogEntry, LogLevel};
use crate::io::serial::{
    classify, BufferStats, MessageFramer, ParsedMessage, SerialTransport, Transport,
    TransportEvent,
};
use crate::settings::LinkSettings;

const COMMAND_CHANNEL_CAPACITY: usize = 32;

enum Command {
    CheckConnection(oneshot::Sender<bool>),
    ForceReconnect(oneshot::Sender<bool>),
    Send(Vec<u8>, oneshot::Sender<Result<(), LinkError>>),
    ClearBuffer(oneshot::Sender<()>),
    BufferStats(oneshot::Sender<BufferStats>),
    Shutdown(oneshot::Sender<()>),
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to a running link supervisor.
#[derive(Clone)]
pub struct LinkManager {
    commands: mpsc::Sender<Command>,
    events: EventBus,
    status: watch::Receiver<ConnectionState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl LinkManager {
    /// Start a supervisor over `transport`. Must be called inside a tokio runtime.
    pub fn spawn<T: Transport>(settings: LinkSettings, transport: T) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionState::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = EventBus::new();

        let actor = LinkActor::new(settings, transport, events.clone(), status_tx, shutdown_rx);
        tokio::spawn(actor.run(cmd_rx));

        Self {
            commands: cmd_tx,
            events,
            status: status_rx,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    /// Supervisor over the local serial port named in `settings`.
    pub fn serial(settings: LinkSettings) -> Self {
        let transport = SerialTransport::new(settings.line);
        Self::spawn(settings, transport)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    pub fn status(&self) -> ConnectionState {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.status.borrow().reconnect_attempts
    }

    pub fn last_seen_at(&self) -> Option<DateTime<Utc>> {
        self.status.borrow().last_seen_at
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Connect unless already connected. Returns whether the link is up.
    /// A failure here does not start the reconnect sequence.
    pub async fn check_connection(&self) -> bool {
        if self.is_shutdown_requested() {
            return false;
        }
        self.request(Command::CheckConnection).await.unwrap_or(false)
    }

    /// Ensure a connection, then keep the link running for `duration`.
    /// Returns early (false) when shutdown is requested meanwhile.
    pub async fn read_for(&self, duration: Duration) -> bool {
        if !self.check_connection().await {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = wait_for_shutdown(self.shutdown_tx.subscribe()) => false,
        }
    }

    /// Reset the retry budget, drop the current port and connect once.
    /// Works from any state except shutdown, including after the budget ran out.
    pub async fn force_reconnect(&self) -> bool {
        if self.is_shutdown_requested() {
            return false;
        }
        self.request(Command::ForceReconnect).await.unwrap_or(false)
    }

    /// Write one newline-terminated command line to the device.
    pub async fn send_command(&self, command: &str) -> Result<(), LinkError> {
        let mut data = command.as_bytes().to_vec();
        data.push(b'\n');
        self.request(|reply| Command::Send(data, reply))
            .await
            .unwrap_or(Err(LinkError::ShutDown))
    }

    /// Drop any partially assembled frame.
    pub async fn clear_buffer(&self) {
        let _ = self.request(Command::ClearBuffer).await;
    }

    pub async fn buffer_stats(&self) -> Result<BufferStats, LinkError> {
        self.request(Command::BufferStats)
            .await
            .ok_or(LinkError::ShutDown)
    }

    /// Stop everything and release the port. Idempotent; only the first
    /// call produces a `shutdown` event.
    pub async fn shutdown(&self) {
        // Raised first so an in-flight connect attempt is abandoned
        self.shutdown_tx.send_replace(true);
        let _ = self.request(Command::Shutdown).await;
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Option<R> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands.send(make(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    // A dropped sender also ends the wait
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn next_transport_event(rx: &mut Option<mpsc::Receiver<TransportEvent>>) -> TransportEvent {
    match rx {
        Some(rx) => rx.recv().await.unwrap_or(TransportEvent::Closed),
        None => pending().await,
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

// ============================================================================
// Actor
// ============================================================================

struct LinkActor<T: Transport> {
    settings: LinkSettings,
    transport: T,
    framer: MessageFramer,
    events: EventBus,
    status_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    state: LinkState,
    reconnect_attempts: u32,
    last_seen: Option<Instant>,
    last_seen_at: Option<DateTime<Utc>>,
    transport_rx: Option<mpsc::Receiver<TransportEvent>>,
    heartbeat: Option<Interval>,
    /// At most one pending reconnect
    reconnect_timer: Option<Pin<Box<Sleep>>>,
}

impl<T: Transport> LinkActor<T> {
    fn new(
        settings: LinkSettings,
        transport: T,
        events: EventBus,
        status_tx: watch::Sender<ConnectionState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let period = settings.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            framer: MessageFramer::new(settings.buffer_cap),
            settings,
            transport,
            events,
            status_tx,
            shutdown_rx,
            state: LinkState::Disconnected,
            reconnect_attempts: 0,
            last_seen: None,
            last_seen_at: None,
            transport_rx: None,
            heartbeat: Some(heartbeat),
            reconnect_timer: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                biased;

                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).await {
                            break;
                        }
                    }
                    None => {
                        // Every handle is gone
                        self.shutdown().await;
                        break;
                    }
                },
                event = next_transport_event(&mut self.transport_rx) => {
                    self.handle_transport_event(event);
                }
                _ = next_heartbeat(&mut self.heartbeat) => {
                    self.check_heartbeat();
                }
                _ = reconnect_due(&mut self.reconnect_timer) => {
                    self.handle_reconnect_timer().await;
                }
            }
        }
    }

    /// Returns true when the actor should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::CheckConnection(reply) => {
                let connected = self.check_connection().await;
                let _ = reply.send(connected);
            }
            Command::ForceReconnect(reply) => {
                let connected = self.force_reconnect().await;
                let _ = reply.send(connected);
            }
            Command::Send(data, reply) => {
                let result = self.send(&data).await;
                let _ = reply.send(result);
            }
            Command::ClearBuffer(reply) => {
                self.framer.clear();
                self.log(LogLevel::Debug, "Message buffer cleared");
                self.publish_status();
                let _ = reply.send(());
            }
            Command::BufferStats(reply) => {
                let _ = reply.send(self.framer.stats());
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    async fn check_connection(&mut self) -> bool {
        if self.state == LinkState::Connected {
            return true;
        }
        if self.is_shutting_down() {
            return false;
        }
        let connected = self.connect().await;
        if connected {
            self.reconnect_timer = None;
        }
        connected
    }

    async fn force_reconnect(&mut self) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        self.log(LogLevel::Info, "Manual reconnect requested");
        self.reconnect_timer = None;
        self.reconnect_attempts = 0;
        self.drop_link().await;
        self.connect().await
    }

    /// One connect attempt, bounded by the connect timeout and abandoned on shutdown.
    async fn connect(&mut self) -> bool {
        self.set_state(LinkState::Connecting);
        let port = self.settings.port.clone();
        let baud_rate = self.settings.baud_rate;
        let budget = self.settings.connect_timeout();
        self.log(
            LogLevel::Info,
            format!("Connecting to {} at {} baud", port, baud_rate),
        );

        let shutdown_rx = self.shutdown_rx.clone();
        let outcome = tokio::select! {
            result = tokio::time::timeout(budget, self.transport.open(&port, baud_rate)) => Some(result),
            _ = wait_for_shutdown(shutdown_rx) => None,
        };

        match outcome {
            None => {
                self.close_transport().await;
                self.set_state(LinkState::Disconnected);
                self.log(LogLevel::Info, "Connect attempt abandoned for shutdown");
                false
            }
            Some(Ok(Ok(rx))) => {
                if self.is_shutting_down() {
                    drop(rx);
                    self.close_transport().await;
                    self.set_state(LinkState::Disconnected);
                    return false;
                }
                self.transport_rx = Some(rx);
                self.reconnect_attempts = 0;
                self.framer.clear();
                self.mark_seen();
                if let Some(heartbeat) = self.heartbeat.as_mut() {
                    heartbeat.reset();
                }
                self.set_state(LinkState::Connected);
                self.log(LogLevel::Info, format!("Connected to {}", port));
                self.events.emit(LinkEvent::Connected);
                true
            }
            Some(Ok(Err(e))) => self.connect_failed(LinkError::from(e)),
            Some(Err(_elapsed)) => {
                // The transport may still be opening in the background
                self.close_transport().await;
                self.connect_failed(LinkError::ConnectTimeout(budget))
            }
        }
    }

    fn connect_failed(&mut self, error: LinkError) -> bool {
        self.set_state(LinkState::Disconnected);
        self.log(LogLevel::Error, format!("Connection failed: {}", error));
        self.events.emit(LinkEvent::ConnectionFailed {
            error: error.to_string(),
        });
        false
    }

    /// Liveness check, only meaningful while connected.
    fn check_heartbeat(&mut self) {
        if self.state != LinkState::Connected {
            return;
        }
        let silent_for = self.last_seen.map(|t| t.elapsed()).unwrap_or_default();
        if silent_for > self.settings.connection_timeout() {
            self.log(
                LogLevel::Warn,
                format!(
                    "No data for {} ms, connection considered lost",
                    silent_for.as_millis()
                ),
            );
            self.declare_lost();
        }
    }

    fn declare_lost(&mut self) {
        self.transport_rx = None;
        self.set_state(LinkState::Disconnected);
        self.events.emit(LinkEvent::ConnectionLost);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.is_shutting_down() || self.reconnect_timer.is_some() {
            return;
        }

        let max = self.settings.max_reconnect_attempts;
        if self.reconnect_attempts >= max {
            self.set_state(LinkState::Abandoned);
            self.log(
                LogLevel::Error,
                LinkError::RetryBudgetExhausted(max).to_string(),
            );
            self.events.emit(LinkEvent::ReconnectFailed);
            return;
        }

        self.reconnect_attempts += 1;
        let delay = self.settings.reconnect_delay();
        self.log(
            LogLevel::Info,
            format!(
                "Reconnect attempt {}/{} in {} ms",
                self.reconnect_attempts,
                max,
                delay.as_millis()
            ),
        );
        self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
        self.publish_status();
    }

    async fn handle_reconnect_timer(&mut self) {
        self.reconnect_timer = None;
        if self.is_shutting_down() {
            return;
        }
        self.drop_link().await;
        if !self.connect().await {
            self.schedule_reconnect();
        }
    }

    async fn shutdown(&mut self) {
        if self.state == LinkState::ShuttingDown {
            return;
        }
        self.reconnect_timer = None;
        self.heartbeat = None;
        self.transport_rx = None;
        self.close_transport().await;
        self.framer.clear();
        self.set_state(LinkState::ShuttingDown);
        self.log(LogLevel::Info, "Link manager shut down");
        self.events.emit(LinkEvent::Shutdown);
    }

    async fn drop_link(&mut self) {
        self.transport_rx = None;
        self.close_transport().await;
    }

    async fn close_transport(&mut self) {
        if let Err(e) = self.transport.close().await {
            self.log(LogLevel::Warn, format!("Failed to close port: {}", e));
        }
    }

    // ------------------------------------------------------------------------
    // Data path
    // ------------------------------------------------------------------------

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Data(bytes) => self.ingest(&bytes),
            TransportEvent::Error(e) => {
                self.log(LogLevel::Error, format!("Serial port error: {}", e));
            }
            TransportEvent::Closed => {
                self.transport_rx = None;
                if self.state == LinkState::Connected {
                    self.log(LogLevel::Warn, "Serial port closed");
                    self.declare_lost();
                }
            }
        }
    }

    fn ingest(&mut self, bytes: &[u8]) {
        let result = self.framer.feed(bytes);

        if let Some(discarded) = result.overflow {
            let err = LinkError::ProtocolOverflow {
                cap: self.settings.buffer_cap,
                discarded,
            };
            self.log(LogLevel::Warn, err.to_string());
        }

        for frame in result.frames {
            let classified = classify(&frame);
            if let Some(reason) = classified.decode_error {
                self.log(LogLevel::Debug, LinkError::Decode(reason).to_string());
            }
            self.mark_seen();

            let event = match classified.message {
                ParsedMessage::Reading(reading) => LinkEvent::SensorData(reading),
                ParsedMessage::DeviceError(text) => LinkEvent::DeviceError(text),
                ParsedMessage::Raw(text) => LinkEvent::RawMessage(text),
            };
            self.events.emit(event);
        }

        self.publish_status();
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), LinkError> {
        if self.state != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        match self.transport.write(data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.log(LogLevel::Error, format!("Failed to send command: {}", e));
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Status + logging
    // ------------------------------------------------------------------------

    fn is_shutting_down(&self) -> bool {
        self.state == LinkState::ShuttingDown || *self.shutdown_rx.borrow()
    }

    fn mark_seen(&mut self) {
        self.last_seen = Some(Instant::now());
        self.last_seen_at = Some(Utc::now());
    }

    fn set_state(&mut self, state: LinkState) {
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(ConnectionState {
            state: self.state,
            is_connected: self.state == LinkState::Connected,
            reconnect_attempts: self.reconnect_attempts,
            last_seen_at: self.last_seen_at,
            buffered_bytes: self.framer.buffered_len(),
        });
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        tlog!("[link] {}", message);
        self.events.emit(LinkEvent::Log(LogEntry {
            level,
            message,
            timestamp: Utc::now(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::serial::TransportError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const READING: &str = r#"{"device_id":"node-1","timestamp":1700000000000,"uptime":42,"dht22":{"temperature":21.5,"humidity":40.2,"status":"ok"},"ccs811":{"co2":450,"tvoc":12,"status":"ok"},"system":{"free_heap":120000,"wifi_connected":true,"sensors_ok":true}}"#;

    #[derive(Clone, Copy)]
    enum OpenBehavior {
        Succeed,
        Fail,
        Hang,
    }

    #[derive(Default)]
    struct MockState {
        script: VecDeque<OpenBehavior>,
        opens: usize,
        closes: usize,
        written: Vec<Vec<u8>>,
        device_tx: Option<mpsc::Sender<TransportEvent>>,
    }

    /// Transport double; opens succeed unless scripted otherwise.
    #[derive(Clone, Default)]
    struct MockTransport {
        state: Arc<Mutex<MockState>>,
    }

    impl MockTransport {
        fn script(&self, steps: &[OpenBehavior]) {
            self.state.lock().unwrap().script.extend(steps.iter().copied());
        }

        fn device_sends(&self, data: &[u8]) {
            let tx = self.state.lock().unwrap().device_tx.clone();
            tx.expect("port not open")
                .try_send(TransportEvent::Data(data.to_vec()))
                .unwrap();
        }

        fn device_unplugged(&self) {
            let tx = self.state.lock().unwrap().device_tx.take();
            tx.expect("port not open")
                .try_send(TransportEvent::Closed)
                .unwrap();
        }

        fn opens(&self) -> usize {
            self.state.lock().unwrap().opens
        }

        fn closes(&self) -> usize {
            self.state.lock().unwrap().closes
        }

        fn written(&self) -> Vec<Vec<u8>> {
            self.state.lock().unwrap().written.clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn open(
            &mut self,
            port: &str,
            _baud_rate: u32,
        ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
            let behavior = {
                let mut state = self.state.lock().unwrap();
                state.opens += 1;
                state.script.pop_front().unwrap_or(OpenBehavior::Succeed)
            };
            match behavior {
                OpenBehavior::Succeed => {
                    let (tx, rx) = mpsc::channel(64);
                    self.state.lock().unwrap().device_tx = Some(tx);
                    Ok(rx)
                }
                OpenBehavior::Fail => Err(TransportError::Open {
                    port: port.to_string(),
                    reason: "No such file or directory".to_string(),
                }),
                OpenBehavior::Hang => pending().await,
            }
        }

        async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.state.lock().unwrap().written.push(data.to_vec());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.closes += 1;
            state.device_tx = None;
            Ok(())
        }
    }

    fn start() -> (LinkManager, MockTransport, broadcast::Receiver<LinkEvent>) {
        let mock = MockTransport::default();
        let manager = LinkManager::spawn(LinkSettings::default(), mock.clone());
        let events = manager.subscribe();
        (manager, mock, events)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    /// Everything received so far, without log entries
    fn drain(rx: &mut broadcast::Receiver<LinkEvent>) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if !matches!(event, LinkEvent::Log(_)) {
                events.push(event);
            }
        }
        events
    }

    fn count(events: &[LinkEvent], name: &str) -> usize {
        events.iter().filter(|e| e.name() == name).count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_receive_telemetry() {
        let (manager, mock, mut events) = start();

        assert!(manager.check_connection().await);
        assert!(manager.is_connected());
        assert!(manager.last_seen_at().is_some());

        mock.device_sends(format!("{}\n", READING).as_bytes());
        settle().await;

        let received = drain(&mut events);
        assert_eq!(received[0], LinkEvent::Connected);
        match &received[1] {
            LinkEvent::SensorData(reading) => {
                assert_eq!(reading.device_id, "node-1");
                assert_eq!(reading.dht22.temperature, 21.5);
                assert_eq!(reading.ccs811.co2, 450.0);
            }
            other => panic!("expected sensorData, got {:?}", other),
        }
        assert_eq!(received.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_connection_when_connected_does_not_reopen() {
        let (manager, mock, _events) = start();
        assert!(manager.check_connection().await);
        assert!(manager.check_connection().await);
        assert_eq!(mock.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_are_emitted_in_order() {
        let (manager, mock, mut events) = start();
        assert!(manager.check_connection().await);

        // Split across chunks at awkward points
        let stream = format!("boot ok\nwifi up\n{}\nDEVICE ERROR: sensor offline\n", READING);
        let (head, tail) = stream.as_bytes().split_at(30);
        mock.device_sends(head);
        mock.device_sends(tail);
        settle().await;

        let received = drain(&mut events);
        let names: Vec<&str> = received.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            ["connected", "rawMessage", "rawMessage", "sensorData", "deviceError"]
        );
        assert_eq!(received[1], LinkEvent::RawMessage("boot ok".to_string()));
        assert_eq!(
            received[4],
            LinkEvent::DeviceError("DEVICE ERROR: sensor offline".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_fires_connection_lost_once() {
        let (manager, mock, mut events) = start();
        assert!(manager.check_connection().await);

        // Silent since t=0; loss is declared on the first tick past 10 s
        tokio::time::sleep(Duration::from_millis(12_000)).await;

        let received = drain(&mut events);
        assert_eq!(count(&received, "connectionLost"), 1);
        assert!(!manager.is_connected());
        assert_eq!(manager.reconnect_attempts(), 1);
        // Reconnect delay not elapsed yet
        assert_eq!(mock.opens(), 1);

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        let received = drain(&mut events);
        assert_eq!(count(&received, "connected"), 1);
        assert!(manager.is_connected());
        assert_eq!(manager.reconnect_attempts(), 0);
        assert_eq!(mock.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_before_deadline_keeps_link_alive() {
        let (manager, mock, mut events) = start();
        assert!(manager.check_connection().await);

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        mock.device_sends(b"ping\n");
        tokio::time::sleep(Duration::from_millis(9_000)).await;

        let received = drain(&mut events);
        assert_eq!(count(&received, "connectionLost"), 0);
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_brace_in_text_keeps_telemetry_flowing() {
        let (manager, mock, mut events) = start();
        assert!(manager.check_connection().await);

        mock.device_sends(b"ccs811 init {retry 2\nDEVICE ERROR: sensor offline\n");
        for _ in 0..15 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            mock.device_sends(format!("{}\n", READING).as_bytes());
        }
        settle().await;

        let received = drain(&mut events);
        assert_eq!(count(&received, "connectionLost"), 0);
        assert_eq!(count(&received, "sensorData"), 15);
        assert_eq!(
            received[1],
            LinkEvent::RawMessage("ccs811 init {retry 2".to_string())
        );
        assert_eq!(
            received[2],
            LinkEvent::DeviceError("DEVICE ERROR: sensor offline".to_string())
        );
        assert!(manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhaustion_and_manual_recovery() {
        let (manager, mock, mut events) = start();
        mock.script(&[OpenBehavior::Succeed]);
        mock.script(&[OpenBehavior::Fail; 5]);

        assert!(manager.check_connection().await);
        mock.device_unplugged();
        tokio::time::sleep(Duration::from_secs(60)).await;

        let received = drain(&mut events);
        assert_eq!(count(&received, "connectionLost"), 1);
        assert_eq!(count(&received, "connectionFailed"), 5);
        assert_eq!(count(&received, "reconnectFailed"), 1);
        assert_eq!(mock.opens(), 6);
        assert_eq!(manager.status().state, LinkState::Abandoned);
        assert_eq!(manager.reconnect_attempts(), 5);

        // Nothing further is scheduled
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(mock.opens(), 6);
        assert!(drain(&mut events).is_empty());

        assert!(manager.force_reconnect().await);
        assert_eq!(manager.reconnect_attempts(), 0);
        assert_eq!(manager.status().state, LinkState::Connected);
        assert_eq!(mock.opens(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_failure_does_not_reconnect() {
        let (manager, mock, mut events) = start();
        mock.script(&[OpenBehavior::Fail]);

        assert!(!manager.check_connection().await);
        tokio::time::sleep(Duration::from_secs(30)).await;

        let received = drain(&mut events);
        assert_eq!(count(&received, "connectionFailed"), 1);
        assert_eq!(mock.opens(), 1);
        assert_eq!(manager.status().state, LinkState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_on_hanging_open() {
        let (manager, mock, mut events) = start();
        mock.script(&[OpenBehavior::Hang]);

        assert!(!manager.check_connection().await);

        let received = drain(&mut events);
        match &received[..] {
            [LinkEvent::ConnectionFailed { error }] => {
                assert!(error.contains("did not become ready"), "{}", error)
            }
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(mock.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let (manager, mock, mut events) = start();
        assert!(manager.check_connection().await);

        manager.shutdown().await;
        manager.shutdown().await;

        let received = drain(&mut events);
        assert_eq!(count(&received, "shutdown"), 1);
        assert!(mock.closes() >= 1);
        assert!(!manager.check_connection().await);
        assert_eq!(mock.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_reconnect() {
        let (manager, mock, mut events) = start();
        assert!(manager.check_connection().await);
        mock.device_unplugged();
        settle().await;
        assert_eq!(manager.reconnect_attempts(), 1);

        manager.shutdown().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let received = drain(&mut events);
        assert_eq!(count(&received, "connectionLost"), 1);
        assert_eq!(count(&received, "shutdown"), 1);
        assert_eq!(count(&received, "connected"), 1);
        assert_eq!(mock.opens(), 1);
        assert_eq!(manager.status().state, LinkState::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_connect_in_flight() {
        let (manager, mock, mut events) = start();
        mock.script(&[OpenBehavior::Hang]);

        let checker = manager.clone();
        let attempt = tokio::spawn(async move { checker.check_connection().await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        manager.shutdown().await;
        assert!(!attempt.await.unwrap());

        let received = drain(&mut events);
        assert_eq!(count(&received, "connectionFailed"), 0);
        assert_eq!(count(&received, "shutdown"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_for_returns_early_on_shutdown() {
        let (manager, _mock, _events) = start();

        let reader = manager.clone();
        let session = tokio::spawn(async move { reader.read_for(Duration::from_secs(600)).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        manager.shutdown().await;

        assert!(!session.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_command() {
        let (manager, mock, _events) = start();
        assert_eq!(
            manager.send_command("PING").await,
            Err(LinkError::NotConnected)
        );

        assert!(manager.check_connection().await);
        manager.send_command("PING").await.unwrap();
        assert_eq!(mock.written(), vec![b"PING\n".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_is_reported_and_buffer_recovers() {
        let (manager, mock, mut events) = start();
        assert!(manager.check_connection().await);

        mock.device_sends(&vec![b'a'; 10_001]);
        settle().await;

        let mut warned = false;
        let mut messages = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                LinkEvent::Log(entry) if entry.level == LogLevel::Warn => {
                    warned |= entry.message.contains("exceeded 10000 bytes");
                }
                LinkEvent::RawMessage(_) | LinkEvent::SensorData(_) => messages += 1,
                _ => {}
            }
        }
        assert!(warned);
        assert_eq!(messages, 0);

        let stats = manager.buffer_stats().await.unwrap();
        assert_eq!(stats.overflows, 1);
        assert_eq!(stats.buffered_bytes, 0);

        mock.device_sends(b"back\n");
        settle().await;
        assert_eq!(
            drain(&mut events),
            vec![LinkEvent::RawMessage("back".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_buffer_drops_partial_frame() {
        let (manager, mock, mut events) = start();
        assert!(manager.check_connection().await);

        mock.device_sends(b"{\"device_id\":");
        settle().await;
        assert_eq!(manager.buffer_stats().await.unwrap().buffered_bytes, 13);

        manager.clear_buffer().await;
        assert_eq!(manager.buffer_stats().await.unwrap().buffered_bytes, 0);

        mock.device_sends(b"hello\n");
        settle().await;
        let received = drain(&mut events);
        assert_eq!(received.last(), Some(&LinkEvent::RawMessage("hello".to_string())));
    }
}
