//! Bluetooth manager for the exercise bike
//! This module provides the main interface for bluetooth operations: the
//! connection state machine and the handle callers drive it through.

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ConnectivityConfig;
use crate::core::bluetooth::backend::BleBackend;
use crate::core::bluetooth::connection::GattSession;
use crate::core::bluetooth::constants::REQUEST_QUEUE_CAPACITY;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::types::{
    ConnectionState, ConnectionStatus, ConnectivityEvent, DiscoveredDevice,
};
use crate::core::frame::{
    ControlCommand, DecodeOutcome, TelemetryReading, clamp_resistance, decode_telemetry,
};
use crate::error::{ConnectivityError, Result};

/// Receiving end of the manager's event stream
pub type EventReceiver = mpsc::UnboundedReceiver<ConnectivityEvent>;

/// Reports from background tasks, tagged with the scan or session they
/// belong to so that late arrivals from a torn-down session are dropped.
#[derive(Debug)]
pub enum Signal {
    DeviceFound { scan: u64, device: DiscoveredDevice },
    ScanTimedOut { scan: u64 },
    ScanFailed { scan: u64, message: String },
    Frame { session: u64, data: Vec<u8> },
    LinkLost { session: u64 },
}

enum Request {
    StartScanning(oneshot::Sender<Result<()>>),
    StopScanning(oneshot::Sender<()>),
    Connect {
        device_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect(oneshot::Sender<()>),
    SetResistanceLevel {
        level: i32,
        reply: oneshot::Sender<Result<u8>>,
    },
    CheckConnectionStatus(oneshot::Sender<ConnectionStatus>),
    GetWorkoutState(oneshot::Sender<Option<TelemetryReading>>),
    Shutdown(oneshot::Sender<()>),
}

/// Clonable handle to a running [`BluetoothManager`]
#[derive(Clone)]
pub struct BluetoothHandle {
    tx: mpsc::Sender<Request>,
}

impl BluetoothHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| ConnectivityError::ManagerStopped)?;
        response.await.map_err(|_| ConnectivityError::ManagerStopped)
    }

    /// Starts discovering bikes. Only valid while idle.
    pub async fn start_scanning(&self) -> Result<()> {
        self.request(Request::StartScanning).await?
    }

    pub async fn stop_scanning(&self) -> Result<()> {
        self.request(Request::StopScanning).await
    }

    /// Connects to a device discovered in the current scan session.
    pub async fn connect(&self, device_id: impl Into<String>) -> Result<()> {
        let device_id = device_id.into();
        self.request(|reply| Request::Connect { device_id, reply })
            .await?
    }

    /// Closes the current session. A no-op when nothing is connected.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Request::Disconnect).await
    }

    /// Sends a resistance change and returns the level actually applied.
    pub async fn set_resistance_level(&self, level: i32) -> Result<u8> {
        self.request(|reply| Request::SetResistanceLevel { level, reply })
            .await?
    }

    pub async fn check_connection_status(&self) -> Result<ConnectionStatus> {
        self.request(Request::CheckConnectionStatus).await
    }

    /// Last decoded reading of the current session, if any.
    pub async fn get_workout_state(&self) -> Result<Option<TelemetryReading>> {
        self.request(Request::GetWorkoutState).await
    }

    /// Tears everything down and stops the manager task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Request::Shutdown).await
    }
}

/// Manages Bluetooth operations
///
/// Owns the scanner and at most one GATT session. All state changes happen
/// on the task running [`BluetoothManager::run`].
pub struct BluetoothManager<B: BleBackend> {
    backend: B,
    config: ConnectivityConfig,
    state: ConnectionState,
    scanner: BluetoothScanner<B>,
    session: Option<GattSession<B>>,
    session_generation: u64,
    connected_device: Option<DiscoveredDevice>,
    last_reading: Option<TelemetryReading>,
    requests: mpsc::Receiver<Request>,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals_rx: mpsc::UnboundedReceiver<Signal>,
    events: mpsc::UnboundedSender<ConnectivityEvent>,
}

impl<B: BleBackend> BluetoothManager<B> {
    /// Creates a new BluetoothManager together with its handle and event stream
    pub fn new(backend: B, config: ConnectivityConfig) -> (Self, BluetoothHandle, EventReceiver) {
        let (tx, requests) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let scanner = BluetoothScanner::new(
            backend.clone(),
            config.name_patterns.clone(),
            config.scan_timeout(),
        );

        let manager = Self {
            backend,
            config,
            state: ConnectionState::Idle,
            scanner,
            session: None,
            session_generation: 0,
            connected_device: None,
            last_reading: None,
            requests,
            signals_tx,
            signals_rx,
            events,
        };
        (manager, BluetoothHandle { tx }, event_rx)
    }

    /// Creates a manager and runs it on its own task
    pub fn spawn(
        backend: B,
        config: ConnectivityConfig,
    ) -> (BluetoothHandle, EventReceiver, JoinHandle<()>) {
        let (manager, handle, events) = Self::new(backend, config);
        let task = tokio::spawn(manager.run());
        (handle, events, task)
    }

    /// Processes requests and background signals until shut down or every
    /// handle is dropped.
    pub async fn run(mut self) {
        info!("Bluetooth manager started");
        loop {
            tokio::select! {
                biased;
                Some(signal) = self.signals_rx.recv() => self.handle_signal(signal).await,
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if !self.handle_request(request).await {
                            return;
                        }
                    }
                    None => break,
                },
            }
        }
        self.shutdown().await;
    }

    /// Returns false once the manager should stop.
    async fn handle_request(&mut self, request: Request) -> bool {
        match request {
            Request::StartScanning(reply) => {
                let _ = reply.send(self.start_scanning().await);
            }
            Request::StopScanning(reply) => {
                self.stop_scanning().await;
                let _ = reply.send(());
            }
            Request::Connect { device_id, reply } => {
                let _ = reply.send(self.connect(device_id).await);
            }
            Request::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Request::SetResistanceLevel { level, reply } => {
                let _ = reply.send(self.set_resistance_level(level).await);
            }
            Request::CheckConnectionStatus(reply) => {
                let _ = reply.send(self.connection_status());
            }
            Request::GetWorkoutState(reply) => {
                let _ = reply.send(self.last_reading);
            }
            Request::Shutdown(reply) => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::DeviceFound { scan, device } => {
                if self.is_current_scan(scan) {
                    self.emit(ConnectivityEvent::DeviceDiscovered(device));
                }
            }
            Signal::ScanTimedOut { scan } => {
                if self.is_current_scan(scan) {
                    let timeout = ConnectivityError::Timeout {
                        operation: "scan",
                        after_ms: self.config.scan_timeout_ms,
                    };
                    self.abort_scan(&timeout.to_string()).await;
                }
            }
            Signal::ScanFailed { scan, message } => {
                if self.is_current_scan(scan) {
                    self.abort_scan(&format!("scan failed: {}", message)).await;
                }
            }
            Signal::Frame { session, data } => {
                if self.is_current_session(session) {
                    self.handle_frame(data);
                }
            }
            Signal::LinkLost { session } => {
                if self.is_current_session(session) {
                    info!("Device disconnected unexpectedly, cleaning up session");
                    self.teardown_session().await;
                }
            }
        }
    }

    fn is_current_scan(&self, scan: u64) -> bool {
        self.state == ConnectionState::Scanning && scan == self.scanner.generation()
    }

    fn is_current_session(&self, session: u64) -> bool {
        self.session.is_some() && session == self.session_generation
    }

    fn handle_frame(&mut self, data: Vec<u8>) {
        let outcome = decode_telemetry(&data);
        self.emit(ConnectivityEvent::RawDataReceived(data));
        match outcome {
            DecodeOutcome::Reading(reading) => {
                debug!("Parsed bike state: {:?}", reading);
                self.last_reading = Some(reading);
                self.emit(ConnectivityEvent::DataReceived(reading));
            }
            DecodeOutcome::Ignored => debug!("Frame carries no telemetry"),
        }
    }

    async fn start_scanning(&mut self) -> Result<()> {
        if self.state != ConnectionState::Idle {
            return Err(self.invalid_state("start scanning"));
        }

        match self.scanner.start_scan(self.signals_tx.clone()).await {
            Ok(_) => {
                self.set_state(ConnectionState::Scanning);
                Ok(())
            }
            Err(e) => {
                self.emit_error(&e);
                Err(e)
            }
        }
    }

    async fn stop_scanning(&mut self) {
        if self.scanner.is_scanning() {
            self.scanner.stop_scan().await;
        }
        if self.state == ConnectionState::Scanning {
            self.set_state(ConnectionState::Idle);
        }
    }

    async fn abort_scan(&mut self, message: &str) {
        warn!("Stopping scan: {}", message);
        self.scanner.stop_scan().await;
        self.set_state(ConnectionState::Idle);
        self.emit(ConnectivityEvent::Error(message.to_string()));
    }

    /// Connects to a device with the given ID
    async fn connect(&mut self, device_id: String) -> Result<()> {
        match &self.state {
            ConnectionState::Idle | ConnectionState::Scanning | ConnectionState::Connected(_) => {}
            _ => return Err(self.invalid_state("connect")),
        }

        let (device_info, device) = self
            .scanner
            .device(&device_id)
            .ok_or_else(|| ConnectivityError::DeviceNotFound(device_id.clone()))?;

        if matches!(self.state, ConnectionState::Connected(_)) {
            info!("Closing current session before connecting to {}", device_id);
            self.teardown_session().await;
        }
        if self.scanner.is_scanning() {
            self.scanner.stop_scan().await;
        }

        self.set_state(ConnectionState::Connecting(device_id.clone()));
        self.session_generation += 1;
        let generation = self.session_generation;

        let open = GattSession::open(
            self.backend.clone(),
            device.clone(),
            device_id.clone(),
            generation,
            self.signals_tx.clone(),
        );
        let result = match tokio::time::timeout(self.config.connect_timeout(), open).await {
            Ok(result) => result,
            Err(_) => {
                if let Err(e) = self.backend.disconnect(&device).await {
                    debug!("Disconnect after connect timeout failed: {}", e);
                }
                Err(ConnectivityError::Timeout {
                    operation: "connect",
                    after_ms: self.config.connect_timeout_ms,
                })
            }
        };

        match result {
            Ok(mut session) => {
                session.start_keepalive(self.config.poll_interval(), self.signals_tx.clone());
                self.session = Some(session);
                self.connected_device = Some(device_info);
                self.last_reading = None;
                self.set_state(ConnectionState::Connected(device_id));
                self.emit(ConnectivityEvent::DeviceConnected);
                info!("Device successfully connected and session stored in the manager.");
                Ok(())
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", device_id, e);
                self.set_state(ConnectionState::Idle);
                self.emit_error(&e);
                Err(e)
            }
        }
    }

    /// Disconnects from the currently connected device
    async fn disconnect(&mut self) {
        if !matches!(self.state, ConnectionState::Connected(_)) {
            debug!("Disconnect requested while {}, nothing to do", self.state);
            return;
        }
        self.teardown_session().await;
    }

    /// Closes the session and always lands in `Idle`.
    async fn teardown_session(&mut self) {
        self.set_state(ConnectionState::Disconnecting);
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!("Error while closing session with {}: {}", session.device_id(), e);
            }
        }
        self.connected_device = None;
        self.set_state(ConnectionState::Idle);
        self.emit(ConnectivityEvent::Disconnected);
    }

    async fn set_resistance_level(&mut self, level: i32) -> Result<u8> {
        let session = match (&self.state, &self.session) {
            (ConnectionState::Connected(_), Some(session)) => session,
            _ => return Err(ConnectivityError::NotConnected),
        };

        let applied = clamp_resistance(level);
        if i32::from(applied) != level {
            info!("Resistance level {} clamped to {}", level, applied);
        }
        session
            .send_command(ControlCommand::set_resistance(level))
            .await?;
        Ok(applied)
    }

    fn connection_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            connected: matches!(self.state, ConnectionState::Connected(_)),
            state: self.state.clone(),
            device: self.connected_device.clone(),
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down bluetooth manager");
        self.stop_scanning().await;
        self.disconnect().await;
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection state: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn invalid_state(&self, operation: &'static str) -> ConnectivityError {
        ConnectivityError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }

    fn emit(&self, event: ConnectivityEvent) {
        if self.events.send(event).is_err() {
            debug!("No event listener attached");
        }
    }

    fn emit_error(&self, error: &ConnectivityError) {
        self.emit(ConnectivityEvent::Error(error.to_string()));
    }
}
