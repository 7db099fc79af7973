//! Device connection manager: discovery, connection lifecycle and
//! bounded-retry reconnection.
//!
//! All mutable connection state lives inside a single spawned run loop.
//! Public methods enqueue commands; adapter callbacks arrive over the
//! adapter event channel. Both are drained by the same `select!`, so every
//! state transition is serialized through one owner.

use crate::sensors::adapter::{AdapterEvent, BleCentral};
use crate::sensors::gatt::{self, HEART_RATE_MEASUREMENT_UUID, RSC_MEASUREMENT_UUID};
use crate::sensors::types::{
    CadenceSample, ConnectionFailure, ConnectionState, DiscoveredDevice, HeartRateSample,
    SensorConfig, SensorError, SensorEvent, SourceTag,
};
use crate::storage::config::{DeviceStore, KnownDevice};
use crossbeam::channel::{Receiver, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Commands handled by the connection run loop.
#[derive(Debug)]
enum Command {
    StartScanning,
    StopScanning,
    Connect { device_id: String },
    ConnectLastKnown,
    Disconnect,
    Shutdown,
    ScanTimedOut { generation: u64 },
    RetryReconnect { generation: u64 },
}

/// Handle to the connection state machine.
///
/// Construct with [`DeviceConnectionManager::new`], register event
/// consumers, then call [`start`](DeviceConnectionManager::start) to spawn
/// the run loop.
pub struct DeviceConnectionManager {
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: Option<mpsc::UnboundedReceiver<Command>>,
    central: Option<Box<dyn BleCentral>>,
    config: SensorConfig,
    store: Arc<dyn DeviceStore>,
    event_tx: Option<Sender<SensorEvent>>,
    observers: Vec<mpsc::UnboundedSender<SensorEvent>>,
    state_rx: watch::Receiver<ConnectionState>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    task: Option<JoinHandle<()>>,
}

impl DeviceConnectionManager {
    /// Create a manager over the given BLE central and device store.
    pub fn new(
        central: Box<dyn BleCentral>,
        config: SensorConfig,
        store: Arc<dyn DeviceStore>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        Self {
            command_tx,
            command_rx: Some(command_rx),
            central: Some(central),
            config,
            store,
            event_tx: None,
            observers: Vec::new(),
            state_rx,
            state_tx: Some(state_tx),
            task: None,
        }
    }

    /// Get an event receiver for external consumers. Call before `start`.
    pub fn event_receiver(&mut self) -> Receiver<SensorEvent> {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.event_tx = Some(tx);
        rx
    }

    /// Register an async observer channel (used by the fusion service).
    /// Call before `start`.
    pub fn register_observer(&mut self, observer: mpsc::UnboundedSender<SensorEvent>) {
        self.observers.push(observer);
    }

    /// Watch connection-state transitions without consuming events.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Current connection state.
    pub fn current_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Spawn the run loop. Commands enqueued earlier are processed once
    /// the loop is running.
    pub fn start(&mut self) -> Result<(), SensorError> {
        let mut central = self
            .central
            .take()
            .ok_or_else(|| SensorError::BleError("manager already started".to_string()))?;
        let adapter_events = central
            .take_events()
            .ok_or_else(|| SensorError::BleError("adapter events already taken".to_string()))?;
        let command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| SensorError::BleError("manager already started".to_string()))?;
        let state_tx = self
            .state_tx
            .take()
            .ok_or_else(|| SensorError::BleError("manager already started".to_string()))?;

        let task = ConnectionTask {
            central,
            adapter_events,
            command_rx,
            command_tx: self.command_tx.clone(),
            config: self.config.clone(),
            store: self.store.clone(),
            event_tx: self.event_tx.clone(),
            observers: std::mem::take(&mut self.observers),
            state_tx,
            state: ConnectionState::Disconnected,
            discovered: HashMap::new(),
            connected_device: None,
            reconnect_target: None,
            reconnect_attempt: 0,
            timer: None,
            timer_generation: 0,
        };

        self.task = Some(tokio::spawn(task.run()));
        Ok(())
    }

    /// Begin a discovery scan.
    pub fn start_scanning(&self) {
        let _ = self.command_tx.send(Command::StartScanning);
    }

    /// Stop scanning and return to `Disconnected` unless connected.
    pub fn stop_scanning(&self) {
        let _ = self.command_tx.send(Command::StopScanning);
    }

    /// Connect to a discovered device.
    pub fn connect(&self, device_id: impl Into<String>) {
        let _ = self.command_tx.send(Command::Connect {
            device_id: device_id.into(),
        });
    }

    /// Attempt a direct connection to the last-connected device.
    pub fn connect_last_known(&self) {
        let _ = self.command_tx.send(Command::ConnectLastKnown);
    }

    /// Disconnect the active device, cancelling any pending reconnect.
    pub fn disconnect(&self) {
        let _ = self.command_tx.send(Command::Disconnect);
    }

    /// Tear down the run loop, leaving no timers pending.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }
}

impl Drop for DeviceConnectionManager {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The run loop's exclusive state. Lives entirely inside one task.
struct ConnectionTask {
    central: Box<dyn BleCentral>,
    adapter_events: mpsc::UnboundedReceiver<AdapterEvent>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    config: SensorConfig,
    store: Arc<dyn DeviceStore>,
    event_tx: Option<Sender<SensorEvent>>,
    observers: Vec<mpsc::UnboundedSender<SensorEvent>>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,
    discovered: HashMap<String, DiscoveredDevice>,
    connected_device: Option<(String, String)>,
    reconnect_target: Option<String>,
    reconnect_attempt: u32,
    timer: Option<JoinHandle<()>>,
    timer_generation: u64,
}

impl ConnectionTask {
    async fn run(mut self) {
        tracing::info!("Connection manager started");
        loop {
            tokio::select! {
                Some(command) = self.command_rx.recv() => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = self.adapter_events.recv() => {
                    self.handle_adapter_event(event).await;
                }
                else => break,
            }
        }
        self.cancel_timer();
        tracing::info!("Connection manager stopped");
    }

    /// Returns false when the loop should terminate.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::StartScanning => self.start_scanning().await,
            Command::StopScanning => self.stop_scanning().await,
            Command::Connect { device_id } => self.connect_requested(device_id).await,
            Command::ConnectLastKnown => self.connect_last_known().await,
            Command::Disconnect => self.disconnect(true).await,
            Command::ScanTimedOut { generation } => {
                if generation == self.timer_generation {
                    self.scan_timed_out().await;
                }
            }
            Command::RetryReconnect { generation } => {
                if generation == self.timer_generation {
                    self.retry_reconnect().await;
                }
            }
            Command::Shutdown => {
                self.disconnect(false).await;
                if self.state == ConnectionState::Scanning {
                    let _ = self.central.stop_scan().await;
                }
                return false;
            }
        }
        true
    }

    async fn handle_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::DeviceDiscovered(device) => {
                if self.state != ConnectionState::Scanning {
                    return;
                }
                let is_new = !self.discovered.contains_key(&device.device_id);
                self.discovered
                    .insert(device.device_id.clone(), device.clone());
                if is_new {
                    tracing::info!("Discovered {} ({})", device.name, device.device_id);
                    self.emit(SensorEvent::Discovered(device));
                }
            }
            AdapterEvent::DeviceDisconnected { device_id } => {
                self.link_lost(&device_id);
            }
            AdapterEvent::Notification {
                device_id,
                characteristic,
                payload,
            } => {
                self.handle_notification(&device_id, characteristic, &payload);
            }
        }
    }

    async fn start_scanning(&mut self) {
        match self.state {
            ConnectionState::Connecting
            | ConnectionState::Connected { .. }
            | ConnectionState::Reconnecting { .. } => {
                tracing::warn!("Scan requested while {}", self.state);
                self.emit(SensorEvent::Error(format!(
                    "scan requested while {}",
                    self.state
                )));
                return;
            }
            ConnectionState::Scanning => return,
            ConnectionState::Disconnected | ConnectionState::Failed { .. } => {}
        }

        self.discovered.clear();
        if let Err(e) = self.central.start_scan().await {
            self.scan_failed(e);
            return;
        }

        self.set_state(ConnectionState::Scanning);
        self.emit(SensorEvent::ScanStarted);

        let generation = self.next_timer_generation();
        let delay = Duration::from_secs(self.config.scan_timeout_secs);
        let command_tx = self.command_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = command_tx.send(Command::ScanTimedOut { generation });
        }));
    }

    async fn scan_timed_out(&mut self) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        if let Err(e) = self.central.stop_scan().await {
            tracing::warn!("Failed to stop scan: {}", e);
        }
        self.emit(SensorEvent::ScanStopped);

        if self.discovered.is_empty() {
            tracing::warn!("Scan window expired with no devices found");
            self.set_state(ConnectionState::Failed {
                reason: ConnectionFailure::DeviceNotFound,
            });
        } else {
            self.discovered.clear();
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn stop_scanning(&mut self) {
        if self.state.is_connected() {
            return;
        }
        self.cancel_timer();
        if self.state == ConnectionState::Scanning {
            if let Err(e) = self.central.stop_scan().await {
                tracing::warn!("Failed to stop scan: {}", e);
            }
            self.emit(SensorEvent::ScanStopped);
        }
        self.discovered.clear();
        self.reconnect_target = None;
        self.reconnect_attempt = 0;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn connect_requested(&mut self, device_id: String) {
        if self.state.is_connected() || self.state == ConnectionState::Connecting {
            self.emit(SensorEvent::Error(format!(
                "connect requested while {}",
                self.state
            )));
            return;
        }

        if self.state == ConnectionState::Scanning {
            self.cancel_timer();
            if let Err(e) = self.central.stop_scan().await {
                tracing::warn!("Failed to stop scan: {}", e);
            }
            self.emit(SensorEvent::ScanStopped);
        }
        // The discovery list is discarded once a connection attempt begins.
        self.discovered.clear();

        self.attempt_connect(device_id).await;
    }

    async fn connect_last_known(&mut self) {
        match self.store.last_device() {
            Some(known) => {
                tracing::info!(
                    "Attempting direct reconnect to last device {} ({})",
                    known.name,
                    known.device_id
                );
                self.connect_requested(known.device_id).await;
            }
            None => {
                // Configuration misuse: diagnostic, never fatal.
                tracing::warn!("connect_last_known called with no recorded device");
                self.emit(SensorEvent::Error(SensorError::NoKnownDevice.to_string()));
            }
        }
    }

    async fn attempt_connect(&mut self, device_id: String) {
        self.set_state(ConnectionState::Connecting);

        match self.central.connect(&device_id).await {
            Ok(name) => self.connection_established(device_id, name),
            Err(e) if e.is_fatal() => {
                tracing::error!("Connection failed fatally: {}", e);
                self.emit(SensorEvent::Error(e.to_string()));
                self.set_state(ConnectionState::Failed {
                    reason: ConnectionFailure::BluetoothUnavailable,
                });
            }
            Err(e @ SensorError::DeviceNotFound(_)) => {
                // Unknown identifier: surfaced, not retried.
                tracing::warn!("{}", e);
                self.emit(SensorEvent::Error(e.to_string()));
                self.set_state(ConnectionState::Disconnected);
            }
            Err(e) => {
                tracing::warn!("Connection to {} failed: {}", device_id, e);
                if self.config.auto_reconnect {
                    self.begin_reconnect(device_id);
                } else {
                    self.emit(SensorEvent::Error(e.to_string()));
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }

    fn connection_established(&mut self, device_id: String, name: String) {
        tracing::info!("Connected to {} ({})", name, device_id);
        self.cancel_timer();
        self.reconnect_target = None;
        self.reconnect_attempt = 0;
        self.connected_device = Some((device_id.clone(), name.clone()));
        self.set_state(ConnectionState::Connected {
            device_name: name.clone(),
        });
        // Persisted only after a successful connection.
        self.store.record(&KnownDevice {
            device_id,
            name,
            last_connected_at: chrono::Utc::now(),
        });
    }

    fn link_lost(&mut self, device_id: &str) {
        let lost_current = self
            .connected_device
            .as_ref()
            .map(|(id, _)| id == device_id)
            .unwrap_or(false);
        if !self.state.is_connected() || !lost_current {
            // Duplicate or stale disconnect notice.
            return;
        }

        tracing::warn!("Link lost to {}", device_id);
        self.connected_device = None;

        if self.config.auto_reconnect {
            self.begin_reconnect(device_id.to_string());
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Enter the next reconnect attempt, scheduling its backoff delay.
    /// The previous timer is always cancelled first, so at most one
    /// sequence is in flight.
    fn begin_reconnect(&mut self, device_id: String) {
        self.reconnect_attempt += 1;
        let attempt = self.reconnect_attempt;

        if attempt > self.config.max_reconnect_attempts {
            self.reconnect_exhausted();
            return;
        }

        self.reconnect_target = Some(device_id);
        self.set_state(ConnectionState::Reconnecting { attempt });

        let delay = backoff_delay(self.config.reconnect_base_delay_secs, attempt);
        tracing::info!(
            "Reconnect attempt {}/{} in {:?}",
            attempt,
            self.config.max_reconnect_attempts,
            delay
        );

        let generation = self.next_timer_generation();
        let command_tx = self.command_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = command_tx.send(Command::RetryReconnect { generation });
        }));
    }

    async fn retry_reconnect(&mut self) {
        let device_id = match self.reconnect_target.clone() {
            Some(id) => id,
            None => return,
        };
        if !matches!(self.state, ConnectionState::Reconnecting { .. }) {
            return;
        }

        match self.central.connect(&device_id).await {
            Ok(name) => self.connection_established(device_id, name),
            Err(e) if e.is_fatal() => {
                tracing::error!("Reconnect failed fatally: {}", e);
                self.reconnect_target = None;
                self.reconnect_attempt = 0;
                self.emit(SensorEvent::Error(e.to_string()));
                self.set_state(ConnectionState::Failed {
                    reason: ConnectionFailure::BluetoothUnavailable,
                });
            }
            Err(e) => {
                tracing::warn!(
                    "Reconnect attempt {} to {} failed: {}",
                    self.reconnect_attempt,
                    device_id,
                    e
                );
                if self.reconnect_attempt >= self.config.max_reconnect_attempts {
                    self.reconnect_exhausted();
                } else {
                    self.begin_reconnect(device_id);
                }
            }
        }
    }

    fn reconnect_exhausted(&mut self) {
        tracing::error!(
            "Reconnect budget of {} attempts exhausted",
            self.config.max_reconnect_attempts
        );
        self.reconnect_target = None;
        self.reconnect_attempt = 0;
        self.set_state(ConnectionState::Failed {
            reason: ConnectionFailure::MaxReconnectAttemptsExceeded,
        });
        self.emit(SensorEvent::FallbackActivated {
            reason: ConnectionFailure::MaxReconnectAttemptsExceeded,
        });
    }

    async fn disconnect(&mut self, emit_state: bool) {
        self.cancel_timer();
        self.reconnect_target = None;
        self.reconnect_attempt = 0;

        if let Some((device_id, name)) = self.connected_device.take() {
            tracing::info!("Disconnecting from {}", name);
            if let Err(e) = self.central.disconnect(&device_id).await {
                tracing::warn!("Disconnect error: {}", e);
            }
        }
        if emit_state {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    fn handle_notification(&mut self, device_id: &str, characteristic: uuid::Uuid, payload: &[u8]) {
        let from_current = self
            .connected_device
            .as_ref()
            .map(|(id, _)| id == device_id)
            .unwrap_or(false);
        if !from_current {
            return;
        }

        if characteristic == HEART_RATE_MEASUREMENT_UUID {
            match gatt::decode_heart_rate(payload) {
                Ok(measurement) => {
                    self.emit(SensorEvent::HeartRate(HeartRateSample {
                        timestamp: Instant::now(),
                        bpm: measurement.bpm,
                        source: SourceTag::Device,
                    }));
                }
                Err(e) => tracing::warn!("Dropping malformed heart-rate payload: {}", e),
            }
        } else if characteristic == RSC_MEASUREMENT_UUID {
            match gatt::decode_rsc(payload) {
                Ok(measurement) => {
                    if let Some(pace) = measurement.pace_seconds_per_km() {
                        tracing::trace!("Pace {:.0} s/km", pace);
                    }
                    if let Some(spm) = measurement.cadence_spm {
                        self.emit(SensorEvent::Cadence(CadenceSample {
                            timestamp: Instant::now(),
                            spm: u16::from(spm),
                            source: SourceTag::Device,
                        }));
                    }
                }
                Err(e) => tracing::warn!("Dropping malformed RSC payload: {}", e),
            }
        }
    }

    fn scan_failed(&mut self, error: SensorError) {
        tracing::error!("Failed to start scan: {}", error);
        self.emit(SensorEvent::Error(error.to_string()));
        if error.is_fatal() {
            self.set_state(ConnectionState::Failed {
                reason: ConnectionFailure::BluetoothUnavailable,
            });
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        tracing::debug!("Connection state: {} -> {}", self.state, state);
        self.state = state.clone();
        let _ = self.state_tx.send(state.clone());
        self.emit(SensorEvent::ConnectionChanged(state));
    }

    fn emit(&mut self, event: SensorEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event.clone());
        }
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Cancel any pending timer and return the generation the replacement
    /// timer must carry. A firing already queued by a cancelled timer
    /// carries a stale generation and is ignored on receipt.
    fn next_timer_generation(&mut self) -> u64 {
        self.cancel_timer();
        self.timer_generation
    }

    fn cancel_timer(&mut self) {
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
        self.timer_generation += 1;
    }
}

/// Exponential backoff delay for reconnect attempt `attempt` (1-based).
fn backoff_delay(base_secs: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::from_secs(base_secs.saturating_mul(1u64 << exponent))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delays() {
        assert_eq!(backoff_delay(2, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(2, 3), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let delay = backoff_delay(2, 64);
        assert!(delay <= Duration::from_secs(2 * (1 << 16)));
    }
}
