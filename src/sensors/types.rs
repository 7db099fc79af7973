//! Sensor domain types: connection states, samples, events, config, errors.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;

/// Which source produced a sample. Carried on every fused sample for
/// prioritization and observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    /// Connected BLE device
    Device,
    /// Phone pedometer fallback
    PedometerFallback,
    /// Simulation generator
    Simulated,
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceTag::Device => write!(f, "device"),
            SourceTag::PedometerFallback => write!(f, "pedometer"),
            SourceTag::Simulated => write!(f, "simulated"),
        }
    }
}

/// Terminal failure reasons for the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// Scan window expired with no matching device
    DeviceNotFound,
    /// Reconnection budget exhausted after link loss
    MaxReconnectAttemptsExceeded,
    /// Bluetooth adapter missing or unusable
    BluetoothUnavailable,
}

impl std::fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionFailure::DeviceNotFound => write!(f, "no device found"),
            ConnectionFailure::MaxReconnectAttemptsExceeded => {
                write!(f, "reconnect attempts exhausted")
            }
            ConnectionFailure::BluetoothUnavailable => write!(f, "bluetooth unavailable"),
        }
    }
}

/// Connection state of the managed sensor device.
///
/// Exactly one value is active at a time; transitions are driven only by
/// the connection manager's own run loop.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Discovery scan in progress
    Scanning,
    /// Connection attempt in progress
    Connecting,
    /// Active connection
    Connected {
        /// Display name of the connected device
        device_name: String,
    },
    /// Auto-reconnect in progress
    Reconnecting {
        /// 1-based attempt counter
        attempt: u32,
    },
    /// Terminal failure until a new scan or connect is requested
    Failed {
        /// Why the state machine gave up
        reason: ConnectionFailure,
    },
}

impl ConnectionState {
    /// Whether a device link is currently established.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Scanning => write!(f, "Scanning..."),
            ConnectionState::Connecting => write!(f, "Connecting..."),
            ConnectionState::Connected { device_name } => {
                write!(f, "Connected to {}", device_name)
            }
            ConnectionState::Reconnecting { attempt } => {
                write!(f, "Reconnecting (attempt {})...", attempt)
            }
            ConnectionState::Failed { reason } => write!(f, "Failed: {}", reason),
        }
    }
}

/// A device seen during BLE scanning.
///
/// Exists only while scanning; the list is discarded when scanning stops
/// or a connection attempt begins.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    /// Identifier stable across application runs
    pub device_id: String,
    /// Advertised display name
    pub name: String,
    /// Signal strength (RSSI)
    pub signal_strength: Option<i16>,
    /// Advertises the Heart Rate service
    pub has_heart_rate: bool,
    /// Advertises the Running Speed and Cadence service
    pub has_cadence: bool,
    /// Matched a vendor name pattern or manufacturer ID
    pub vendor_match: bool,
    /// When the advertisement was last seen
    pub last_seen: Instant,
}

/// A heart-rate reading, immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateSample {
    /// Monotonic capture time
    pub timestamp: Instant,
    /// Beats per minute
    pub bpm: u16,
    /// Producing source
    pub source: SourceTag,
}

/// A cadence reading, immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CadenceSample {
    /// Monotonic capture time
    pub timestamp: Instant,
    /// Steps per minute
    pub spm: u16,
    /// Producing source
    pub source: SourceTag,
}

/// Events published by the connection manager.
#[derive(Debug, Clone)]
pub enum SensorEvent {
    /// Discovery scan started
    ScanStarted,
    /// Discovery scan stopped
    ScanStopped,
    /// A matching device was discovered during scanning
    Discovered(DiscoveredDevice),
    /// Connection state transition
    ConnectionChanged(ConnectionState),
    /// Decoded heart-rate sample from the connected device
    HeartRate(HeartRateSample),
    /// Decoded cadence sample from the connected device
    Cadence(CadenceSample),
    /// The retry budget is exhausted; fallback sources should take over
    FallbackActivated {
        /// Terminal failure that triggered the switch
        reason: ConnectionFailure,
    },
    /// Non-fatal diagnostic
    Error(String),
}

/// Configuration for the connection manager and adapter filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Discovery scan window in seconds
    pub scan_timeout_secs: u64,
    /// Single connection attempt timeout in seconds
    pub connection_timeout_secs: u64,
    /// Whether to auto-reconnect on unexpected link loss
    pub auto_reconnect: bool,
    /// Maximum reconnection attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Base delay for exponential reconnect backoff, in seconds
    pub reconnect_base_delay_secs: u64,
    /// Case-insensitive substrings matched against advertised names
    pub vendor_name_patterns: Vec<String>,
    /// Manufacturer IDs accepted during discovery
    pub vendor_manufacturer_ids: Vec<u16>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 30,
            connection_timeout_secs: 10,
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            reconnect_base_delay_secs: 2,
            vendor_name_patterns: vec!["garmin".to_string(), "forerunner".to_string()],
            vendor_manufacturer_ids: Vec::new(),
        }
    }
}

/// Errors from the sensor subsystem.
#[derive(Debug, Error)]
pub enum SensorError {
    /// BLE adapter not found or unavailable
    #[error("Bluetooth adapter not found")]
    AdapterNotFound,

    /// Bluetooth stack unusable on this system
    #[error("Bluetooth unavailable: {0}")]
    BluetoothUnavailable(String),

    /// Permission denied for Bluetooth access
    #[error("Bluetooth access not authorized")]
    BluetoothUnauthorized,

    /// Failed to start or stop BLE scanning
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    /// No device with the given identifier is known
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Connection attempt failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection attempt timed out
    #[error("Connection timed out")]
    ConnectionTimeout,

    /// Established link dropped unexpectedly
    #[error("Link lost: {0}")]
    LinkLost(String),

    /// Failed to subscribe to measurement notifications
    #[error("Failed to subscribe to notifications: {0}")]
    SubscriptionFailed(String),

    /// No last-connected device is recorded
    #[error("No known device to reconnect to")]
    NoKnownDevice,

    /// Generic BLE error
    #[error("BLE error: {0}")]
    BleError(String),
}

impl SensorError {
    /// Transport-fatal errors are surfaced immediately and never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SensorError::AdapterNotFound
                | SensorError::BluetoothUnavailable(_)
                | SensorError::BluetoothUnauthorized
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_display() {
        let states = [
            ConnectionState::Disconnected,
            ConnectionState::Scanning,
            ConnectionState::Connecting,
            ConnectionState::Connected {
                device_name: "Forerunner 255".to_string(),
            },
            ConnectionState::Reconnecting { attempt: 2 },
            ConnectionState::Failed {
                reason: ConnectionFailure::DeviceNotFound,
            },
        ];
        for state in &states {
            assert!(!format!("{}", state).is_empty());
        }
    }

    #[test]
    fn test_is_connected() {
        assert!(ConnectionState::Connected {
            device_name: "X".to_string()
        }
        .is_connected());
        assert!(!ConnectionState::Reconnecting { attempt: 1 }.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
    }

    #[test]
    fn test_sensor_config_defaults() {
        let config = SensorConfig::default();
        assert_eq!(config.scan_timeout_secs, 30);
        assert!(config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert_eq!(config.reconnect_base_delay_secs, 2);
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SensorError::AdapterNotFound.is_fatal());
        assert!(SensorError::BluetoothUnauthorized.is_fatal());
        assert!(!SensorError::ConnectionFailed("x".to_string()).is_fatal());
        assert!(!SensorError::LinkLost("x".to_string()).is_fatal());
    }
}
