//! Application configuration and last-connected device persistence.
//!
//! Config is a TOML file under the platform config directory. The
//! last-connected device record is the single piece of state carried
//! across sessions; it is written only after a successful connection and
//! read only at session start.

use crate::sensors::fusion::FusionConfig;
use crate::sensors::simulation::SimulationConfig;
use crate::sensors::types::SensorConfig;
use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Errors from configuration handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Platform config directory could not be determined
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// Reading or writing the config file failed
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be serialized
    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// The last successfully connected device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownDevice {
    /// Identifier stable across application runs
    pub device_id: String,
    /// Display name at connection time
    pub name: String,
    /// When the connection was established
    pub last_connected_at: DateTime<Utc>,
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Connection manager and discovery filtering
    pub sensor: SensorConfig,
    /// Fusion validation, smoothing and arbitration
    pub fusion: FusionConfig,
    /// Simulated source parameters
    pub simulation: SimulationConfig,
    /// Last-connected device record
    pub last_device: Option<KnownDevice>,
}

impl AppConfig {
    /// Default path: `<platform config dir>/runpulse/config.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = ProjectDirs::from("", "", "runpulse").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load from a path, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save to a path, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Persistence of the last-connected device record.
///
/// Write failures are logged, never surfaced: losing the record only costs
/// a full scan on the next session.
pub trait DeviceStore: Send + Sync {
    /// Read the last-connected device, if one is recorded.
    fn last_device(&self) -> Option<KnownDevice>;

    /// Record a successful connection.
    fn record(&self, device: &KnownDevice);
}

/// [`DeviceStore`] backed by the TOML config file.
pub struct TomlDeviceStore {
    path: PathBuf,
}

impl TomlDeviceStore {
    /// Create a store over the given config path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Create a store over the default config path.
    pub fn at_default_path() -> Result<Self, ConfigError> {
        Ok(Self::new(AppConfig::default_path()?))
    }
}

impl DeviceStore for TomlDeviceStore {
    fn last_device(&self) -> Option<KnownDevice> {
        match AppConfig::load(&self.path) {
            Ok(config) => config.last_device,
            Err(e) => {
                tracing::warn!("Could not read device record: {}", e);
                None
            }
        }
    }

    fn record(&self, device: &KnownDevice) {
        let mut config = match AppConfig::load(&self.path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Could not read config, starting fresh: {}", e);
                AppConfig::default()
            }
        };
        config.last_device = Some(device.clone());
        if let Err(e) = config.save(&self.path) {
            tracing::warn!("Could not persist device record: {}", e);
        } else {
            tracing::debug!("Recorded last device {}", device.device_id);
        }
    }
}

/// In-memory [`DeviceStore`] for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryDeviceStore {
    device: Mutex<Option<KnownDevice>>,
}

impl MemoryDeviceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceStore for MemoryDeviceStore {
    fn last_device(&self) -> Option<KnownDevice> {
        self.device.lock().ok().and_then(|d| d.clone())
    }

    fn record(&self, device: &KnownDevice) {
        if let Ok(mut slot) = self.device.lock() {
            *slot = Some(device.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.sensor.max_reconnect_attempts, 3);
        assert!(config.last_device.is_none());
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AppConfig::default();
        config.sensor.scan_timeout_secs = 45;
        config.last_device = Some(KnownDevice {
            device_id: "aa:bb:cc".to_string(),
            name: "Forerunner 255".to_string(),
            last_connected_at: Utc::now(),
        });
        config.save(&path).unwrap();

        let reloaded = AppConfig::load(&path).unwrap();
        assert_eq!(reloaded.sensor.scan_timeout_secs, 45);
        assert_eq!(reloaded.last_device.unwrap().device_id, "aa:bb:cc");
    }

    #[test]
    fn test_toml_store_records_device() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlDeviceStore::new(dir.path().join("config.toml"));

        assert!(store.last_device().is_none());

        store.record(&KnownDevice {
            device_id: "11:22:33".to_string(),
            name: "HRM-Pro".to_string(),
            last_connected_at: Utc::now(),
        });

        let known = store.last_device().unwrap();
        assert_eq!(known.device_id, "11:22:33");
        assert_eq!(known.name, "HRM-Pro");
    }

    #[test]
    fn test_record_preserves_other_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.sensor.scan_timeout_secs = 45;
        config.save(&path).unwrap();

        let store = TomlDeviceStore::new(path.clone());
        store.record(&KnownDevice {
            device_id: "x".to_string(),
            name: "y".to_string(),
            last_connected_at: Utc::now(),
        });

        let reloaded = AppConfig::load(&path).unwrap();
        assert_eq!(reloaded.sensor.scan_timeout_secs, 45);
        assert!(reloaded.last_device.is_some());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryDeviceStore::new();
        assert!(store.last_device().is_none());

        store.record(&KnownDevice {
            device_id: "mem".to_string(),
            name: "Mem".to_string(),
            last_connected_at: Utc::now(),
        });
        assert_eq!(store.last_device().unwrap().device_id, "mem");
    }
}
