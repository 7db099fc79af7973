//! Storage module for configuration and cross-session state.

pub mod config;

pub use config::{
    AppConfig, ConfigError, DeviceStore, KnownDevice, MemoryDeviceStore, TomlDeviceStore,
};
