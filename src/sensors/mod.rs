//! Sensor module: BLE connectivity, decoding, fallback sources and fusion.

pub mod adapter;
pub mod fusion;
pub mod gatt;
pub mod manager;
pub mod pedometer;
pub mod simulation;
pub mod types;

pub use adapter::{AdapterEvent, BleCentral, BtleplugCentral};
pub use fusion::{
    FusionConfig, FusionCore, FusionDiagnostics, FusionEvent, Metric, SensorFusionService,
};
pub use gatt::{
    decode_heart_rate, decode_rsc, DecodeError, HeartRateMeasurement, RscMeasurement,
    HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID, RSC_MEASUREMENT_UUID, RSC_SERVICE_UUID,
};
pub use manager::DeviceConnectionManager;
pub use pedometer::{CadencePusher, CadenceSource, ChannelCadenceSource};
pub use simulation::{SimulatedSample, SimulatedSensor, SimulationConfig};
pub use types::{
    CadenceSample, ConnectionFailure, ConnectionState, DiscoveredDevice, HeartRateSample,
    SensorConfig, SensorError, SensorEvent, SourceTag,
};
