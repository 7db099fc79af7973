//! RunPulse - Run Interval Training Core
//!
//! The headless real-time core of a running-interval trainer: BLE sensor
//! connectivity with bounded-retry reconnection, multi-source cadence and
//! heart-rate fusion, a wall-clock interval phase engine, and cadence-zone
//! tracking. Display, audio and persistence layers consume its event
//! streams.

pub mod metrics;
pub mod sensors;
pub mod session;
pub mod storage;
pub mod workouts;

// Re-export commonly used types
pub use metrics::zones::{TargetZone, ZoneStatus, ZoneTracker};
pub use sensors::fusion::SensorFusionService;
pub use sensors::manager::DeviceConnectionManager;
pub use session::{SessionEvent, SessionSummary, TrainingSession};
pub use storage::config::AppConfig;
pub use workouts::engine::PhaseEngine;
pub use workouts::types::TrainingPlan;
