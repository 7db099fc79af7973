//! Metrics module for smoothing and zone tracking.

pub mod smoothing;
pub mod zones;

pub use smoothing::{RangeFilter, RollingAverage};
pub use zones::{TargetZone, ZoneStatus, ZoneTracker};
