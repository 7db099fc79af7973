//! Cadence target zones and time-in-zone tracking.

use serde::{Deserialize, Serialize};

/// A target zone defined as a center value with symmetric tolerance.
///
/// The zone is supplied externally per workout phase; the core never
/// hardcodes one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetZone {
    /// Target value (steps per minute for cadence zones)
    pub target: u16,
    /// Symmetric tolerance around the target
    pub tolerance: u16,
}

impl TargetZone {
    /// Create a new zone around `target` with the given tolerance.
    pub fn new(target: u16, tolerance: u16) -> Self {
        Self { target, tolerance }
    }

    /// Lower bound of the zone.
    pub fn lower(&self) -> u16 {
        self.target.saturating_sub(self.tolerance)
    }

    /// Upper bound of the zone.
    pub fn upper(&self) -> u16 {
        self.target.saturating_add(self.tolerance)
    }

    /// Check whether a value falls inside the zone.
    pub fn contains(&self, value: u16) -> bool {
        value >= self.lower() && value <= self.upper()
    }
}

impl std::fmt::Display for TargetZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{} spm", self.lower(), self.upper())
    }
}

/// Classification of a value against the active target zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneStatus {
    /// Inside the zone
    InZone,
    /// Below the zone by `deficit` units
    Below { deficit: u16 },
    /// Above the zone by `excess` units
    Above { excess: u16 },
}

impl ZoneStatus {
    /// Classify a value against a zone.
    pub fn classify(value: u16, zone: &TargetZone) -> Self {
        let lower = zone.lower();
        let upper = zone.upper();

        if value < lower {
            ZoneStatus::Below {
                deficit: lower - value,
            }
        } else if value > upper {
            ZoneStatus::Above {
                excess: value - upper,
            }
        } else {
            ZoneStatus::InZone
        }
    }

    /// Whether this status counts toward time-in-zone.
    pub fn is_in_zone(&self) -> bool {
        matches!(self, ZoneStatus::InZone)
    }
}

impl std::fmt::Display for ZoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ZoneStatus::InZone => write!(f, "in zone"),
            ZoneStatus::Below { deficit } => write!(f, "{} below zone", deficit),
            ZoneStatus::Above { excess } => write!(f, "{} above zone", excess),
        }
    }
}

/// Tracks zone compliance over time for the active target zone.
///
/// The tracker holds no opinion about workout phases; the caller binds the
/// phase-appropriate zone via `start_tracking` and drives `tick_second`.
#[derive(Debug, Default)]
pub struct ZoneTracker {
    /// The zone currently being tracked
    active_zone: Option<TargetZone>,
    /// Latest classification, updated on every accepted cadence sample
    last_status: Option<ZoneStatus>,
    /// Accumulated seconds spent in zone
    seconds_in_zone: u32,
    /// Whether the accumulator is advancing
    tracking: bool,
}

impl ZoneTracker {
    /// Create a new tracker with no active zone.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking against a zone, resetting the accumulator.
    pub fn start_tracking(&mut self, zone: TargetZone) {
        tracing::debug!("Zone tracking started: {}", zone);
        self.active_zone = Some(zone);
        self.last_status = None;
        self.seconds_in_zone = 0;
        self.tracking = true;
    }

    /// Freeze the accumulator, keeping its value.
    pub fn stop_tracking(&mut self) {
        self.tracking = false;
        self.active_zone = None;
        self.last_status = None;
    }

    /// Classify a cadence value against the active zone and record the result.
    ///
    /// Returns `None` when no zone is active.
    pub fn update(&mut self, cadence: u16) -> Option<ZoneStatus> {
        let zone = self.active_zone.as_ref()?;
        let status = ZoneStatus::classify(cadence, zone);
        self.last_status = Some(status);
        Some(status)
    }

    /// Advance the accumulator by one second if the latest status was in zone.
    ///
    /// Driven by a periodic 1-second tick while a session is running.
    pub fn tick_second(&mut self) {
        if self.tracking && self.last_status.map(|s| s.is_in_zone()).unwrap_or(false) {
            self.seconds_in_zone += 1;
        }
    }

    /// Accumulated seconds in zone since the last `start_tracking`.
    pub fn seconds_in_zone(&self) -> u32 {
        self.seconds_in_zone
    }

    /// Latest recorded classification.
    pub fn last_status(&self) -> Option<ZoneStatus> {
        self.last_status
    }

    /// The zone currently being tracked.
    pub fn active_zone(&self) -> Option<&TargetZone> {
        self.active_zone.as_ref()
    }

    /// Clear all state, including the accumulator.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
