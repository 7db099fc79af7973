//! Interval plan types, phase state and workout events.

use crate::metrics::zones::TargetZone;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Phase of an interval workout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No workout running
    #[default]
    Idle,
    /// Pre-workout warmup
    Warmup,
    /// Work interval
    Work,
    /// Recovery interval
    Rest,
    /// Post-workout cooldown
    Cooldown,
    /// Workout finished; terminal until reset
    Complete,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "Idle"),
            Phase::Warmup => write!(f, "Warmup"),
            Phase::Work => write!(f, "Work"),
            Phase::Rest => write!(f, "Rest"),
            Phase::Cooldown => write!(f, "Cooldown"),
            Phase::Complete => write!(f, "Complete"),
        }
    }
}

/// One work/rest pairing within a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalBlock {
    /// Work interval duration in seconds
    pub work_seconds: u32,
    /// Rest interval duration in seconds
    pub rest_seconds: u32,
    /// Target cadence zone during work
    pub work_zone: TargetZone,
    /// Target cadence zone during rest, if any
    pub rest_zone: Option<TargetZone>,
}

/// An interval training plan: optional warmup, blocks repeated per series,
/// optional cooldown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingPlan {
    /// Plan display name
    pub name: String,
    /// Warmup duration in seconds; zero or absent skips the phase
    pub warmup_seconds: Option<u32>,
    /// Target zone during warmup, if tracked
    pub warmup_zone: Option<TargetZone>,
    /// Ordered work/rest blocks executed once per series
    pub blocks: Vec<IntervalBlock>,
    /// Number of times the block list repeats
    pub series: u32,
    /// Cooldown duration in seconds; zero or absent skips the phase
    pub cooldown_seconds: Option<u32>,
    /// Target zone during cooldown, if tracked
    pub cooldown_zone: Option<TargetZone>,
}

impl TrainingPlan {
    /// Validate the plan's structure.
    pub fn validate(&self) -> Result<(), WorkoutError> {
        if self.blocks.is_empty() {
            return Err(WorkoutError::InvalidPlan(
                "plan has no interval blocks".to_string(),
            ));
        }
        if self.series == 0 {
            return Err(WorkoutError::InvalidPlan(
                "series count must be at least 1".to_string(),
            ));
        }
        if self.blocks.iter().any(|b| b.work_seconds == 0) {
            return Err(WorkoutError::InvalidPlan(
                "work intervals must have a non-zero duration".to_string(),
            ));
        }
        Ok(())
    }

    /// Total planned duration in seconds.
    pub fn total_seconds(&self) -> u32 {
        let per_series: u32 = self
            .blocks
            .iter()
            .map(|b| b.work_seconds + b.rest_seconds)
            .sum();
        self.warmup_seconds.unwrap_or(0)
            + per_series * self.series
            + self.cooldown_seconds.unwrap_or(0)
    }
}

/// Snapshot of the phase engine's state. Owned and mutated exclusively by
/// the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseState {
    /// Active phase
    pub phase: Phase,
    /// 1-based series counter; never exceeds `total_series`
    pub series_index: u32,
    /// Total series in the plan
    pub total_series: u32,
    /// 1-based block counter within the series; never exceeds `total_blocks`
    pub block_index: u32,
    /// Blocks per series
    pub total_blocks: u32,
    /// Time accumulated in the active phase
    pub phase_elapsed: Duration,
    /// Duration of the active phase
    pub phase_duration: Duration,
}

impl PhaseState {
    /// Initial idle state.
    pub fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            series_index: 0,
            total_series: 0,
            block_index: 0,
            total_blocks: 0,
            phase_elapsed: Duration::ZERO,
            phase_duration: Duration::ZERO,
        }
    }

    /// Remaining time in the active phase.
    pub fn phase_remaining(&self) -> Duration {
        self.phase_duration.saturating_sub(self.phase_elapsed)
    }
}

/// Events emitted by the phase engine.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkoutEvent {
    /// The engine transitioned between phases
    PhaseChanged {
        /// Phase being left
        from: Phase,
        /// Phase being entered
        to: Phase,
        /// State after the transition
        state: PhaseState,
    },
    /// A remaining-time threshold was crossed; fired once per threshold
    /// per phase
    TimeWarning {
        /// Active phase
        phase: Phase,
        /// Threshold in seconds
        remaining_seconds: u32,
    },
    /// A work interval finished
    BlockCompleted {
        /// Series the block belongs to
        series: u32,
        /// Block index within the series
        block: u32,
    },
    /// The final rest of a series finished
    SeriesCompleted {
        /// Completed series index
        series: u32,
    },
    /// The whole workout finished
    WorkoutCompleted,
}

/// Errors related to workout plans and engine operations.
#[derive(Debug, Error)]
pub enum WorkoutError {
    /// Plan failed structural validation
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Operation requires a loaded plan
    #[error("No plan loaded")]
    NoPlanLoaded,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(work: u32, rest: u32) -> IntervalBlock {
        IntervalBlock {
            work_seconds: work,
            rest_seconds: rest,
            work_zone: TargetZone::new(170, 5),
            rest_zone: Some(TargetZone::new(150, 10)),
        }
    }

    #[test]
    fn test_plan_validation() {
        let plan = TrainingPlan {
            name: "Intervals".to_string(),
            warmup_seconds: Some(300),
            warmup_zone: None,
            blocks: vec![block(180, 180)],
            series: 2,
            cooldown_seconds: Some(300),
            cooldown_zone: None,
        };
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_plan_rejects_empty_blocks() {
        let plan = TrainingPlan {
            name: "Empty".to_string(),
            warmup_seconds: None,
            warmup_zone: None,
            blocks: vec![],
            series: 1,
            cooldown_seconds: None,
            cooldown_zone: None,
        };
        assert!(matches!(
            plan.validate(),
            Err(WorkoutError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_plan_rejects_zero_series() {
        let plan = TrainingPlan {
            name: "Zero".to_string(),
            warmup_seconds: None,
            warmup_zone: None,
            blocks: vec![block(60, 60)],
            series: 0,
            cooldown_seconds: None,
            cooldown_zone: None,
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_plan_total_duration() {
        let plan = TrainingPlan {
            name: "Total".to_string(),
            warmup_seconds: Some(300),
            warmup_zone: None,
            blocks: vec![block(180, 120), block(60, 60)],
            series: 2,
            cooldown_seconds: Some(240),
            cooldown_zone: None,
        };
        // 300 + (300 + 120) * 2 + 240
        assert_eq!(plan.total_seconds(), 300 + 420 * 2 + 240);
    }

    #[test]
    fn test_phase_remaining_saturates() {
        let mut state = PhaseState::idle();
        state.phase_duration = Duration::from_secs(10);
        state.phase_elapsed = Duration::from_secs(12);
        assert_eq!(state.phase_remaining(), Duration::ZERO);
    }
}
