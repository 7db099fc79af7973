//! Workout module: interval plans and the phase engine.

pub mod engine;
pub mod types;

pub use engine::PhaseEngine;
pub use types::{
    IntervalBlock, Phase, PhaseState, TrainingPlan, WorkoutError, WorkoutEvent,
};
