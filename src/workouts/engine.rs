//! Interval phase engine.
//!
//! A wall-clock state machine driven by `tick(delta)` from a
//! display-rate timer. It never reads sensor data; zone binding is done by
//! the consumer using [`PhaseEngine::current_target_zone`].

use crate::metrics::zones::TargetZone;
use crate::workouts::types::{
    Phase, PhaseState, TrainingPlan, WorkoutError, WorkoutEvent,
};
use crossbeam::channel::{Receiver, Sender};
use std::collections::HashSet;
use std::time::Duration;

/// Remaining-seconds thresholds that trigger a time warning.
const TIME_WARNING_THRESHOLDS: [u32; 6] = [30, 10, 5, 3, 2, 1];

/// Interval workout state machine.
pub struct PhaseEngine {
    /// Loaded plan, if any
    plan: Option<TrainingPlan>,
    /// Current phase state; mutated only by this engine
    state: PhaseState,
    /// Gates elapsed-time accumulation without touching the phase
    paused: bool,
    /// Thresholds already announced for the current phase
    announced: HashSet<u32>,
    /// Event channel for external consumers
    event_tx: Option<Sender<WorkoutEvent>>,
}

impl PhaseEngine {
    /// Create an engine with no plan loaded.
    pub fn new() -> Self {
        Self {
            plan: None,
            state: PhaseState::idle(),
            paused: false,
            announced: HashSet::new(),
            event_tx: None,
        }
    }

    /// Get an event receiver for workout events. Call before `start`.
    pub fn event_receiver(&mut self) -> Receiver<WorkoutEvent> {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.event_tx = Some(tx);
        rx
    }

    /// Load a plan, resetting any previous execution state.
    pub fn load(&mut self, plan: TrainingPlan) -> Result<(), WorkoutError> {
        plan.validate()?;
        tracing::info!(
            "Plan loaded: {} ({} blocks x {} series)",
            plan.name,
            plan.blocks.len(),
            plan.series
        );
        self.state = PhaseState::idle();
        self.paused = false;
        self.announced.clear();
        self.plan = Some(plan);
        Ok(())
    }

    /// Start the loaded plan. Without a plan this is a logged no-op.
    pub fn start(&mut self) {
        let plan = match &self.plan {
            Some(plan) => plan,
            None => {
                tracing::warn!("start() called without a loaded plan");
                return;
            }
        };
        if self.state.phase != Phase::Idle {
            tracing::warn!("start() called while {}", self.state.phase);
            return;
        }

        self.state.total_series = plan.series;
        self.state.total_blocks = plan.blocks.len() as u32;
        self.state.series_index = 1;
        self.state.block_index = 1;
        self.paused = false;

        let warmup = plan.warmup_seconds.unwrap_or(0);
        if warmup > 0 {
            self.enter_phase(Phase::Warmup, warmup);
        } else {
            self.enter_work();
        }
    }

    /// Advance the clock. Driven at display refresh rate; accumulation is
    /// gated while paused, so the timer itself never needs cancelling.
    pub fn tick(&mut self, delta: Duration) {
        if self.paused || !phase_is_active(self.state.phase) {
            return;
        }

        self.state.phase_elapsed += delta;
        self.emit_time_warnings();
        self.run_transitions();
    }

    /// Freeze elapsed-time accumulation without altering the phase.
    pub fn pause(&mut self) {
        if phase_is_active(self.state.phase) && !self.paused {
            self.paused = true;
            tracing::info!(
                "Paused in {} at {:?}",
                self.state.phase,
                self.state.phase_elapsed
            );
        }
    }

    /// Resume elapsed-time accumulation.
    pub fn resume(&mut self) {
        if self.paused {
            self.paused = false;
            tracing::info!("Resumed in {}", self.state.phase);
        }
    }

    /// Whether accumulation is currently paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Force the current phase to its end and transition immediately.
    pub fn skip_to_next_phase(&mut self) {
        if !phase_is_active(self.state.phase) {
            return;
        }
        tracing::info!("Skipping remainder of {}", self.state.phase);
        self.state.phase_elapsed = self.state.phase_duration;
        self.run_transitions();
    }

    /// Extend the current phase by `seconds`.
    pub fn add_time(&mut self, seconds: u32) {
        if !phase_is_active(self.state.phase) {
            return;
        }
        self.state.phase_duration += Duration::from_secs(u64::from(seconds));
        tracing::debug!(
            "Phase duration extended to {:?}",
            self.state.phase_duration
        );
    }

    /// Shorten the current phase by `seconds`, clamping remaining time at
    /// zero. The transition fires on the next tick.
    pub fn subtract_time(&mut self, seconds: u32) {
        if !phase_is_active(self.state.phase) {
            return;
        }
        let reduced = self
            .state
            .phase_duration
            .saturating_sub(Duration::from_secs(u64::from(seconds)));
        self.state.phase_duration = reduced.max(self.state.phase_elapsed);
        tracing::debug!(
            "Phase duration reduced to {:?}",
            self.state.phase_duration
        );
    }

    /// Return to idle, keeping the loaded plan.
    pub fn reset(&mut self) {
        self.state = PhaseState::idle();
        self.paused = false;
        self.announced.clear();
    }

    /// Current phase state snapshot.
    pub fn state(&self) -> &PhaseState {
        &self.state
    }

    /// Active phase.
    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Whether a plan is loaded.
    pub fn has_plan(&self) -> bool {
        self.plan.is_some()
    }

    /// Target zone for the active phase, from the plan.
    pub fn current_target_zone(&self) -> Option<TargetZone> {
        let plan = self.plan.as_ref()?;
        match self.state.phase {
            Phase::Warmup => plan.warmup_zone,
            Phase::Work => self.current_block(plan).map(|b| b.work_zone),
            Phase::Rest => self.current_block(plan).and_then(|b| b.rest_zone),
            Phase::Cooldown => plan.cooldown_zone,
            Phase::Idle | Phase::Complete => None,
        }
    }

    fn current_block<'a>(
        &self,
        plan: &'a TrainingPlan,
    ) -> Option<&'a crate::workouts::types::IntervalBlock> {
        plan.blocks
            .get(self.state.block_index.saturating_sub(1) as usize)
    }

    /// Apply every transition the accumulated time has earned, carrying
    /// overshoot into the next phase so no transition is skipped.
    fn run_transitions(&mut self) {
        while phase_is_active(self.state.phase)
            && self.state.phase_elapsed >= self.state.phase_duration
        {
            let leftover = self.state.phase_elapsed - self.state.phase_duration;
            self.advance();
            if phase_is_active(self.state.phase) {
                self.state.phase_elapsed = leftover;
            }
        }
    }

    /// Perform one phase transition per the plan.
    fn advance(&mut self) {
        let plan = match self.plan.clone() {
            Some(plan) => plan,
            None => return,
        };

        match self.state.phase {
            Phase::Warmup => self.enter_work(),
            Phase::Work => {
                self.emit(WorkoutEvent::BlockCompleted {
                    series: self.state.series_index,
                    block: self.state.block_index,
                });
                let rest = self
                    .current_block(&plan)
                    .map(|b| b.rest_seconds)
                    .unwrap_or(0);
                self.enter_phase(Phase::Rest, rest);
            }
            Phase::Rest => {
                if self.state.block_index < self.state.total_blocks {
                    self.state.block_index += 1;
                    self.enter_work();
                } else {
                    self.emit(WorkoutEvent::SeriesCompleted {
                        series: self.state.series_index,
                    });
                    if self.state.series_index < self.state.total_series {
                        self.state.series_index += 1;
                        self.state.block_index = 1;
                        self.enter_work();
                    } else {
                        let cooldown = plan.cooldown_seconds.unwrap_or(0);
                        if cooldown > 0 {
                            self.enter_phase(Phase::Cooldown, cooldown);
                        } else {
                            self.complete();
                        }
                    }
                }
            }
            Phase::Cooldown => self.complete(),
            Phase::Idle | Phase::Complete => {}
        }
    }

    fn enter_work(&mut self) {
        let work = self
            .plan
            .as_ref()
            .and_then(|plan| {
                plan.blocks
                    .get(self.state.block_index.saturating_sub(1) as usize)
            })
            .map(|b| b.work_seconds)
            .unwrap_or(0);
        self.enter_phase(Phase::Work, work);
    }

    fn enter_phase(&mut self, to: Phase, duration_seconds: u32) {
        let from = self.state.phase;
        self.state.phase = to;
        self.state.phase_duration = Duration::from_secs(u64::from(duration_seconds));
        self.state.phase_elapsed = Duration::ZERO;
        self.announced.clear();

        tracing::info!(
            "{} -> {} ({}s, series {}/{}, block {}/{})",
            from,
            to,
            duration_seconds,
            self.state.series_index,
            self.state.total_series,
            self.state.block_index,
            self.state.total_blocks
        );
        self.emit(WorkoutEvent::PhaseChanged {
            from,
            to,
            state: self.state.clone(),
        });
    }

    fn complete(&mut self) {
        let from = self.state.phase;
        self.state.phase = Phase::Complete;
        self.state.phase_duration = Duration::ZERO;
        self.state.phase_elapsed = Duration::ZERO;
        self.announced.clear();

        tracing::info!("Workout complete");
        self.emit(WorkoutEvent::PhaseChanged {
            from,
            to: Phase::Complete,
            state: self.state.clone(),
        });
        self.emit(WorkoutEvent::WorkoutCompleted);
    }

    fn emit_time_warnings(&mut self) {
        let remaining = self.state.phase_remaining().as_secs_f64();
        if remaining <= 0.0 {
            return;
        }
        let duration = self.state.phase_duration.as_secs_f64();
        let phase = self.state.phase;

        for threshold in TIME_WARNING_THRESHOLDS {
            // Thresholds at or above the whole phase length never announce.
            if f64::from(threshold) < duration
                && remaining <= f64::from(threshold)
                && self.announced.insert(threshold)
            {
                self.emit(WorkoutEvent::TimeWarning {
                    phase,
                    remaining_seconds: threshold,
                });
            }
        }
    }

    fn emit(&self, event: WorkoutEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

impl Default for PhaseEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn phase_is_active(phase: Phase) -> bool {
    matches!(
        phase,
        Phase::Warmup | Phase::Work | Phase::Rest | Phase::Cooldown
    )
}
