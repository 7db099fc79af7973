//! Training session wiring: binds the phase engine's active zone to the
//! zone tracker and republishes everything external consumers need.
//!
//! The session owns the engine tick (100 ms, measured delta) and the
//! 1-second zone tick. Stopping the session aborts both; no timers
//! outlive teardown.

use crate::metrics::zones::{ZoneStatus, ZoneTracker};
use crate::sensors::fusion::{FusionEvent, SensorFusionService};
use crate::workouts::engine::PhaseEngine;
use crate::workouts::types::{Phase, TrainingPlan, WorkoutError, WorkoutEvent};
use crossbeam::channel::{Receiver, Sender};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Engine tick period; delta time is measured, so jitter does not drift
/// the clock.
const ENGINE_TICK: Duration = Duration::from_millis(100);

/// Events republished to display, audio and persistence collaborators.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Phase engine event
    Workout(WorkoutEvent),
    /// Zone classification changed
    ZoneStatusChanged {
        /// New classification
        status: ZoneStatus,
        /// Cadence that produced it
        cadence: u16,
    },
    /// Fused sensor sample or staleness flag
    Sensor(FusionEvent),
    /// The session ended, by completion or by stop
    Ended(SessionSummary),
}

/// Totals reported when a session ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    /// Wall-clock session length in seconds
    pub total_seconds: u64,
    /// Seconds in zone across all tracked phases
    pub seconds_in_zone: u32,
    /// Seconds in zone during work intervals only
    pub work_seconds_in_zone: u32,
}

/// Control messages for the session task.
#[derive(Debug)]
enum SessionCommand {
    Pause,
    Resume,
    SkipPhase,
    AddTime(u32),
    SubtractTime(u32),
    Stop,
}

/// A running interval session.
pub struct TrainingSession {
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    command_rx: Option<mpsc::UnboundedReceiver<SessionCommand>>,
    engine: Option<PhaseEngine>,
    fusion_rx: Option<mpsc::UnboundedReceiver<FusionEvent>>,
    event_tx: Option<Sender<SessionEvent>>,
    task: Option<JoinHandle<()>>,
}

impl TrainingSession {
    /// Create a session for the given plan.
    pub fn new(plan: TrainingPlan) -> Result<Self, WorkoutError> {
        let mut engine = PhaseEngine::new();
        engine.load(plan)?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        Ok(Self {
            command_tx,
            command_rx: Some(command_rx),
            engine: Some(engine),
            fusion_rx: None,
            event_tx: None,
            task: None,
        })
    }

    /// Register this session as an observer on the fusion service.
    /// Call before starting either service.
    pub fn attach_fusion(&mut self, fusion: &mut SensorFusionService) {
        let (tx, rx) = mpsc::unbounded_channel();
        fusion.register_observer(tx);
        self.fusion_rx = Some(rx);
    }

    /// Get an event receiver for session events. Call before `start`.
    pub fn event_receiver(&mut self) -> Receiver<SessionEvent> {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.event_tx = Some(tx);
        rx
    }

    /// Start the workout clock and spawn the session task.
    pub fn start(&mut self) {
        let mut engine = match self.engine.take() {
            Some(engine) => engine,
            None => {
                tracing::warn!("Session already started");
                return;
            }
        };
        let command_rx = match self.command_rx.take() {
            Some(rx) => rx,
            None => return,
        };

        let engine_events = engine.event_receiver();
        engine.start();

        let task = SessionTask {
            engine,
            engine_events,
            tracker: ZoneTracker::new(),
            fusion_rx: self.fusion_rx.take(),
            command_rx,
            event_tx: self.event_tx.clone(),
            last_zone_status: None,
            seconds_in_zone: 0,
            work_seconds_in_zone: 0,
            started_at: Instant::now(),
        };
        self.task = Some(tokio::spawn(task.run()));
    }

    /// Pause the workout clock.
    pub fn pause(&self) {
        let _ = self.command_tx.send(SessionCommand::Pause);
    }

    /// Resume the workout clock.
    pub fn resume(&self) {
        let _ = self.command_tx.send(SessionCommand::Resume);
    }

    /// Skip the remainder of the current phase.
    pub fn skip_phase(&self) {
        let _ = self.command_tx.send(SessionCommand::SkipPhase);
    }

    /// Extend the current phase.
    pub fn add_time(&self, seconds: u32) {
        let _ = self.command_tx.send(SessionCommand::AddTime(seconds));
    }

    /// Shorten the current phase.
    pub fn subtract_time(&self, seconds: u32) {
        let _ = self.command_tx.send(SessionCommand::SubtractTime(seconds));
    }

    /// End the session. The final [`SessionEvent::Ended`] carries the
    /// summary.
    pub fn stop(&self) {
        let _ = self.command_tx.send(SessionCommand::Stop);
    }

    /// Whether the session task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl Drop for TrainingSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct SessionTask {
    engine: PhaseEngine,
    engine_events: Receiver<WorkoutEvent>,
    tracker: ZoneTracker,
    fusion_rx: Option<mpsc::UnboundedReceiver<FusionEvent>>,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    event_tx: Option<Sender<SessionEvent>>,
    last_zone_status: Option<ZoneStatus>,
    seconds_in_zone: u32,
    work_seconds_in_zone: u32,
    started_at: Instant,
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

impl SessionTask {
    async fn run(mut self) {
        tracing::info!("Session started");
        let mut engine_interval = tokio::time::interval(ENGINE_TICK);
        engine_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut zone_interval = tokio::time::interval(Duration::from_secs(1));
        zone_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        // Bind the zone of the phase the engine started in.
        let completed = loop {
            if self.drain_engine_events() {
                break true;
            }

            tokio::select! {
                _ = engine_interval.tick() => {
                    let now = Instant::now();
                    let delta = now.duration_since(last_tick);
                    last_tick = now;
                    self.engine.tick(delta);
                }
                _ = zone_interval.tick() => {
                    if !self.engine.is_paused() {
                        self.tracker.tick_second();
                    }
                }
                maybe = recv_opt(&mut self.fusion_rx) => {
                    match maybe {
                        Some(event) => self.on_fusion_event(event),
                        None => self.fusion_rx = None,
                    }
                }
                Some(command) = self.command_rx.recv() => {
                    if matches!(command, SessionCommand::Stop) {
                        break false;
                    }
                    self.handle_command(command);
                }
            }
        };

        self.finish(completed);
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Pause => self.engine.pause(),
            SessionCommand::Resume => self.engine.resume(),
            SessionCommand::SkipPhase => self.engine.skip_to_next_phase(),
            SessionCommand::AddTime(seconds) => self.engine.add_time(seconds),
            SessionCommand::SubtractTime(seconds) => self.engine.subtract_time(seconds),
            SessionCommand::Stop => {}
        }
    }

    /// Forward engine events, rebinding the tracked zone on every phase
    /// change. Returns true when the workout completed.
    fn drain_engine_events(&mut self) -> bool {
        let mut completed = false;
        let events: Vec<WorkoutEvent> = self.engine_events.try_iter().collect();
        for event in events {
            if let WorkoutEvent::PhaseChanged { from, .. } = &event {
                self.bank_zone_time(*from);
                match self.engine.current_target_zone() {
                    Some(zone) => self.tracker.start_tracking(zone),
                    None => self.tracker.stop_tracking(),
                }
                self.last_zone_status = None;
            }
            if matches!(event, WorkoutEvent::WorkoutCompleted) {
                completed = true;
            }
            self.publish(SessionEvent::Workout(event));
        }
        completed
    }

    fn on_fusion_event(&mut self, event: FusionEvent) {
        if let FusionEvent::Cadence(sample) = &event {
            if let Some(status) = self.tracker.update(sample.spm) {
                if self.last_zone_status != Some(status) {
                    self.last_zone_status = Some(status);
                    self.publish(SessionEvent::ZoneStatusChanged {
                        status,
                        cadence: sample.spm,
                    });
                }
            }
        }
        self.publish(SessionEvent::Sensor(event));
    }

    /// Fold the tracker's accumulator into the session totals when a
    /// tracked phase ends.
    fn bank_zone_time(&mut self, phase: Phase) {
        let earned = self.tracker.seconds_in_zone();
        if earned > 0 {
            self.seconds_in_zone += earned;
            if phase == Phase::Work {
                self.work_seconds_in_zone += earned;
            }
        }
    }

    fn finish(&mut self, completed: bool) {
        self.bank_zone_time(self.engine.phase());
        self.tracker.stop_tracking();

        let summary = SessionSummary {
            total_seconds: self.started_at.elapsed().as_secs(),
            seconds_in_zone: self.seconds_in_zone,
            work_seconds_in_zone: self.work_seconds_in_zone,
        };
        tracing::info!(
            "Session {} after {}s, {}s in zone ({}s during work)",
            if completed { "completed" } else { "stopped" },
            summary.total_seconds,
            summary.seconds_in_zone,
            summary.work_seconds_in_zone
        );
        self.publish(SessionEvent::Ended(summary));
    }

    fn publish(&self, event: SessionEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}
