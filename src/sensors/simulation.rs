//! Simulated sensor source for device-free sessions and testing.
//!
//! Emits cadence and heart-rate samples that ramp toward configured
//! targets with bounded random jitter. Only runs when explicitly enabled.

use crate::sensors::types::{CadenceSample, HeartRateSample, SourceTag};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A sample produced by the simulation generator.
#[derive(Debug, Clone, Copy)]
pub enum SimulatedSample {
    /// Simulated heart rate
    HeartRate(HeartRateSample),
    /// Simulated cadence
    Cadence(CadenceSample),
}

/// Configuration for the simulation generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Whether the generator runs at all
    pub enabled: bool,
    /// Cadence the generator ramps toward, in spm
    pub target_cadence_spm: u16,
    /// Heart rate the generator ramps toward, in bpm
    pub target_heart_rate_bpm: u16,
    /// Cadence at the first tick
    pub start_cadence_spm: u16,
    /// Heart rate at the first tick
    pub start_heart_rate_bpm: u16,
    /// Maximum cadence change per tick
    pub cadence_step_spm: u16,
    /// Maximum heart-rate change per tick
    pub heart_rate_step_bpm: u16,
    /// Bound on random jitter added to each emitted value
    pub jitter: u16,
    /// Emission interval in milliseconds
    pub interval_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_cadence_spm: 170,
            target_heart_rate_bpm: 155,
            start_cadence_spm: 140,
            start_heart_rate_bpm: 95,
            cadence_step_spm: 2,
            heart_rate_step_bpm: 3,
            jitter: 2,
            interval_ms: 1000,
        }
    }
}

/// Move `current` toward `target` by at most `max_step`.
fn step_toward(current: f32, target: f32, max_step: f32) -> f32 {
    let delta = target - current;
    if delta.abs() <= max_step {
        target
    } else {
        current + max_step * delta.signum()
    }
}

/// Simulated cadence/heart-rate generator task.
pub struct SimulatedSensor {
    config: SimulationConfig,
    sample_tx: mpsc::UnboundedSender<SimulatedSample>,
    sample_rx: Option<mpsc::UnboundedReceiver<SimulatedSample>>,
    task: Option<JoinHandle<()>>,
}

impl SimulatedSensor {
    /// Create a generator with the given configuration.
    pub fn new(config: SimulationConfig) -> Self {
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        Self {
            config,
            sample_tx,
            sample_rx: Some(sample_rx),
            task: None,
        }
    }

    /// Take the sample receiver. Yields `None` after the first call.
    pub fn take_samples(&mut self) -> Option<mpsc::UnboundedReceiver<SimulatedSample>> {
        self.sample_rx.take()
    }

    /// Spawn the generator task.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let config = self.config.clone();
        let sample_tx = self.sample_tx.clone();

        self.task = Some(tokio::spawn(async move {
            tracing::info!(
                "Simulation started: ramping to {} spm / {} bpm",
                config.target_cadence_spm,
                config.target_heart_rate_bpm
            );

            let mut cadence = f32::from(config.start_cadence_spm);
            let mut heart_rate = f32::from(config.start_heart_rate_bpm);
            let mut interval =
                tokio::time::interval(Duration::from_millis(config.interval_ms.max(10)));

            loop {
                interval.tick().await;

                cadence = step_toward(
                    cadence,
                    f32::from(config.target_cadence_spm),
                    f32::from(config.cadence_step_spm),
                );
                heart_rate = step_toward(
                    heart_rate,
                    f32::from(config.target_heart_rate_bpm),
                    f32::from(config.heart_rate_step_bpm),
                );

                let jitter = i32::from(config.jitter);
                let mut rng = rand::thread_rng();
                let cadence_out =
                    (cadence as i32 + rng.gen_range(-jitter..=jitter)).max(0) as u16;
                let heart_rate_out =
                    (heart_rate as i32 + rng.gen_range(-jitter..=jitter)).max(0) as u16;

                let now = Instant::now();
                let cadence_sent = sample_tx.send(SimulatedSample::Cadence(CadenceSample {
                    timestamp: now,
                    spm: cadence_out,
                    source: SourceTag::Simulated,
                }));
                let heart_rate_sent =
                    sample_tx.send(SimulatedSample::HeartRate(HeartRateSample {
                        timestamp: now,
                        bpm: heart_rate_out,
                        source: SourceTag::Simulated,
                    }));
                if cadence_sent.is_err() || heart_rate_sent.is_err() {
                    return;
                }
            }
        }));
    }

    /// Abort the generator task. Part of session teardown.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("Simulation stopped");
        }
    }
}

impl Drop for SimulatedSensor {
    fn drop(&mut self) {
        self.stop();
    }
}
