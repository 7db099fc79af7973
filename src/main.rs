//! RunPulse demo binary.
//!
//! Runs a short interval session against the simulated sensor source and
//! logs the event stream. Real deployments embed the library and wire the
//! connection manager to actual hardware.

use runpulse::metrics::zones::TargetZone;
use runpulse::sensors::fusion::SensorFusionService;
use runpulse::sensors::simulation::{SimulatedSensor, SimulationConfig};
use runpulse::session::{SessionEvent, TrainingSession};
use runpulse::storage::config::AppConfig;
use runpulse::workouts::types::{IntervalBlock, TrainingPlan};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn demo_plan() -> TrainingPlan {
    TrainingPlan {
        name: "Demo intervals".to_string(),
        warmup_seconds: Some(10),
        warmup_zone: None,
        blocks: vec![IntervalBlock {
            work_seconds: 20,
            rest_seconds: 10,
            work_zone: TargetZone::new(170, 5),
            rest_zone: Some(TargetZone::new(150, 10)),
        }],
        series: 2,
        cooldown_seconds: Some(10),
        cooldown_zone: None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting RunPulse v{}", env!("CARGO_PKG_VERSION"));

    let config_path = AppConfig::default_path()?;
    let config = AppConfig::load(&config_path)?;

    // Simulated source in place of hardware for the demo session.
    let mut simulation = SimulatedSensor::new(SimulationConfig {
        enabled: true,
        interval_ms: 1000,
        ..config.simulation
    });

    let mut fusion = SensorFusionService::new(config.fusion.clone());
    if let Some(samples) = simulation.take_samples() {
        fusion.attach_simulation(samples);
    }

    let mut session = TrainingSession::new(demo_plan())?;
    session.attach_fusion(&mut fusion);
    let events = session.event_receiver();

    fusion.start();
    simulation.start();
    session.start();

    // Drain session events until the workout ends.
    let summary = tokio::task::spawn_blocking(move || {
        loop {
            match events.recv() {
                Ok(SessionEvent::Workout(event)) => tracing::info!("workout: {:?}", event),
                Ok(SessionEvent::ZoneStatusChanged { status, cadence }) => {
                    tracing::info!("cadence {} spm: {}", cadence, status)
                }
                Ok(SessionEvent::Sensor(event)) => tracing::debug!("sensor: {:?}", event),
                Ok(SessionEvent::Ended(summary)) => break Ok(summary),
                Err(e) => break Err(anyhow::anyhow!("session channel closed: {e}")),
            }
        }
    })
    .await??;

    simulation.stop();
    fusion.stop();

    tracing::info!(
        "Done: {}s total, {}s in zone ({}s during work)",
        summary.total_seconds,
        summary.seconds_in_zone,
        summary.work_seconds_in_zone
    );
    Ok(())
}
