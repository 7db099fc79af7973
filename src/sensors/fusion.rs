//! Sensor fusion: merges device, pedometer-fallback and simulated sources
//! into one trustworthy heart-rate stream and one cadence stream.
//!
//! All arbitration happens in [`FusionCore`], a synchronous struct driven
//! by exactly one task. The connection-state read and the forward/drop
//! decision for a sample therefore cannot interleave with a concurrent
//! state transition.

use crate::metrics::smoothing::{RangeFilter, RollingAverage};
use crate::sensors::simulation::SimulatedSample;
use crate::sensors::types::{
    CadenceSample, ConnectionState, HeartRateSample, SensorEvent, SourceTag,
};
use crossbeam::channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Which fused stream a diagnostic refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Heart rate stream
    HeartRate,
    /// Cadence stream
    Cadence,
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Metric::HeartRate => write!(f, "heart rate"),
            Metric::Cadence => write!(f, "cadence"),
        }
    }
}

/// Configuration for validation, smoothing and arbitration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionConfig {
    /// Lowest plausible heart rate in bpm
    pub heart_rate_min: u16,
    /// Highest plausible heart rate in bpm
    pub heart_rate_max: u16,
    /// Lowest plausible running cadence in spm
    pub cadence_min: u16,
    /// Highest plausible running cadence in spm
    pub cadence_max: u16,
    /// Rolling window size for smoothing and outlier detection
    pub window_size: usize,
    /// Accepted samples required before the deviation gate applies
    pub min_samples_for_outlier: usize,
    /// Maximum heart-rate deviation from the window mean, in bpm
    pub heart_rate_max_deviation: u16,
    /// Seconds without an accepted sample before a stream is flagged stale
    pub data_timeout_secs: u64,
    /// Seconds a device cadence sample preempts fallback cadence
    pub device_cadence_live_secs: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            heart_rate_min: 30,
            heart_rate_max: 250,
            cadence_min: 100,
            cadence_max: 220,
            window_size: 5,
            min_samples_for_outlier: 3,
            heart_rate_max_deviation: 30,
            data_timeout_secs: 5,
            device_cadence_live_secs: 3,
        }
    }
}

/// Events published by the fusion service.
#[derive(Debug, Clone)]
pub enum FusionEvent {
    /// Fused heart-rate sample carrying the winning source tag
    HeartRate(HeartRateSample),
    /// Fused cadence sample carrying the winning source tag
    Cadence(CadenceSample),
    /// A stream stopped (or resumed) receiving data. Observable state,
    /// never an error.
    DataTimeout {
        /// Which stream
        metric: Metric,
        /// True when the stream went stale, false on recovery
        stale: bool,
    },
}

/// Snapshot of fusion state for observability.
#[derive(Debug, Clone, Default)]
pub struct FusionDiagnostics {
    /// Connection state the arbitration currently sees
    pub device_connected: bool,
    /// Samples in the heart-rate window
    pub heart_rate_window_len: usize,
    /// Samples in the cadence window
    pub cadence_window_len: usize,
    /// Latest published heart rate
    pub heart_rate: Option<u16>,
    /// Latest published cadence
    pub cadence: Option<u16>,
    /// Heart-rate stream receiving data
    pub heart_rate_receiving: bool,
    /// Cadence stream receiving data
    pub cadence_receiving: bool,
}

/// Per-metric validation, outlier rejection and smoothing.
struct MetricPipeline {
    range: RangeFilter,
    window: RollingAverage,
    max_deviation: Option<u16>,
    min_samples_for_outlier: usize,
}

impl MetricPipeline {
    fn new(
        range: RangeFilter,
        window_size: usize,
        max_deviation: Option<u16>,
        min_samples_for_outlier: usize,
    ) -> Self {
        Self {
            range,
            window: RollingAverage::new(window_size),
            max_deviation,
            min_samples_for_outlier,
        }
    }

    /// Validate, gate and smooth a raw value. Returns the published
    /// (window-averaged) value, or `None` when the sample is rejected.
    fn accept(&mut self, value: u16) -> Option<u16> {
        let value = self.range.filter(value)?;

        if let Some(max_deviation) = self.max_deviation {
            // Below min_samples there is not enough history to judge.
            if self.window.len() >= self.min_samples_for_outlier {
                if let Some(mean) = self.window.mean() {
                    if (f32::from(value) - mean).abs() > f32::from(max_deviation) {
                        return None;
                    }
                }
            }
        }

        self.window.add(value)
    }

    fn reset(&mut self) {
        self.window.reset();
    }
}

/// The single arbitration point for all sources.
pub struct FusionCore {
    config: FusionConfig,
    connection_state: ConnectionState,
    heart_rate: MetricPipeline,
    cadence: MetricPipeline,
    last_device_cadence: Option<Instant>,
    last_heart_rate_accepted: Option<Instant>,
    last_cadence_accepted: Option<Instant>,
    heart_rate_receiving: bool,
    cadence_receiving: bool,
    last_heart_rate: Option<u16>,
    last_cadence: Option<u16>,
    started_at: Instant,
}

impl FusionCore {
    /// Create a core with the given configuration.
    pub fn new(config: FusionConfig) -> Self {
        let heart_rate = MetricPipeline::new(
            RangeFilter::new(config.heart_rate_min, config.heart_rate_max),
            config.window_size,
            Some(config.heart_rate_max_deviation),
            config.min_samples_for_outlier,
        );
        let cadence = MetricPipeline::new(
            RangeFilter::new(config.cadence_min, config.cadence_max),
            config.window_size,
            None,
            config.min_samples_for_outlier,
        );

        Self {
            config,
            connection_state: ConnectionState::Disconnected,
            heart_rate,
            cadence,
            last_device_cadence: None,
            last_heart_rate_accepted: None,
            last_cadence_accepted: None,
            heart_rate_receiving: true,
            cadence_receiving: true,
            last_heart_rate: None,
            last_cadence: None,
            started_at: Instant::now(),
        }
    }

    /// Record a connection-state transition from the manager.
    pub fn on_connection_state(&mut self, state: ConnectionState) {
        tracing::debug!("Fusion sees connection state {}", state);
        self.connection_state = state;
    }

    /// Offer a heart-rate sample. Returns the fused sample to publish.
    pub fn offer_heart_rate(&mut self, sample: HeartRateSample) -> Option<HeartRateSample> {
        if sample.source != SourceTag::Device && self.connection_state.is_connected() {
            // Device stream owns the metric while connected.
            return None;
        }

        let smoothed = match self.heart_rate.accept(sample.bpm) {
            Some(v) => v,
            None => {
                tracing::debug!("Rejected heart-rate sample {} bpm", sample.bpm);
                return None;
            }
        };

        self.last_heart_rate_accepted = Some(sample.timestamp);
        self.last_heart_rate = Some(smoothed);
        Some(HeartRateSample {
            timestamp: sample.timestamp,
            bpm: smoothed,
            source: sample.source,
        })
    }

    /// Offer a cadence sample. Returns the fused sample to publish.
    ///
    /// A fallback sample is dropped while the device is connected and its
    /// cadence stream has produced a sample within the liveness window;
    /// a connected device whose cadence has gone silent does not starve
    /// the fallback.
    pub fn offer_cadence(&mut self, sample: CadenceSample) -> Option<CadenceSample> {
        if sample.source == SourceTag::Device {
            self.last_device_cadence = Some(sample.timestamp);
        } else if self.connection_state.is_connected()
            && self.device_cadence_live(sample.timestamp)
        {
            return None;
        }

        let smoothed = match self.cadence.accept(sample.spm) {
            Some(v) => v,
            None => {
                tracing::debug!("Rejected cadence sample {} spm", sample.spm);
                return None;
            }
        };

        self.last_cadence_accepted = Some(sample.timestamp);
        self.last_cadence = Some(smoothed);
        Some(CadenceSample {
            timestamp: sample.timestamp,
            spm: smoothed,
            source: sample.source,
        })
    }

    fn device_cadence_live(&self, now: Instant) -> bool {
        self.last_device_cadence
            .map(|t| {
                now.duration_since(t) <= Duration::from_secs(self.config.device_cadence_live_secs)
            })
            .unwrap_or(false)
    }

    /// Re-evaluate per-stream staleness. Returns flag-change events.
    pub fn check_staleness(&mut self, now: Instant) -> Vec<FusionEvent> {
        let timeout = Duration::from_secs(self.config.data_timeout_secs);
        let mut events = Vec::new();

        let hr_age = now.duration_since(self.last_heart_rate_accepted.unwrap_or(self.started_at));
        let hr_receiving = hr_age <= timeout;
        if hr_receiving != self.heart_rate_receiving {
            self.heart_rate_receiving = hr_receiving;
            tracing::info!(
                "Heart-rate stream {}",
                if hr_receiving { "recovered" } else { "stale" }
            );
            events.push(FusionEvent::DataTimeout {
                metric: Metric::HeartRate,
                stale: !hr_receiving,
            });
        }

        let cadence_age = now.duration_since(self.last_cadence_accepted.unwrap_or(self.started_at));
        let cadence_receiving = cadence_age <= timeout;
        if cadence_receiving != self.cadence_receiving {
            self.cadence_receiving = cadence_receiving;
            tracing::info!(
                "Cadence stream {}",
                if cadence_receiving { "recovered" } else { "stale" }
            );
            events.push(FusionEvent::DataTimeout {
                metric: Metric::Cadence,
                stale: !cadence_receiving,
            });
        }

        events
    }

    /// Current state snapshot.
    pub fn diagnostics(&self) -> FusionDiagnostics {
        FusionDiagnostics {
            device_connected: self.connection_state.is_connected(),
            heart_rate_window_len: self.heart_rate.window.len(),
            cadence_window_len: self.cadence.window.len(),
            heart_rate: self.last_heart_rate,
            cadence: self.last_cadence,
            heart_rate_receiving: self.heart_rate_receiving,
            cadence_receiving: self.cadence_receiving,
        }
    }

    /// Clear windows and staleness bookkeeping.
    pub fn reset(&mut self) {
        self.heart_rate.reset();
        self.cadence.reset();
        self.last_device_cadence = None;
        self.last_heart_rate_accepted = None;
        self.last_cadence_accepted = None;
        self.last_heart_rate = None;
        self.last_cadence = None;
        self.heart_rate_receiving = true;
        self.cadence_receiving = true;
        self.started_at = Instant::now();
    }
}

/// Owns the fusion task and its source channels.
pub struct SensorFusionService {
    config: FusionConfig,
    manager_rx: Option<mpsc::UnboundedReceiver<SensorEvent>>,
    fallback_rx: Option<mpsc::UnboundedReceiver<CadenceSample>>,
    simulation_rx: Option<mpsc::UnboundedReceiver<SimulatedSample>>,
    event_tx: Option<Sender<FusionEvent>>,
    observers: Vec<mpsc::UnboundedSender<FusionEvent>>,
    diagnostics_rx: watch::Receiver<FusionDiagnostics>,
    diagnostics_tx: Option<watch::Sender<FusionDiagnostics>>,
    task: Option<JoinHandle<()>>,
}

impl SensorFusionService {
    /// Create a service with the given configuration.
    pub fn new(config: FusionConfig) -> Self {
        let (diagnostics_tx, diagnostics_rx) = watch::channel(FusionDiagnostics::default());
        Self {
            config,
            manager_rx: None,
            fallback_rx: None,
            simulation_rx: None,
            event_tx: None,
            observers: Vec::new(),
            diagnostics_rx,
            diagnostics_tx: Some(diagnostics_tx),
            task: None,
        }
    }

    /// Register this service as an observer on the connection manager.
    /// Call before starting either service.
    pub fn attach_manager(&mut self, manager: &mut crate::sensors::manager::DeviceConnectionManager) {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.register_observer(tx);
        self.manager_rx = Some(rx);
    }

    /// Attach the pedometer-style fallback cadence channel.
    pub fn attach_fallback(&mut self, rx: mpsc::UnboundedReceiver<CadenceSample>) {
        self.fallback_rx = Some(rx);
    }

    /// Attach the simulation generator channel.
    pub fn attach_simulation(&mut self, rx: mpsc::UnboundedReceiver<SimulatedSample>) {
        self.simulation_rx = Some(rx);
    }

    /// Get an event receiver for external consumers. Call before `start`.
    pub fn event_receiver(&mut self) -> Receiver<FusionEvent> {
        let (tx, rx) = crossbeam::channel::unbounded();
        self.event_tx = Some(tx);
        rx
    }

    /// Register an async observer channel (used by the session).
    /// Call before `start`.
    pub fn register_observer(&mut self, observer: mpsc::UnboundedSender<FusionEvent>) {
        self.observers.push(observer);
    }

    /// Watch fusion diagnostics without consuming events.
    pub fn diagnostics_watch(&self) -> watch::Receiver<FusionDiagnostics> {
        self.diagnostics_rx.clone()
    }

    /// Spawn the fusion task.
    pub fn start(&mut self) {
        let diagnostics_tx = match self.diagnostics_tx.take() {
            Some(tx) => tx,
            None => {
                tracing::warn!("Fusion service already started");
                return;
            }
        };

        let task = FusionTask {
            core: FusionCore::new(self.config.clone()),
            manager_rx: self.manager_rx.take(),
            fallback_rx: self.fallback_rx.take(),
            simulation_rx: self.simulation_rx.take(),
            event_tx: self.event_tx.clone(),
            observers: std::mem::take(&mut self.observers),
            diagnostics_tx,
        };
        self.task = Some(tokio::spawn(task.run()));
    }

    /// Abort the fusion task. Part of session teardown.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SensorFusionService {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FusionTask {
    core: FusionCore,
    manager_rx: Option<mpsc::UnboundedReceiver<SensorEvent>>,
    fallback_rx: Option<mpsc::UnboundedReceiver<CadenceSample>>,
    simulation_rx: Option<mpsc::UnboundedReceiver<SimulatedSample>>,
    event_tx: Option<Sender<FusionEvent>>,
    observers: Vec<mpsc::UnboundedSender<FusionEvent>>,
    diagnostics_tx: watch::Sender<FusionDiagnostics>,
}

/// Receive from an optional channel; pending forever when absent.
async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

impl FusionTask {
    async fn run(mut self) {
        tracing::info!("Fusion service started");
        let mut staleness_interval = tokio::time::interval(Duration::from_secs(1));
        staleness_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                maybe = recv_opt(&mut self.manager_rx) => {
                    match maybe {
                        Some(event) => self.on_manager_event(event),
                        None => self.manager_rx = None,
                    }
                }
                maybe = recv_opt(&mut self.fallback_rx) => {
                    match maybe {
                        Some(sample) => self.offer_cadence(sample),
                        None => self.fallback_rx = None,
                    }
                }
                maybe = recv_opt(&mut self.simulation_rx) => {
                    match maybe {
                        Some(SimulatedSample::HeartRate(sample)) => self.offer_heart_rate(sample),
                        Some(SimulatedSample::Cadence(sample)) => self.offer_cadence(sample),
                        None => self.simulation_rx = None,
                    }
                }
                _ = staleness_interval.tick() => {
                    for event in self.core.check_staleness(Instant::now()) {
                        self.publish(event);
                    }
                    let _ = self.diagnostics_tx.send(self.core.diagnostics());
                }
            }
        }
    }

    fn on_manager_event(&mut self, event: SensorEvent) {
        match event {
            SensorEvent::ConnectionChanged(state) => self.core.on_connection_state(state),
            SensorEvent::HeartRate(sample) => self.offer_heart_rate(sample),
            SensorEvent::Cadence(sample) => self.offer_cadence(sample),
            SensorEvent::FallbackActivated { reason } => {
                tracing::info!("Fallback sources active: {}", reason);
            }
            _ => {}
        }
    }

    fn offer_heart_rate(&mut self, sample: HeartRateSample) {
        if let Some(fused) = self.core.offer_heart_rate(sample) {
            self.publish(FusionEvent::HeartRate(fused));
        }
    }

    fn offer_cadence(&mut self, sample: CadenceSample) {
        if let Some(fused) = self.core.offer_cadence(sample) {
            self.publish(FusionEvent::Cadence(fused));
        }
    }

    fn publish(&mut self, event: FusionEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event.clone());
        }
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_hr(bpm: u16) -> HeartRateSample {
        HeartRateSample {
            timestamp: Instant::now(),
            bpm,
            source: SourceTag::Device,
        }
    }

    fn cadence(spm: u16, source: SourceTag) -> CadenceSample {
        CadenceSample {
            timestamp: Instant::now(),
            spm,
            source,
        }
    }

    fn connected() -> ConnectionState {
        ConnectionState::Connected {
            device_name: "Test HRM".to_string(),
        }
    }

    #[test]
    fn test_heart_rate_range_validation() {
        let mut core = FusionCore::new(FusionConfig::default());

        assert!(core.offer_heart_rate(device_hr(29)).is_none());
        assert!(core.offer_heart_rate(device_hr(251)).is_none());
        assert!(core.offer_heart_rate(device_hr(30)).is_some());
        assert!(core.offer_heart_rate(device_hr(250)).is_some());
    }

    #[test]
    fn test_cadence_range_validation() {
        let mut core = FusionCore::new(FusionConfig::default());

        assert!(core.offer_cadence(cadence(99, SourceTag::Device)).is_none());
        assert!(core.offer_cadence(cadence(221, SourceTag::Device)).is_none());
        assert!(core.offer_cadence(cadence(100, SourceTag::Device)).is_some());
        assert!(core.offer_cadence(cadence(220, SourceTag::Device)).is_some());
    }

    #[test]
    fn test_outlier_rejected_after_window_fills() {
        let mut core = FusionCore::new(FusionConfig::default());

        for bpm in [160, 162, 158, 161, 159] {
            assert!(core.offer_heart_rate(device_hr(bpm)).is_some());
        }

        // Deviation 45 > 30: rejected, published value stays near 160.
        assert!(core.offer_heart_rate(device_hr(205)).is_none());
        let published = core.diagnostics().heart_rate.unwrap();
        assert!((i32::from(published) - 160).abs() <= 1);
    }

    #[test]
    fn test_first_samples_accepted_unconditionally() {
        let mut core = FusionCore::new(FusionConfig::default());

        // Large jumps with fewer than 3 samples of history pass through.
        assert!(core.offer_heart_rate(device_hr(60)).is_some());
        assert!(core.offer_heart_rate(device_hr(180)).is_some());
        assert!(core.offer_heart_rate(device_hr(70)).is_some());
    }

    #[test]
    fn test_cadence_has_no_deviation_cutoff() {
        let mut core = FusionCore::new(FusionConfig::default());

        for spm in [160, 162, 158, 161, 159] {
            assert!(core.offer_cadence(cadence(spm, SourceTag::Device)).is_some());
        }
        // Same magnitude of jump that heart rate rejects.
        assert!(core.offer_cadence(cadence(205, SourceTag::Device)).is_some());
    }

    #[test]
    fn test_published_value_is_window_average() {
        let mut core = FusionCore::new(FusionConfig::default());

        core.offer_heart_rate(device_hr(160));
        core.offer_heart_rate(device_hr(162));
        let fused = core.offer_heart_rate(device_hr(158)).unwrap();
        assert_eq!(fused.bpm, 160);
    }

    #[test]
    fn test_device_wins_while_connected() {
        let mut core = FusionCore::new(FusionConfig::default());
        core.on_connection_state(connected());

        let fused = core.offer_cadence(cadence(170, SourceTag::Device)).unwrap();
        assert_eq!(fused.source, SourceTag::Device);

        // Simultaneous fallback sample for the same metric drops.
        assert!(core
            .offer_cadence(cadence(168, SourceTag::PedometerFallback))
            .is_none());
        assert!(core
            .offer_heart_rate(HeartRateSample {
                timestamp: Instant::now(),
                bpm: 150,
                source: SourceTag::PedometerFallback,
            })
            .is_none());
    }

    #[test]
    fn test_fallback_takes_over_on_disconnect() {
        let mut core = FusionCore::new(FusionConfig::default());
        core.on_connection_state(connected());
        core.offer_cadence(cadence(170, SourceTag::Device));

        core.on_connection_state(ConnectionState::Reconnecting { attempt: 1 });

        // First fallback sample after the drop is forwarded with its tag,
        // even though a device sample is recent.
        let fused = core
            .offer_cadence(cadence(168, SourceTag::PedometerFallback))
            .unwrap();
        assert_eq!(fused.source, SourceTag::PedometerFallback);
    }

    #[test]
    fn test_fallback_cadence_when_device_cadence_silent() {
        let config = FusionConfig {
            device_cadence_live_secs: 3,
            ..Default::default()
        };
        let mut core = FusionCore::new(config);
        core.on_connection_state(connected());

        let t0 = Instant::now();
        core.offer_cadence(CadenceSample {
            timestamp: t0,
            spm: 170,
            source: SourceTag::Device,
        });

        // Within the liveness window the fallback is preempted.
        assert!(core
            .offer_cadence(CadenceSample {
                timestamp: t0 + Duration::from_secs(2),
                spm: 165,
                source: SourceTag::PedometerFallback,
            })
            .is_none());

        // Past it, a connected but silent device no longer preempts.
        let fused = core
            .offer_cadence(CadenceSample {
                timestamp: t0 + Duration::from_secs(4),
                spm: 165,
                source: SourceTag::PedometerFallback,
            })
            .unwrap();
        assert_eq!(fused.source, SourceTag::PedometerFallback);
    }

    #[test]
    fn test_simulated_samples_forwarded_when_disconnected() {
        let mut core = FusionCore::new(FusionConfig::default());

        let fused = core.offer_cadence(cadence(150, SourceTag::Simulated)).unwrap();
        assert_eq!(fused.source, SourceTag::Simulated);
    }

    #[test]
    fn test_staleness_flags() {
        let mut core = FusionCore::new(FusionConfig::default());
        let start = Instant::now();

        // Nothing accepted: both streams stale after the timeout window.
        let events = core.check_staleness(start + Duration::from_secs(6));
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(
            e,
            FusionEvent::DataTimeout { stale: true, .. }
        )));

        // An accepted sample recovers the stream on the next check.
        core.offer_cadence(CadenceSample {
            timestamp: start + Duration::from_secs(7),
            spm: 170,
            source: SourceTag::Simulated,
        });
        let events = core.check_staleness(start + Duration::from_secs(8));
        assert!(events.iter().any(|e| matches!(
            e,
            FusionEvent::DataTimeout {
                metric: Metric::Cadence,
                stale: false
            }
        )));
        assert!(core.diagnostics().cadence_receiving);
        assert!(!core.diagnostics().heart_rate_receiving);
    }

    #[test]
    fn test_staleness_flag_emitted_once() {
        let mut core = FusionCore::new(FusionConfig::default());
        let start = Instant::now();

        let first = core.check_staleness(start + Duration::from_secs(6));
        assert!(!first.is_empty());
        let second = core.check_staleness(start + Duration::from_secs(7));
        assert!(second.is_empty());
    }

    #[test]
    fn test_reset_clears_windows() {
        let mut core = FusionCore::new(FusionConfig::default());
        core.offer_heart_rate(device_hr(150));
        core.reset();

        let diag = core.diagnostics();
        assert_eq!(diag.heart_rate_window_len, 0);
        assert_eq!(diag.heart_rate, None);
    }
}
