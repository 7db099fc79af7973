//! Pedometer-style fallback cadence source.
//!
//! The platform step counter lives outside this crate; it is bridged in
//! through [`CadenceSource`] so the fusion service can consume it like any
//! other channel, and tests can drive it deterministically.

use crate::sensors::types::{CadenceSample, SourceTag};
use std::time::Instant;
use tokio::sync::mpsc;

/// A fallback source of cadence samples.
pub trait CadenceSource: Send {
    /// Take the sample receiver. Yields `None` after the first call.
    fn take_samples(&mut self) -> Option<mpsc::UnboundedReceiver<CadenceSample>>;

    /// Begin producing samples.
    fn start(&mut self);

    /// Stop producing samples.
    fn stop(&mut self);
}

/// Push-style cadence source fed by an external pedometer bridge.
///
/// The platform side pushes raw step rates via [`ChannelCadenceSource::push`];
/// samples are tagged `PedometerFallback` and timestamped on arrival.
pub struct ChannelCadenceSource {
    sample_tx: mpsc::UnboundedSender<CadenceSample>,
    sample_rx: Option<mpsc::UnboundedReceiver<CadenceSample>>,
    running: bool,
}

impl ChannelCadenceSource {
    /// Create a new source.
    pub fn new() -> Self {
        let (sample_tx, sample_rx) = mpsc::unbounded_channel();
        Self {
            sample_tx,
            sample_rx: Some(sample_rx),
            running: false,
        }
    }

    /// A handle the platform bridge uses to push step rates.
    pub fn pusher(&self) -> CadencePusher {
        CadencePusher {
            sample_tx: self.sample_tx.clone(),
        }
    }

    /// Whether the source has been started.
    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl Default for ChannelCadenceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CadenceSource for ChannelCadenceSource {
    fn take_samples(&mut self) -> Option<mpsc::UnboundedReceiver<CadenceSample>> {
        self.sample_rx.take()
    }

    fn start(&mut self) {
        self.running = true;
        tracing::debug!("Pedometer fallback source started");
    }

    fn stop(&mut self) {
        self.running = false;
        tracing::debug!("Pedometer fallback source stopped");
    }
}

/// Cloneable push handle for the pedometer bridge.
#[derive(Clone)]
pub struct CadencePusher {
    sample_tx: mpsc::UnboundedSender<CadenceSample>,
}

impl CadencePusher {
    /// Push a step rate observed by the platform pedometer.
    pub fn push(&self, spm: u16) {
        let _ = self.sample_tx.send(CadenceSample {
            timestamp: Instant::now(),
            spm,
            source: SourceTag::PedometerFallback,
        });
    }
}
