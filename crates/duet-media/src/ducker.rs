//! Automatic ducking of the local microphone while the remote side speaks.
//!
//! The auto-duck loop samples the analyser every 100 ms. A
//! [`DuckController`] turns the energy readings into transitions, so the
//! gain only changes when the level crosses the threshold.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use duet_shared::constants::{DUCK_LEVEL, DUCK_THRESHOLD, DUCK_TICK_MS, FFT_SIZE, RESTORE_LEVEL};

use crate::analyser::Analyser;
use crate::backend::{AudioBackend, AudioError};
use crate::graph::{lock, AudioProcessor, Gain, GraphProcessor, PassThrough};
use crate::stream::AudioStream;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DuckerError {
    #[error("{0} stream has no audio tracks")]
    NoAudioTrack(&'static str),

    #[error("{0} stream frames already claimed")]
    FramesClaimed(&'static str),

    #[error(transparent)]
    Audio(#[from] AudioError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DuckSettings {
    /// Average spectrum level (0-255) treated as remote speech.
    pub threshold: f32,
    pub duck_level: f32,
    pub restore_level: f32,
    pub tick: Duration,
    pub fft_size: usize,
}

impl Default for DuckSettings {
    fn default() -> Self {
        Self {
            threshold: DUCK_THRESHOLD,
            duck_level: DUCK_LEVEL,
            restore_level: RESTORE_LEVEL,
            tick: Duration::from_millis(DUCK_TICK_MS),
            fft_size: FFT_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuckerState {
    pub is_active: bool,
    pub is_ducked: bool,
    pub current_level: f32,
}

// ---------------------------------------------------------------------------
// Hysteresis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuckTransition {
    Duck,
    Restore,
}

/// Threshold state machine: reports a transition only when the energy
/// crosses the threshold in the direction opposite to the current state.
#[derive(Debug, Clone)]
pub struct DuckController {
    threshold: f32,
    ducked: bool,
}

impl DuckController {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            ducked: false,
        }
    }

    pub fn observe(&mut self, energy: f32) -> Option<DuckTransition> {
        if energy > self.threshold && !self.ducked {
            self.ducked = true;
            Some(DuckTransition::Duck)
        } else if energy < self.threshold && self.ducked {
            self.ducked = false;
            Some(DuckTransition::Restore)
        } else {
            None
        }
    }

    pub fn is_ducked(&self) -> bool {
        self.ducked
    }

    /// Sync with a gain change made outside the loop.
    pub fn set_ducked(&mut self, ducked: bool) {
        self.ducked = ducked;
    }
}

// ---------------------------------------------------------------------------
// Ducker
// ---------------------------------------------------------------------------

pub struct AudioDucker {
    backend: Arc<dyn AudioBackend>,
    settings: DuckSettings,
    local_gain: Gain,
    controller: Arc<Mutex<DuckController>>,
    processor: Option<Box<dyn AudioProcessor>>,
    auto_duck: Option<JoinHandle<()>>,
}

impl AudioDucker {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self::with_settings(backend, DuckSettings::default())
    }

    pub fn with_settings(backend: Arc<dyn AudioBackend>, settings: DuckSettings) -> Self {
        Self {
            backend,
            local_gain: Gain::new(settings.restore_level),
            controller: Arc::new(Mutex::new(DuckController::new(settings.threshold))),
            settings,
            processor: None,
            auto_duck: None,
        }
    }

    /// Route `local` through the ducking graph and return the stream to
    /// send in its place. With a `remote` stream, automatic ducking starts.
    ///
    /// Never fails: without an audio subsystem, or if building the graph
    /// goes wrong, `local` itself is returned. Must be called inside a tokio
    /// runtime.
    pub fn initialize(
        &mut self,
        local: Arc<dyn AudioStream>,
        remote: Option<Arc<dyn AudioStream>>,
    ) -> Arc<dyn AudioStream> {
        if self.processor.is_some() {
            warn!("Audio ducker already initialized, rebuilding");
            self.cleanup();
        }

        match self.build(local.clone(), remote) {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Audio ducker initialization failed, using original stream");
                self.cleanup();
                local
            }
        }
    }

    fn build(
        &mut self,
        local: Arc<dyn AudioStream>,
        remote: Option<Arc<dyn AudioStream>>,
    ) -> Result<Arc<dyn AudioStream>, DuckerError> {
        if local.audio_tracks().is_empty() {
            return Err(DuckerError::NoAudioTrack("local"));
        }
        if let Some(remote) = &remote {
            if remote.audio_tracks().is_empty() {
                return Err(DuckerError::NoAudioTrack("remote"));
            }
        }

        self.local_gain.set(self.settings.restore_level);
        lock(&self.controller).set_ducked(false);

        let context = match self.backend.open() {
            Ok(context) => context,
            Err(e) => {
                info!(backend = self.backend.name(), error = %e, "Audio processing unavailable, passing local stream through");
                let processor = PassThrough::new(local);
                let output = processor.output();
                self.processor = Some(Box::new(processor));
                return Ok(output);
            }
        };

        let graph = GraphProcessor::build(
            context,
            local,
            remote,
            self.local_gain.clone(),
            self.settings.fft_size,
        )?;
        let output = graph.output();

        if let Some(analyser) = graph.analyser() {
            self.auto_duck = Some(tokio::spawn(run_auto_duck(
                analyser,
                self.local_gain.clone(),
                self.controller.clone(),
                self.settings,
            )));
        }

        info!(
            backend = self.backend.name(),
            processor = graph.kind(),
            auto_duck = self.auto_duck.is_some(),
            "Audio ducker initialized"
        );
        self.processor = Some(Box::new(graph));
        Ok(output)
    }

    /// Set the local gain directly; `level` is clamped to [0, 1].
    pub fn manual_duck(&self, level: f32) {
        if self.processor.is_none() {
            debug!("Audio ducker not initialized, ignoring manual duck");
            return;
        }
        if level.is_nan() {
            warn!("Ignoring NaN duck level");
            return;
        }
        let level = level.clamp(0.0, 1.0);
        self.local_gain.set(level);
        lock(&self.controller).set_ducked(level < self.settings.restore_level);
        debug!(level, "Manual duck");
    }

    /// Back to full local gain.
    pub fn restore(&self) {
        if self.processor.is_none() {
            return;
        }
        self.local_gain.set(self.settings.restore_level);
        lock(&self.controller).set_ducked(false);
        debug!("Local audio restored");
    }

    pub fn state(&self) -> DuckerState {
        let current_level = self.local_gain.get();
        DuckerState {
            is_active: self.processor.is_some(),
            is_ducked: current_level < self.settings.restore_level,
            current_level,
        }
    }

    /// Stop the auto-duck loop, disconnect the graph and close the context.
    /// Safe to call any number of times.
    pub fn cleanup(&mut self) {
        if let Some(task) = self.auto_duck.take() {
            task.abort();
        }
        if let Some(mut processor) = self.processor.take() {
            processor.teardown();
            info!(processor = processor.kind(), "Audio ducker cleaned up");
        }
        self.local_gain.set(self.settings.restore_level);
        lock(&self.controller).set_ducked(false);
    }
}

impl Drop for AudioDucker {
    fn drop(&mut self) {
        self.cleanup();
    }
}

async fn run_auto_duck(
    analyser: Arc<Mutex<Analyser>>,
    gain: Gain,
    controller: Arc<Mutex<DuckController>>,
    settings: DuckSettings,
) {
    let mut ticker = tokio::time::interval(settings.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let energy = lock(&analyser).average_energy();
        let transition = lock(&controller).observe(energy);
        match transition {
            Some(DuckTransition::Duck) => {
                gain.set(settings.duck_level);
                debug!(energy, "Remote speaking, ducking local audio");
            }
            Some(DuckTransition::Restore) => {
                gain.set(settings.restore_level);
                debug!(energy, "Remote quiet, restoring local audio");
            }
            None => {}
        }
    }
}
