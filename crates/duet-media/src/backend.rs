//! Audio subsystem availability.
//!
//! The ducker asks its backend for an [`AudioContext`]; a backend that
//! cannot provide one selects the pass-through strategy instead.

use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Audio subsystem unavailable: {0}")]
    Unavailable(String),

    #[error("No output device available")]
    NoOutputDevice,

    #[error("Audio device error: {0}")]
    DeviceError(String),

    #[error("Audio context already closed")]
    ContextClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            frame_size_ms: 20,
        }
    }
}

impl AudioConfig {
    pub fn frame_size_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_size_ms as usize) / 1000
    }
}

/// An open processing context. Closing is one-way.
#[derive(Debug)]
pub struct AudioContext {
    backend: &'static str,
    config: AudioConfig,
    open: bool,
}

impl AudioContext {
    pub fn new(backend: &'static str, config: AudioConfig) -> Self {
        Self {
            backend,
            config,
            open: true,
        }
    }

    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn close(&mut self) -> Result<(), AudioError> {
        if !self.open {
            return Err(AudioError::ContextClosed);
        }
        self.open = false;
        debug!(backend = self.backend, "Audio context closed");
        Ok(())
    }
}

pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn open(&self) -> Result<AudioContext, AudioError>;
}

/// Host audio through cpal; available when a default output device exists.
#[derive(Debug, Default)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn name(&self) -> &'static str {
        "cpal"
    }

    fn open(&self) -> Result<AudioContext, AudioError> {
        use cpal::traits::{DeviceTrait, HostTrait};

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceError(e.to_string()))?;

        info!(device = ?device.name(), sample_rate = supported.sample_rate().0, "Using output device");

        Ok(AudioContext::new(
            self.name(),
            AudioConfig {
                sample_rate: supported.sample_rate().0,
                channels: supported.channels(),
                ..AudioConfig::default()
            },
        ))
    }
}

/// Always-available in-process context for servers and tests.
#[derive(Debug, Default)]
pub struct HeadlessBackend {
    pub config: AudioConfig,
}

impl AudioBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn open(&self) -> Result<AudioContext, AudioError> {
        Ok(AudioContext::new(self.name(), self.config.clone()))
    }
}

/// No audio subsystem at all.
#[derive(Debug, Default)]
pub struct NullBackend;

impl AudioBackend for NullBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    fn open(&self) -> Result<AudioContext, AudioError> {
        Err(AudioError::Unavailable("no audio backend".into()))
    }
}
