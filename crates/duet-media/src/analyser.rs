//! Frequency analyser.
//!
//! Keeps the most recent `fft_size` samples and reports a Hann-windowed
//! magnitude spectrum on the 0-255 byte scale used for speech detection:
//! -100 dB maps to 0, -30 dB to 255.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

pub struct Analyser {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    samples: VecDeque<f32>,
    size: usize,
}

impl Analyser {
    pub fn new(fft_size: usize) -> Self {
        let size = fft_size.max(2);
        let fft = FftPlanner::<f32>::new().plan_fft_forward(size);
        let window = (0..size)
            .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f32 / size as f32).cos())
            .collect();
        Self {
            fft,
            window,
            samples: VecDeque::from(vec![0.0; size]),
            size,
        }
    }

    pub fn bin_count(&self) -> usize {
        self.size / 2
    }

    pub fn push_samples(&mut self, samples: &[f32]) {
        for &sample in samples {
            if self.samples.len() == self.size {
                self.samples.pop_front();
            }
            self.samples.push_back(sample);
        }
    }

    pub fn reset(&mut self) {
        self.samples.iter_mut().for_each(|s| *s = 0.0);
    }

    /// Spectrum of the current window, one byte per bin.
    pub fn byte_frequency_data(&self) -> Vec<u8> {
        let mut buffer: Vec<Complex<f32>> = self
            .samples
            .iter()
            .zip(&self.window)
            .map(|(&s, &w)| Complex::new(s * w, 0.0))
            .collect();
        self.fft.process(&mut buffer);

        let scale = 255.0 / (MAX_DECIBELS - MIN_DECIBELS);
        buffer[..self.bin_count()]
            .iter()
            .map(|c| {
                let magnitude = c.norm() / self.size as f32;
                if magnitude <= 0.0 {
                    return 0;
                }
                let db = 20.0 * magnitude.log10();
                ((db - MIN_DECIBELS) * scale).clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Mean of [`Analyser::byte_frequency_data`].
    pub fn average_energy(&self) -> f32 {
        let bins = self.byte_frequency_data();
        if bins.is_empty() {
            return 0.0;
        }
        bins.iter().map(|&b| b as f32).sum::<f32>() / bins.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_shared::constants::{DUCK_THRESHOLD, FFT_SIZE};

    /// Deterministic white noise in [-amplitude, amplitude].
    fn noise(len: usize, amplitude: f32) -> Vec<f32> {
        let mut state: u32 = 0x2545_f491;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state as f32 / u32::MAX as f32 * 2.0 - 1.0) * amplitude
            })
            .collect()
    }

    #[test]
    fn test_silence_is_zero() {
        let mut analyser = Analyser::new(FFT_SIZE);
        analyser.push_samples(&vec![0.0; FFT_SIZE]);
        assert_eq!(analyser.bin_count(), FFT_SIZE / 2);
        assert_eq!(analyser.average_energy(), 0.0);
    }

    #[test]
    fn test_noise_exceeds_speech_threshold() {
        let mut analyser = Analyser::new(FFT_SIZE);
        analyser.push_samples(&noise(FFT_SIZE, 1.0));
        assert!(analyser.average_energy() > DUCK_THRESHOLD);

        analyser.reset();
        assert_eq!(analyser.average_energy(), 0.0);
    }

    #[test]
    fn test_keeps_latest_window() {
        let mut analyser = Analyser::new(FFT_SIZE);
        analyser.push_samples(&noise(FFT_SIZE * 2, 1.0));
        analyser.push_samples(&vec![0.0; FFT_SIZE]);
        assert_eq!(analyser.average_energy(), 0.0);
    }
}
