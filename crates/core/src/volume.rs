//! Coarse input level for visualisation.
//!
//! Mirrors a browser analyser node: a 256 point FFT over the most recent samples,
//! Blackman windowed, smoothed over time and mapped from decibels onto 0..=255.
//! The reported level is the mean over all frequency bins.

use rustfft::{Fft, FftPlanner, num_complex::Complex};
use std::f32::consts::PI;
use std::sync::Arc;

pub const FFT_SIZE: usize = 256;
pub const BIN_COUNT: usize = FFT_SIZE / 2;

const SMOOTHING: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

pub struct VolumeAnalyser {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    buffer: Vec<Complex<f32>>,
}

impl VolumeAnalyser {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        Self {
            fft: planner.plan_fft_forward(FFT_SIZE),
            window: blackman_window(FFT_SIZE),
            smoothed: vec![0.0; BIN_COUNT],
            buffer: vec![Complex::new(0.0, 0.0); FFT_SIZE],
        }
    }

    /// Returns the mean byte magnitude (0.0..=255.0) of the latest `FFT_SIZE`
    /// samples of `frame`. Shorter frames are zero padded at the front.
    pub fn level(&mut self, frame: &[f32]) -> f32 {
        let tail = &frame[frame.len().saturating_sub(FFT_SIZE)..];
        let offset = FFT_SIZE - tail.len();

        self.buffer.fill(Complex::new(0.0, 0.0));
        for (i, &sample) in tail.iter().enumerate() {
            let sample = if sample.is_finite() { sample } else { 0.0 };
            self.buffer[offset + i] = Complex::new(sample * self.window[offset + i], 0.0);
        }
        self.fft.process(&mut self.buffer);

        let range = MAX_DECIBELS - MIN_DECIBELS;
        let mut total = 0.0;
        for (bin, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.buffer[bin].norm() / FFT_SIZE as f32;
            *smoothed = SMOOTHING * *smoothed + (1.0 - SMOOTHING) * magnitude;
            let decibels = 20.0 * smoothed.log10();
            let byte = (255.0 / range * (decibels - MIN_DECIBELS))
                .clamp(0.0, 255.0)
                .floor();
            total += byte;
        }
        total / BIN_COUNT as f32
    }

    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
    }
}

impl Default for VolumeAnalyser {
    fn default() -> Self {
        Self::new()
    }
}

fn blackman_window(len: usize) -> Vec<f32> {
    let (a0, a1, a2) = (0.42, 0.5, 0.08);
    (0..len)
        .map(|n| {
            let x = n as f32 / len as f32;
            a0 - a1 * (2.0 * PI * x).cos() + a2 * (4.0 * PI * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * PI * 440.0 * i as f32 / 16000.0).sin())
            .collect()
    }

    #[test]
    fn silence_is_zero() {
        let mut analyser = VolumeAnalyser::new();
        assert_eq!(analyser.level(&vec![0.0; 4096]), 0.0);
    }

    #[test]
    fn louder_input_reads_higher() {
        let mut quiet = VolumeAnalyser::new();
        let mut loud = VolumeAnalyser::new();
        let quiet_level = quiet.level(&sine(0.01, 4096));
        let loud_level = loud.level(&sine(0.8, 4096));

        assert!(quiet_level > 0.0);
        assert!(loud_level > quiet_level);
        assert!(loud_level <= 255.0);
    }

    #[test]
    fn smoothing_decays_after_sound_stops() {
        let mut analyser = VolumeAnalyser::new();
        let speaking = analyser.level(&sine(0.8, 4096));
        let after = analyser.level(&vec![0.0; 4096]);

        assert!(after > 0.0);
        assert!(after < speaking);

        analyser.reset();
        assert_eq!(analyser.level(&vec![0.0; 4096]), 0.0);
    }

    #[test]
    fn short_and_non_finite_frames_are_tolerated() {
        let mut analyser = VolumeAnalyser::new();
        let level = analyser.level(&[0.5, f32::NAN, f32::INFINITY, -0.5]);
        assert!((0.0..=255.0).contains(&level));
        assert!((0.0..=255.0).contains(&analyser.level(&[])));
    }
}
