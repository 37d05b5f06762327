//! Power-spectrum math: window functions, dBFS conversion and the
//! exponential averager behind the waterfall.

use std::sync::Arc;

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::config::Window;

const DB_FLOOR: f32 = -140.0;

/// Generate window coefficients of the requested length.
pub fn window_coefficients(window: Window, len: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    if len == 0 {
        return Vec::new();
    }
    match window {
        Window::Rect => vec![1.0; len],
        Window::Hann => (0..len)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (len as f32 - 1.0)).cos())
            .collect(),
        Window::Hamming => (0..len)
            .map(|i| 0.54 - 0.46 * (2.0 * PI * i as f32 / (len as f32 - 1.0)).cos())
            .collect(),
        Window::Blackman => (0..len)
            .map(|i| {
                let x = 2.0 * PI * i as f32 / (len as f32 - 1.0);
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect(),
    }
}

/// Stateful spectrum computation for one source: windows, FFTs,
/// DC-centers and exponentially averages incoming blocks.
pub struct PowerSpectrum {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    window: Window,
    coefficients: Vec<f32>,
    /// Running IIR average, in dBFS per bin.
    average: Vec<f32>,
    averaging: u32,
}

impl PowerSpectrum {
    pub fn new(fft_size: usize, window: Window, averaging: u32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        Self {
            fft,
            fft_size,
            window,
            coefficients: window_coefficients(window, fft_size),
            average: Vec::new(),
            averaging: averaging.max(1),
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Rebuild the plan when display parameters change. The averaging
    /// history only survives when the bin count is unchanged.
    pub fn reconfigure(&mut self, fft_size: usize, window: Window, averaging: u32) {
        if fft_size != self.fft_size {
            let mut planner = FftPlanner::new();
            self.fft = planner.plan_fft_forward(fft_size);
            self.fft_size = fft_size;
            self.average.clear();
        }
        if window != self.window || self.coefficients.len() != fft_size {
            self.window = window;
            self.coefficients = window_coefficients(window, fft_size);
        }
        self.averaging = averaging.max(1);
    }

    /// Compute one averaged, DC-centered power frame in dBFS. Blocks
    /// longer than the FFT are truncated, shorter ones zero-padded.
    pub fn process(&mut self, samples: &[Complex32]) -> Vec<f32> {
        if samples.is_empty() {
            return self.average.clone();
        }

        let mut buffer: Vec<Complex32> = samples
            .iter()
            .take(self.fft_size)
            .zip(self.coefficients.iter())
            .map(|(&s, &w)| s * w)
            .collect();
        buffer.resize(self.fft_size, Complex32::new(0.0, 0.0));

        self.fft.process(&mut buffer);

        // Window power normalization keeps dBFS comparable across
        // window choices.
        let window_power: f32 =
            self.coefficients.iter().map(|w| w * w).sum::<f32>() / self.fft_size as f32;
        let scale = 1.0 / (self.fft_size as f32 * self.fft_size as f32 * window_power.max(1e-12));

        let half = self.fft_size / 2;
        let mut frame = Vec::with_capacity(self.fft_size);
        for i in 0..self.fft_size {
            // fftshift: negative frequencies first.
            let bin = (i + half) % self.fft_size;
            let power = buffer[bin].norm_sqr() * scale;
            let db = if power > 1e-14 {
                10.0 * power.log10()
            } else {
                DB_FLOOR
            };
            frame.push(db);
        }

        if self.average.len() != frame.len() {
            self.average = frame.clone();
        } else {
            let alpha = 1.0 / self.averaging as f32;
            for (avg, new) in self.average.iter_mut().zip(frame.iter()) {
                *avg += alpha * (new - *avg);
            }
        }
        self.average.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_window_lengths() {
        for window in [Window::Hann, Window::Hamming, Window::Blackman, Window::Rect] {
            assert_eq!(window_coefficients(window, 256).len(), 256);
        }
    }

    #[test]
    fn test_hann_endpoints_near_zero() {
        let w = window_coefficients(Window::Hann, 128);
        assert_abs_diff_eq!(w[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(w[127], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_dc_tone_lands_center_bin() {
        let mut spectrum = PowerSpectrum::new(256, Window::Hann, 1);
        let samples = vec![Complex32::new(1.0, 0.0); 256];
        let frame = spectrum.process(&samples);

        let (max_idx, _) = frame
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .unwrap();
        assert_eq!(max_idx, 128);
    }

    #[test]
    fn test_full_scale_dc_is_near_zero_dbfs() {
        let mut spectrum = PowerSpectrum::new(512, Window::Rect, 1);
        let samples = vec![Complex32::new(1.0, 0.0); 512];
        let frame = spectrum.process(&samples);
        assert_abs_diff_eq!(frame[256], 0.0, epsilon = 0.5);
    }

    #[test]
    fn test_averaging_smooths_changes() {
        let mut spectrum = PowerSpectrum::new(128, Window::Rect, 8);
        let loud = vec![Complex32::new(1.0, 0.0); 128];
        let quiet = vec![Complex32::new(0.001, 0.0); 128];
        let first = spectrum.process(&loud)[64];
        let after_quiet = spectrum.process(&quiet)[64];
        // One quiet frame at alpha=1/8 cannot pull the average down by
        // more than an eighth of the span.
        assert!(after_quiet > first - 10.0);
    }

    #[test]
    fn test_short_block_zero_padded() {
        let mut spectrum = PowerSpectrum::new(512, Window::Hann, 1);
        let frame = spectrum.process(&vec![Complex32::new(0.5, 0.0); 100]);
        assert_eq!(frame.len(), 512);
    }

    #[test]
    fn test_empty_block_returns_previous_average() {
        let mut spectrum = PowerSpectrum::new(64, Window::Rect, 1);
        let frame = spectrum.process(&vec![Complex32::new(1.0, 0.0); 64]);
        let repeat = spectrum.process(&[]);
        assert_eq!(frame, repeat);
    }
}
