//! Frequency translation with a persisted phase accumulator.
//!
//! The accumulator carries across blocks so long-running shifts never
//! wrap an `n` index into float-precision artifacts.

use std::f64::consts::TAU;

use num_complex::Complex32;

/// Complex NCO mixing a stream down (or up) by a configurable offset.
#[derive(Debug, Clone)]
pub struct FrequencyShifter {
    /// Current phase in radians, kept in [0, 2pi).
    phase: f64,
}

impl FrequencyShifter {
    pub fn new() -> Self {
        Self { phase: 0.0 }
    }

    /// Multiply by `exp(-j 2 pi offset/rate n)`, continuing from the
    /// phase left by the previous block.
    pub fn shift(&mut self, samples: &[Complex32], offset_hz: f64, sample_rate: f64) -> Vec<Complex32> {
        if offset_hz == 0.0 || sample_rate <= 0.0 {
            return samples.to_vec();
        }
        let step = TAU * offset_hz / sample_rate;
        let mut output = Vec::with_capacity(samples.len());
        for &s in samples {
            let (sin, cos) = (-self.phase).sin_cos();
            output.push(s * Complex32::new(cos as f32, sin as f32));
            self.phase += step;
            if self.phase >= TAU {
                self.phase -= TAU;
            } else if self.phase < 0.0 {
                self.phase += TAU;
            }
        }
        output
    }

    pub fn reset(&mut self) {
        self.phase = 0.0;
    }
}

impl Default for FrequencyShifter {
    fn default() -> Self {
        Self::new()
    }
}
