//! Shared filter implementations for the receive chain.
//!
//! Decimation lowpass filters are IIR Butterworth cascades (an order of
//! magnitude cheaper than FIR at multi-MHz input rates); audio shaping
//! is a windowed-sinc FIR bandpass. Both keep state across blocks, and
//! on redesign the state is resized rather than reset so a bandwidth
//! change does not click.

use std::f64::consts::PI;
use std::ops::{Add, Mul, Sub};

use num_complex::Complex32;

use crate::errors::DspError;

/// Scalar types a filter can run over (real audio or complex IQ).
pub trait Sample:
    Copy + Default + Add<Output = Self> + Sub<Output = Self> + Mul<f32, Output = Self>
{
}

impl Sample for f32 {}
impl Sample for Complex32 {}

/// One normalized biquad section (a0 == 1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Biquad {
    pub b0: f32,
    pub b1: f32,
    pub b2: f32,
    pub a1: f32,
    pub a2: f32,
}

impl Biquad {
    /// RBJ cookbook lowpass section.
    fn lowpass(normalized_cutoff: f64, q: f64) -> Self {
        let w0 = PI * normalized_cutoff.clamp(1e-5, 0.999);
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);
        let a0 = 1.0 + alpha;
        Self {
            b0: ((1.0 - cos_w0) / 2.0 / a0) as f32,
            b1: ((1.0 - cos_w0) / a0) as f32,
            b2: ((1.0 - cos_w0) / 2.0 / a0) as f32,
            a1: (-2.0 * cos_w0 / a0) as f32,
            a2: ((1.0 - alpha) / a0) as f32,
        }
    }

    /// RBJ cookbook bandpass section, constant 0 dB peak gain.
    fn bandpass(normalized_center: f64, q: f64) -> Self {
        let w0 = PI * normalized_center.clamp(1e-5, 0.999);
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);
        let a0 = 1.0 + alpha;
        Self {
            b0: (alpha / a0) as f32,
            b1: 0.0,
            b2: (-alpha / a0) as f32,
            a1: (-2.0 * cos_w0 / a0) as f32,
            a2: ((1.0 - alpha) / a0) as f32,
        }
    }

    fn dc_gain(&self) -> f32 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }
}

/// Design an order-N Butterworth lowpass as a cascade of biquads.
///
/// `normalized_cutoff` is cutoff / Nyquist, as in scipy's `butter`.
/// Order must be even; the analog prototype pole pairs map to section
/// Q values of `1 / (2 sin((2k+1)pi / 2N))`.
pub fn butterworth_lowpass(order: usize, normalized_cutoff: f64) -> Result<Vec<Biquad>, DspError> {
    if order == 0 || order % 2 != 0 {
        return Err(DspError::FilterDesignFailed {
            reason: format!("Butterworth order {order} must be a positive even number"),
        });
    }
    if !(0.0..1.0).contains(&normalized_cutoff) || normalized_cutoff <= 0.0 {
        return Err(DspError::FilterDesignFailed {
            reason: format!("normalized cutoff {normalized_cutoff} outside (0, 1)"),
        });
    }

    let n = order as f64;
    let sections = (0..order / 2)
        .map(|k| {
            let phi = (2.0 * k as f64 + 1.0) * PI / (2.0 * n);
            let q = 1.0 / (2.0 * phi.sin());
            Biquad::lowpass(normalized_cutoff, q)
        })
        .collect();
    Ok(sections)
}

/// Design an order-4 Butterworth-style bandpass (two cascaded
/// bandpass sections) around `center` with width `bandwidth`, both
/// normalized to Nyquist.
pub fn butterworth_bandpass(
    normalized_center: f64,
    normalized_bandwidth: f64,
) -> Result<Vec<Biquad>, DspError> {
    if normalized_center <= 0.0 || normalized_center >= 1.0 {
        return Err(DspError::FilterDesignFailed {
            reason: format!("normalized center {normalized_center} outside (0, 1)"),
        });
    }
    let bw = normalized_bandwidth.max(1e-4);
    let q = (normalized_center / bw).max(0.5);
    Ok(vec![
        Biquad::bandpass(normalized_center, q),
        Biquad::bandpass(normalized_center, q),
    ])
}

/// A stateful IIR cascade. State is two values per section (transposed
/// direct form II) and survives both blocks and redesigns.
#[derive(Debug, Clone)]
pub struct IirFilter<T: Sample> {
    sections: Vec<Biquad>,
    state: Vec<[T; 2]>,
}

impl<T: Sample> IirFilter<T> {
    pub fn new(sections: Vec<Biquad>) -> Self {
        let state = vec![[T::default(); 2]; sections.len()];
        Self { sections, state }
    }

    /// Swap in new coefficients, resizing (not resetting) the state.
    /// New sections are primed to the steady state for `prime_value`,
    /// matching the pad-with-last-sample policy.
    pub fn redesign(&mut self, sections: Vec<Biquad>, prime_value: T) {
        let old_len = self.state.len();
        let new_len = sections.len();
        if new_len > old_len {
            for section in sections.iter().skip(old_len) {
                self.state.push(steady_state(section, prime_value));
            }
        } else {
            self.state.truncate(new_len);
        }
        self.sections = sections;
    }

    /// Prime all sections to steady state for a constant input, used on
    /// first contact with a stream to avoid a startup transient.
    pub fn prime(&mut self, value: T) {
        for (section, state) in self.sections.iter().zip(self.state.iter_mut()) {
            *state = steady_state(section, value);
        }
    }

    pub fn process_sample(&mut self, mut x: T) -> T {
        for (section, state) in self.sections.iter().zip(self.state.iter_mut()) {
            let y = x * section.b0 + state[0];
            state[0] = x * section.b1 - y * section.a1 + state[1];
            state[1] = x * section.b2 - y * section.a2;
            x = y;
        }
        x
    }

    pub fn process(&mut self, input: &[T]) -> Vec<T> {
        input.iter().map(|&x| self.process_sample(x)).collect()
    }

    pub fn num_sections(&self) -> usize {
        self.sections.len()
    }
}

/// Steady state of one section under a constant input `v`: the output
/// settles to `dc_gain * v` and the delay registers follow.
fn steady_state<T: Sample>(section: &Biquad, v: T) -> [T; 2] {
    let y = v * section.dc_gain();
    let s1 = v * section.b2 - y * section.a2;
    let s0 = v * section.b1 - y * section.a1 + s1;
    [s0, s1]
}

/// A stateful FIR filter with a taps-1 delay line.
#[derive(Debug, Clone)]
pub struct FirFilter<T: Sample> {
    taps: Vec<f32>,
    /// Most recent taps-1 input samples, oldest first.
    delay: Vec<T>,
}

impl<T: Sample> FirFilter<T> {
    pub fn new(taps: Vec<f32>) -> Self {
        let delay = vec![T::default(); taps.len().saturating_sub(1)];
        Self { taps, delay }
    }

    /// Swap in new taps; the delay line is resized, padding with the
    /// last held sample so coefficient changes do not click.
    pub fn redesign(&mut self, taps: Vec<f32>) {
        let new_len = taps.len().saturating_sub(1);
        let pad = self.delay.last().copied().unwrap_or_default();
        self.delay.resize(new_len, pad);
        self.taps = taps;
    }

    pub fn process(&mut self, input: &[T]) -> Vec<T> {
        if self.taps.is_empty() {
            return input.to_vec();
        }
        let n = self.taps.len();
        let mut extended = Vec::with_capacity(self.delay.len() + input.len());
        extended.extend_from_slice(&self.delay);
        extended.extend_from_slice(input);

        let mut output = Vec::with_capacity(input.len());
        for i in 0..input.len() {
            let mut acc = T::default();
            // extended[i + n - 1] is the newest sample for output i
            for (k, &tap) in self.taps.iter().enumerate() {
                acc = acc + extended[i + n - 1 - k] * tap;
            }
            output.push(acc);
        }

        let keep = n - 1;
        if keep > 0 {
            let start = extended.len() - keep;
            self.delay.clear();
            self.delay.extend_from_slice(&extended[start..]);
        }
        output
    }

    pub fn num_taps(&self) -> usize {
        self.taps.len()
    }
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

fn hamming(n: usize, i: usize) -> f64 {
    0.54 - 0.46 * (2.0 * PI * i as f64 / (n as f64 - 1.0)).cos()
}

/// Windowed-sinc lowpass, Hamming window, unity DC gain.
pub fn firwin_lowpass(num_taps: usize, normalized_cutoff: f64) -> Vec<f32> {
    let cutoff = normalized_cutoff.clamp(1e-4, 0.999);
    let m = (num_taps - 1) as f64 / 2.0;
    let mut taps: Vec<f64> = (0..num_taps)
        .map(|i| cutoff * sinc(cutoff * (i as f64 - m)) * hamming(num_taps, i))
        .collect();
    let sum: f64 = taps.iter().sum();
    if sum.abs() > 1e-12 {
        for t in taps.iter_mut() {
            *t /= sum;
        }
    }
    taps.into_iter().map(|t| t as f32).collect()
}

/// Windowed-sinc bandpass, Hamming window, unity gain at band center.
/// Cutoffs are normalized to Nyquist, as in scipy's `firwin` with
/// `pass_zero=False`.
pub fn firwin_bandpass(num_taps: usize, normalized_low: f64, normalized_high: f64) -> Vec<f32> {
    let low = normalized_low.clamp(1e-4, 0.998);
    let high = normalized_high.clamp(low + 1e-4, 0.999);
    let m = (num_taps - 1) as f64 / 2.0;
    let mut taps: Vec<f64> = (0..num_taps)
        .map(|i| {
            let t = i as f64 - m;
            (high * sinc(high * t) - low * sinc(low * t)) * hamming(num_taps, i)
        })
        .collect();

    // Normalize so the response at the band center is unity.
    let center = (low + high) / 2.0;
    let mut re = 0.0;
    let mut im = 0.0;
    for (i, &t) in taps.iter().enumerate() {
        let phase = PI * center * (i as f64 - m);
        re += t * phase.cos();
        im += t * phase.sin();
    }
    let gain = (re * re + im * im).sqrt();
    if gain > 1e-12 {
        for t in taps.iter_mut() {
            *t /= gain;
        }
    }
    taps.into_iter().map(|t| t as f32).collect()
}

/// Moving-average (square pulse) filter with integer decimation,
/// carrying its tail across blocks. Used as the FSK matched filter.
#[derive(Debug, Clone)]
pub struct MovingAverageDecimator {
    length: usize,
    decimation: usize,
    buffer: Vec<f32>,
}

impl MovingAverageDecimator {
    pub fn new(length: usize, decimation: usize) -> Self {
        Self {
            length: length.max(1),
            decimation: decimation.max(1),
            buffer: Vec::new(),
        }
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        self.buffer.extend_from_slice(input);
        if self.buffer.len() < self.length {
            return Vec::new();
        }

        let scale = 1.0 / self.length as f32;
        let mut output = Vec::new();
        let mut idx = 0;
        while idx + self.length <= self.buffer.len() {
            let sum: f32 = self.buffer[idx..idx + self.length].iter().sum();
            output.push(sum * scale);
            idx += self.decimation;
        }
        self.buffer.drain(..idx);
        output
    }
}
