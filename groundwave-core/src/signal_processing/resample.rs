//! Sample-rate conversion.
//!
//! Demodulators produce blocks of varying length, so the audio-rate
//! conversion is FFT-domain (the `scipy.signal.resample` approach).
//! The transcription path feeds fixed 1024-sample frames and uses a
//! rubato FFT resampler for the 44.1 kHz -> 16 kHz conversion.

use num_complex::Complex32;
use rubato::{FftFixedIn, Resampler};
use rustfft::FftPlanner;

use crate::errors::DspError;

/// FFT-domain resampling of a real block to `num_output` samples.
pub fn resample(input: &[f32], num_output: usize) -> Vec<f32> {
    let n = input.len();
    if num_output == 0 || n == 0 {
        return Vec::new();
    }
    if num_output == n {
        return input.to_vec();
    }

    let mut planner = FftPlanner::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(num_output);

    let mut spectrum: Vec<Complex32> = input.iter().map(|&x| Complex32::new(x, 0.0)).collect();
    forward.process(&mut spectrum);

    let m = num_output;
    let mut output_spectrum = vec![Complex32::new(0.0, 0.0); m];
    output_spectrum[0] = spectrum[0];
    if m < n {
        let nyq = m / 2;
        output_spectrum[..nyq].copy_from_slice(&spectrum[..nyq]);
        for k in 1..nyq {
            output_spectrum[m - k] = spectrum[n - k];
        }
        if nyq > 0 {
            // Fold both old bins into the shared Nyquist bin; for a
            // real input they are conjugates, so the sum stays real.
            output_spectrum[nyq] = spectrum[nyq] + spectrum[n - nyq];
        }
    } else {
        let nyq = n / 2;
        output_spectrum[..nyq].copy_from_slice(&spectrum[..nyq]);
        for k in 1..nyq {
            output_spectrum[m - k] = spectrum[n - k];
        }
        if nyq > 0 {
            let split = spectrum[nyq] * 0.5;
            output_spectrum[nyq] = split;
            output_spectrum[m - nyq] = split;
        }
    }

    inverse.process(&mut output_spectrum);
    let scale = 1.0 / n as f32;
    output_spectrum.into_iter().map(|c| c.re * scale).collect()
}

/// Number of output samples for a rate conversion of `len` samples.
pub fn output_len(len: usize, input_rate: f64, output_rate: f64) -> usize {
    if input_rate <= 0.0 {
        return 0;
    }
    (len as f64 * output_rate / input_rate) as usize
}

/// Fixed-chunk mono resampler for the transcription path. Buffers
/// arbitrary input and yields converted audio chunk by chunk.
pub struct FixedChunkResampler {
    inner: FftFixedIn<f32>,
    chunk_size: usize,
    pending: Vec<f32>,
}

impl FixedChunkResampler {
    pub fn new(input_rate: usize, output_rate: usize, chunk_size: usize) -> Result<Self, DspError> {
        let inner = FftFixedIn::<f32>::new(input_rate, output_rate, chunk_size, 2, 1).map_err(
            |err| DspError::ResampleFailed {
                reason: err.to_string(),
            },
        )?;
        Ok(Self {
            inner,
            chunk_size,
            pending: Vec::new(),
        })
    }

    /// Feed samples in; returns whatever full chunks became available.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, DspError> {
        self.pending.extend_from_slice(input);
        let mut output = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let chunk: Vec<f32> = self.pending.drain(..self.chunk_size).collect();
            let frames = self
                .inner
                .process(&[chunk], None)
                .map_err(|err| DspError::ResampleFailed {
                    reason: err.to_string(),
                })?;
            if let Some(channel) = frames.into_iter().next() {
                output.extend(channel);
            }
        }
        Ok(output)
    }
}
