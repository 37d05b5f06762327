//! Mode-specific demodulators: FM discriminator with de-emphasis,
//! AM envelope detection, FFT-domain SSB sideband selection, and the
//! 38 kHz subcarrier decoder for FM stereo.
//!
//! All demodulators are stateful; state survives block boundaries.

use num_complex::Complex32;
use rustfft::FftPlanner;

/// Phase discriminator for FM: `arg(x[n] * conj(x[n-1]))` scaled by
/// `rate / (2 pi deviation)`.
#[derive(Debug, Clone)]
pub struct FmDiscriminator {
    prev: Complex32,
    gain: f32,
}

impl FmDiscriminator {
    pub fn new(sample_rate: f32, deviation_hz: f32) -> Self {
        Self {
            prev: Complex32::new(1.0, 0.0),
            gain: sample_rate / (2.0 * std::f32::consts::PI * deviation_hz.max(1.0)),
        }
    }

    pub fn retune(&mut self, sample_rate: f32, deviation_hz: f32) {
        self.gain = sample_rate / (2.0 * std::f32::consts::PI * deviation_hz.max(1.0));
    }

    pub fn process(&mut self, samples: &[Complex32]) -> Vec<f32> {
        let mut output = Vec::with_capacity(samples.len());
        for &s in samples {
            let delta = s * self.prev.conj();
            output.push(delta.arg() * self.gain);
            self.prev = s;
        }
        output
    }
}

/// Single-pole de-emphasis IIR (75 us in the Americas, 50 us elsewhere).
#[derive(Debug, Clone)]
pub struct Deemphasis {
    alpha: f32,
    state: f32,
}

impl Deemphasis {
    pub fn new(sample_rate: f32, tau_us: f32) -> Self {
        let tau = tau_us * 1e-6;
        Self {
            alpha: (-1.0 / (sample_rate * tau)).exp(),
            state: 0.0,
        }
    }

    pub fn process(&mut self, input: &mut [f32]) {
        for x in input.iter_mut() {
            self.state = self.alpha * self.state + (1.0 - self.alpha) * *x;
            *x = self.state;
        }
    }
}

/// AM envelope detector with slow carrier-level tracking and a
/// first-difference high-pass to strip the carrier DC.
#[derive(Debug, Clone)]
pub struct AmDetector {
    carrier_level: f32,
    carrier_alpha: f32,
    hp_prev: f32,
}

impl AmDetector {
    pub fn new() -> Self {
        Self {
            carrier_level: 0.0,
            carrier_alpha: 0.01,
            hp_prev: 0.0,
        }
    }

    pub fn carrier_level(&self) -> f32 {
        self.carrier_level
    }

    pub fn process(&mut self, samples: &[Complex32]) -> Vec<f32> {
        if samples.is_empty() {
            return Vec::new();
        }
        let envelope: Vec<f32> = samples.iter().map(|s| s.norm()).collect();
        let mean = envelope.iter().sum::<f32>() / envelope.len() as f32;
        self.carrier_level =
            (1.0 - self.carrier_alpha) * self.carrier_level + self.carrier_alpha * mean;

        let mut output = Vec::with_capacity(envelope.len());
        for &e in &envelope {
            let audio = e - self.carrier_level;
            output.push(audio - 0.95 * self.hp_prev);
            self.hp_prev = audio;
        }
        output
    }
}

impl Default for AmDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Which half-spectrum an SSB demodulator keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sideband {
    Upper,
    Lower,
}

/// Demodulate SSB by zeroing the unwanted half-spectrum and taking the
/// real part. CW is treated as narrowband USB upstream.
pub fn ssb_demodulate(samples: &[Complex32], sideband: Sideband) -> Vec<f32> {
    let n = samples.len();
    if n == 0 {
        return Vec::new();
    }

    let mut planner = FftPlanner::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);

    let mut buffer = samples.to_vec();
    forward.process(&mut buffer);

    // numpy fftfreq convention: bins [1, n/2) are positive, [n/2, n)
    // negative (the shared Nyquist bin counts as negative).
    let half = n / 2;
    match sideband {
        Sideband::Upper => {
            for bin in buffer.iter_mut().take(n).skip(half.max(1)) {
                *bin = Complex32::new(0.0, 0.0);
            }
        }
        Sideband::Lower => {
            for bin in buffer.iter_mut().take(half).skip(1) {
                *bin = Complex32::new(0.0, 0.0);
            }
        }
    }

    inverse.process(&mut buffer);
    let scale = 1.0 / n as f32;
    buffer.into_iter().map(|c| c.re * scale).collect()
}

/// FM stereo decoder: recovers L/R from the composite discriminator
/// output using the 19 kHz pilot, doubled to lock the 38 kHz DSB
/// subcarrier.
#[derive(Debug, Clone)]
pub struct StereoDecoder {
    composite_rate: f32,
    pilot_filter: super::filters::IirFilter<f32>,
    mono_filter: super::filters::IirFilter<f32>,
    diff_filter: super::filters::IirFilter<f32>,
}

impl StereoDecoder {
    const PILOT_HZ: f64 = 19_000.0;
    const AUDIO_CUTOFF_HZ: f64 = 15_000.0;

    pub fn new(composite_rate: f32) -> Option<Self> {
        use super::filters::{butterworth_bandpass, butterworth_lowpass, IirFilter};
        let nyquist = composite_rate as f64 / 2.0;
        // The composite must carry the 38 kHz subcarrier sidebands.
        if nyquist <= 53_000.0 {
            return None;
        }
        let pilot = butterworth_bandpass(Self::PILOT_HZ / nyquist, 400.0 / nyquist).ok()?;
        let audio_cut = (Self::AUDIO_CUTOFF_HZ / nyquist).min(0.45);
        let mono = butterworth_lowpass(6, audio_cut).ok()?;
        let diff = butterworth_lowpass(6, audio_cut).ok()?;
        Some(Self {
            composite_rate,
            pilot_filter: IirFilter::new(pilot),
            mono_filter: IirFilter::new(mono),
            diff_filter: IirFilter::new(diff),
        })
    }

    pub fn composite_rate(&self) -> f32 {
        self.composite_rate
    }

    /// Returns interleaved L/R pairs at the composite rate.
    pub fn process(&mut self, composite: &[f32]) -> Vec<f32> {
        let pilot = self.pilot_filter.process(composite);

        // Normalize the pilot to unit amplitude so squaring yields a
        // stable 38 kHz reference: cos(2w) = 2 cos^2(w) - 1.
        let pilot_rms =
            (pilot.iter().map(|p| p * p).sum::<f32>() / pilot.len().max(1) as f32).sqrt();
        let pilot_scale = if pilot_rms > 1e-6 {
            std::f32::consts::SQRT_2 / 2.0 / pilot_rms
        } else {
            0.0
        };

        let mut diff_mixed = Vec::with_capacity(composite.len());
        for (x, p) in composite.iter().zip(pilot.iter()) {
            let pn = p * pilot_scale * 2.0_f32.sqrt();
            let subcarrier = 2.0 * pn * pn - 1.0;
            // DSB demod of the 38 kHz L-R subcarrier; x2 undoes the
            // mixing loss.
            diff_mixed.push(x * subcarrier * 2.0);
        }

        let mono = self.mono_filter.process(composite);
        let diff = self.diff_filter.process(&diff_mixed);

        let mut interleaved = Vec::with_capacity(composite.len() * 2);
        for (m, d) in mono.iter().zip(diff.iter()) {
            interleaved.push((m + d) / 2.0);
            interleaved.push((m - d) / 2.0);
        }
        interleaved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::TAU;

    fn fm_modulate(audio: &[f32], rate: f64, deviation: f64) -> Vec<Complex32> {
        let mut phase = 0.0f64;
        audio
            .iter()
            .map(|&a| {
                phase += TAU * deviation * a as f64 / rate;
                Complex32::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect()
    }

    #[test]
    fn test_fm_discriminator_recovers_tone() {
        let rate = 250_000.0;
        let deviation = 75_000.0;
        let audio: Vec<f32> = (0..5000)
            .map(|n| (TAU * 1000.0 * n as f64 / rate).sin() as f32 * 0.5)
            .collect();
        let iq = fm_modulate(&audio, rate, deviation);

        let mut discriminator = FmDiscriminator::new(rate as f32, deviation as f32);
        let recovered = discriminator.process(&iq);

        for (r, a) in recovered.iter().skip(1).zip(audio.iter()) {
            assert_abs_diff_eq!(r, a, epsilon = 0.02);
        }
    }

    #[test]
    fn test_discriminator_state_across_blocks() {
        let rate = 48_000.0;
        let iq = fm_modulate(&vec![0.3f32; 1000], rate, 5_000.0);

        let mut whole = FmDiscriminator::new(rate as f32, 5_000.0);
        let expected = whole.process(&iq);

        let mut split = FmDiscriminator::new(rate as f32, 5_000.0);
        let mut actual = split.process(&iq[..500]);
        actual.extend(split.process(&iq[500..]));
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected.iter()).skip(1) {
            assert_abs_diff_eq!(a, e, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_am_detector_recovers_envelope() {
        let rate = 48_000.0f64;
        // Carrier at DC (already mixed down) with 30% modulation.
        let audio: Vec<f32> = (0..48_000)
            .map(|n| (TAU * 400.0 * n as f64 / rate).sin() as f32)
            .collect();
        let iq: Vec<Complex32> = audio
            .iter()
            .map(|&a| Complex32::new(1.0 + 0.3 * a, 0.0))
            .collect();

        let mut detector = AmDetector::new();
        let recovered = detector.process(&iq);

        // After settling, the recovered audio should correlate strongly
        // with the modulating tone.
        let tail = 24_000;
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        for i in tail..audio.len() {
            dot += (recovered[i] * audio[i]) as f64;
            norm_a += (recovered[i] * recovered[i]) as f64;
            norm_b += (audio[i] * audio[i]) as f64;
        }
        // The first-difference high-pass shifts phase at 400 Hz, so
        // the correlation cannot reach 1.
        let correlation = dot / (norm_a.sqrt() * norm_b.sqrt());
        assert!(correlation > 0.6, "correlation {correlation} too low");
    }

    #[test]
    fn test_ssb_usb_keeps_positive_frequencies() {
        let n = 1024;
        let rate = 48_000.0;
        // Tone at +2 kHz: present in USB, absent in LSB.
        let tone: Vec<Complex32> = (0..n)
            .map(|i| {
                let phase = TAU * 2000.0 * i as f64 / rate;
                Complex32::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect();

        let usb = ssb_demodulate(&tone, Sideband::Upper);
        let lsb = ssb_demodulate(&tone, Sideband::Lower);

        let usb_power: f32 = usb.iter().map(|x| x * x).sum::<f32>() / n as f32;
        let lsb_power: f32 = lsb.iter().map(|x| x * x).sum::<f32>() / n as f32;
        assert!(usb_power > 0.1, "USB power {usb_power}");
        assert!(lsb_power < 0.01, "LSB power {lsb_power}");
    }

    #[test]
    fn test_ssb_empty_input() {
        assert!(ssb_demodulate(&[], Sideband::Upper).is_empty());
    }

    #[test]
    fn test_stereo_decoder_needs_composite_bandwidth() {
        assert!(StereoDecoder::new(96_000.0).is_none());
        assert!(StereoDecoder::new(192_000.0).is_some());
    }

    #[test]
    fn test_stereo_decoder_interleaves_pairs() {
        let mut decoder = StereoDecoder::new(192_000.0).unwrap();
        let composite = vec![0.1f32; 512];
        let lr = decoder.process(&composite);
        assert_eq!(lr.len(), 1024);
    }
}
