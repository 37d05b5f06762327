//! AFSK front-end (Bell 202 style): FM demodulate the voice channel,
//! then discriminate the mark/space tones with quadrature correlators
//! before the shared clock recovery and HDLC framing.

use num_complex::Complex32;
use tracing::info;

use crate::errors::DspError;
use crate::signal_processing::demodulation::FmDiscriminator;
use crate::signal_processing::filters::{butterworth_lowpass, IirFilter, MovingAverageDecimator};
use crate::signal_processing::mixer::FrequencyShifter;

use super::hdlc::{HdlcDeframer, NrziDecoder};
use super::sync::{GardnerSync, DEFAULT_LOOP_BW, DEFAULT_LOOP_LIMIT};

const MARK_HZ: f64 = 1_200.0;
const SPACE_HZ: f64 = 2_200.0;
const MAX_SPS: f64 = 10.0;

/// Sliding average over one bit period, complex input.
struct ToneCorrelator {
    nco: FrequencyShifter,
    freq_hz: f64,
    window: usize,
    ring: Vec<Complex32>,
    next: usize,
    sum: Complex32,
    filled: usize,
}

impl ToneCorrelator {
    fn new(freq_hz: f64, window: usize) -> Self {
        let window = window.max(1);
        Self {
            nco: FrequencyShifter::new(),
            freq_hz,
            window,
            ring: vec![Complex32::default(); window],
            next: 0,
            sum: Complex32::default(),
            filled: 0,
        }
    }

    /// Magnitude of the audio's correlation against the tone.
    fn process(&mut self, audio: &[f32], sample_rate: f64) -> Vec<f32> {
        let analytic: Vec<Complex32> = audio.iter().map(|&a| Complex32::new(a, 0.0)).collect();
        let mixed = self.nco.shift(&analytic, self.freq_hz, sample_rate);
        mixed
            .into_iter()
            .map(|x| {
                self.sum -= self.ring[self.next];
                self.ring[self.next] = x;
                self.sum += x;
                self.next = (self.next + 1) % self.window;
                self.filled = (self.filled + 1).min(self.window);
                (self.sum / self.filled as f32).norm()
            })
            .collect()
    }
}

pub struct AfskFrontEnd {
    baud: f64,
    deviation: f64,
    input_rate: Option<u32>,
    audio_rate: f64,
    input_decimation: usize,
    mixer: FrequencyShifter,
    anti_alias: IirFilter<Complex32>,
    fm_demod: FmDiscriminator,
    mark: ToneCorrelator,
    space: ToneCorrelator,
    decimator: MovingAverageDecimator,
    clock: GardnerSync,
    nrzi: NrziDecoder,
    deframer: HdlcDeframer,
    pub symbols_decoded: u64,
}

impl AfskFrontEnd {
    pub fn new(baud: u32, deviation_hz: f32) -> Self {
        Self {
            baud: baud.max(1) as f64,
            deviation: deviation_hz.abs().max(1.0) as f64,
            input_rate: None,
            audio_rate: 48_000.0,
            input_decimation: 1,
            mixer: FrequencyShifter::new(),
            anti_alias: IirFilter::new(Vec::new()),
            fm_demod: FmDiscriminator::new(48_000.0, 3_500.0),
            mark: ToneCorrelator::new(MARK_HZ, 1),
            space: ToneCorrelator::new(SPACE_HZ, 1),
            decimator: MovingAverageDecimator::new(1, 1),
            clock: GardnerSync::new(4.0, DEFAULT_LOOP_BW, DEFAULT_LOOP_LIMIT),
            nrzi: NrziDecoder::default(),
            deframer: HdlcDeframer::new(),
            symbols_decoded: 0,
        }
    }

    /// Audio-channel rate after the input decimation stage.
    pub fn decoder_rate(&self) -> f64 {
        self.audio_rate
    }

    fn design(&mut self, input_rate: u32) -> Result<(), DspError> {
        let rate = input_rate as f64;
        // The voice channel fits comfortably in 48 kHz.
        let target_rate = 48_000.0f64.min(rate);
        self.input_decimation = ((rate / target_rate) as usize).max(1);
        self.audio_rate = rate / self.input_decimation as f64;

        let normalized = (target_rate / 2.0 / (rate / 2.0)).clamp(0.01, 0.45);
        self.anti_alias
            .redesign(butterworth_lowpass(6, normalized)?, Complex32::default());

        self.fm_demod = FmDiscriminator::new(self.audio_rate as f32, self.deviation as f32);

        let bit_window = (self.audio_rate / self.baud).round().max(1.0) as usize;
        self.mark = ToneCorrelator::new(MARK_HZ, bit_window);
        self.space = ToneCorrelator::new(SPACE_HZ, bit_window);

        let sps_full = self.audio_rate / self.baud;
        let decimation = (sps_full / MAX_SPS).ceil().max(1.0) as usize;
        let sps = sps_full / decimation as f64;
        self.decimator = MovingAverageDecimator::new(decimation, decimation);
        self.clock = GardnerSync::new(sps as f32, DEFAULT_LOOP_BW, DEFAULT_LOOP_LIMIT);

        self.input_rate = Some(input_rate);
        info!(
            input_rate,
            audio_rate = self.audio_rate,
            baud = self.baud,
            sps,
            "AFSK front-end configured"
        );
        Ok(())
    }

    pub fn process(
        &mut self,
        samples: &[Complex32],
        input_rate: u32,
        offset_hz: f64,
    ) -> Result<Vec<Vec<u8>>, DspError> {
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        if self.input_rate != Some(input_rate) {
            self.design(input_rate)?;
        }

        let mixed = self.mixer.shift(samples, offset_hz, input_rate as f64);
        let filtered = self.anti_alias.process(&mixed);
        let audio_iq: Vec<Complex32> = filtered
            .iter()
            .step_by(self.input_decimation)
            .copied()
            .collect();
        let audio = self.fm_demod.process(&audio_iq);

        let mark = self.mark.process(&audio, self.audio_rate);
        let space = self.space.process(&audio, self.audio_rate);
        let soft: Vec<f32> = mark
            .iter()
            .zip(space.iter())
            .map(|(m, s)| m - s)
            .collect();
        let soft = self.decimator.process(&soft);
        if soft.is_empty() {
            return Ok(Vec::new());
        }

        let symbols = self.clock.process(&soft);
        self.symbols_decoded += symbols.len() as u64;

        let hard: Vec<bool> = symbols.iter().map(|&s| s > 0.0).collect();
        let bits = self.nrzi.decode(hard);
        Ok(self.deframer.push(bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::ax25;
    use crate::decode::hdlc::{hdlc_encode, nrzi_encode};
    use std::f64::consts::TAU;

    /// Mark/space tone audio, FM modulated onto a carrier at `rate`.
    fn afsk_modulate(bits: &[bool], rate: f64, baud: f64, deviation: f64) -> Vec<Complex32> {
        let sps = (rate / baud).round() as usize;
        let mut tone_phase = 0.0f64;
        let mut audio = Vec::new();
        for &bit in bits {
            let tone = if bit { MARK_HZ } else { SPACE_HZ };
            for _ in 0..sps {
                tone_phase += TAU * tone / rate;
                audio.push(tone_phase.sin() as f32);
            }
        }

        let mut carrier_phase = 0.0f64;
        audio
            .into_iter()
            .map(|a| {
                carrier_phase += TAU * deviation * a as f64 / rate;
                Complex32::new(carrier_phase.cos() as f32, carrier_phase.sin() as f32)
            })
            .collect()
    }

    #[test]
    fn test_afsk_decodes_ax25_frame() {
        let frame = ax25::build_ui_frame("ON01FR", "APRS", b"afsk loopback");
        let mut stuffed = hdlc_encode(&frame, 48);
        stuffed.extend(hdlc_encode(b"pad", 24));
        let line_bits = nrzi_encode(&stuffed);

        let rate = 48_000.0;
        let iq = afsk_modulate(&line_bits, rate, 1_200.0, 3_500.0);

        let mut frontend = AfskFrontEnd::new(1_200, 3_500.0);
        let mut frames = Vec::new();
        for chunk in iq.chunks(8192) {
            frames.extend(frontend.process(chunk, rate as u32, 0.0).unwrap());
        }
        assert!(
            frames.iter().any(|f| f == &frame),
            "expected frame not recovered ({} frames)",
            frames.len()
        );
    }

    #[test]
    fn test_empty_input_is_noop() {
        let mut frontend = AfskFrontEnd::new(1_200, 3_500.0);
        assert!(frontend.process(&[], 48_000, 0.0).unwrap().is_empty());
    }
}
