//! The demodulation pipeline: bandwidth gate, filter (re)design, mix,
//! decimate, power measurement, mode-specific demodulation, audio
//! shaping, resample, gain and squelch.

use std::time::Instant;

use num_complex::Complex32;
use tracing::{debug, info};

use crate::block::IqBlock;
use crate::config::{DemodConfig, Modulation};
use crate::errors::DspError;
use crate::session::VfoState;
use crate::signal_processing::demodulation::{
    AmDetector, Deemphasis, FmDiscriminator, Sideband, StereoDecoder,
};
use crate::signal_processing::filters::{
    butterworth_lowpass, firwin_bandpass, FirFilter, IirFilter,
};
use crate::signal_processing::mixer::FrequencyShifter;
use crate::signal_processing::resample::{output_len, resample};
use crate::signal_processing::measure_power_dbfs;

/// Fraction of the half-bandwidth considered usable before a VFO is
/// put to sleep.
const USABLE_BANDWIDTH_FRACTION: f64 = 0.98;

const SQUELCH_HYSTERESIS_DB: f32 = 3.0;
const AUDIO_FIR_TAPS: usize = 201;

/// Result of running one block through the pipeline.
pub enum GateOutcome {
    /// Demodulated audio at the output rate, ready for chunking.
    Audio(Vec<f32>),
    /// In band, but this block produced no audio (e.g. the decimated
    /// block was empty). Not an error.
    Silent,
    /// VFO is outside the source's usable bandwidth.
    Sleeping { dropped_samples: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct DesignKey {
    sample_rate: u32,
    bandwidth: u32,
    modulation: Modulation,
}

enum ModeState {
    Fm {
        discriminator: FmDiscriminator,
        deemphasis: Deemphasis,
    },
    FmStereo {
        discriminator: FmDiscriminator,
        decoder: StereoDecoder,
    },
    Am(AmDetector),
    Ssb(Sideband),
}

/// Fixed-size audio frame assembly with a bounded internal buffer.
/// On overflow the oldest audio is dropped: latency over loss, the
/// stream is real-time.
pub struct AudioChunker {
    frame_size: usize,
    max_frames: usize,
    buffer: Vec<f32>,
}

impl AudioChunker {
    pub fn new(frame_size: usize, max_frames: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            max_frames: max_frames.max(1),
            buffer: Vec::new(),
        }
    }

    pub fn push(&mut self, samples: Vec<f32>) -> Vec<Vec<f32>> {
        self.buffer.extend(samples);

        let cap = self.frame_size * self.max_frames;
        if self.buffer.len() > cap {
            let excess = self.buffer.len() - cap;
            self.buffer.drain(..excess);
            debug!(dropped = excess, "audio buffer overflow, dropping oldest samples");
        }

        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_size {
            frames.push(self.buffer.drain(..self.frame_size).collect());
        }
        frames
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

pub struct DemodPipeline {
    config: DemodConfig,
    design: Option<DesignKey>,
    decimation: usize,
    intermediate_rate: f64,
    decimation_filter: IirFilter<Complex32>,
    audio_filter: FirFilter<f32>,
    mixer: FrequencyShifter,
    mode: Option<ModeState>,
    squelch_open: bool,
    last_rf_power_dbfs: Option<f32>,
    last_power_update: Instant,
    chunker: AudioChunker,
}

impl DemodPipeline {
    pub fn new(config: DemodConfig) -> Self {
        Self {
            config,
            design: None,
            decimation: 1,
            intermediate_rate: 48_000.0,
            decimation_filter: IirFilter::new(Vec::new()),
            audio_filter: FirFilter::new(Vec::new()),
            mixer: FrequencyShifter::new(),
            mode: None,
            squelch_open: false,
            last_rf_power_dbfs: None,
            last_power_update: Instant::now(),
            chunker: AudioChunker::new(config.frame_size, 10),
        }
    }

    pub fn chunker_mut(&mut self) -> &mut AudioChunker {
        &mut self.chunker
    }

    pub fn last_rf_power_dbfs(&self) -> Option<f32> {
        self.last_rf_power_dbfs
    }

    pub fn is_squelch_open(&self) -> bool {
        self.squelch_open
    }

    pub fn process(&mut self, block: &IqBlock, vfo: &VfoState) -> Result<GateOutcome, DspError> {
        // Stage 1: bandwidth gate.
        let offset = (vfo.center_freq - block.center_freq) as f64;
        let usable = block.sample_rate as f64 / 2.0 * USABLE_BANDWIDTH_FRACTION;
        if offset.abs() > usable {
            return Ok(GateOutcome::Sleeping {
                dropped_samples: block.len() as u64,
            });
        }

        // Stage 2: (re)design filters when the view changed.
        let key = DesignKey {
            sample_rate: block.sample_rate,
            bandwidth: vfo.bandwidth,
            modulation: vfo.modulation,
        };
        if self.design != Some(key) {
            self.redesign(key, block.samples.first().copied().unwrap_or_default())?;
        }

        // Stage 3: mix the VFO down to baseband.
        let translated = self
            .mixer
            .shift(&block.samples, offset, block.sample_rate as f64);

        // Stage 4: anti-alias filter at the full rate, then decimate.
        let filtered = self.decimation_filter.process(&translated);

        // Stage 5: RF power over the filtered (not decimated) block.
        let rf_power = measure_power_dbfs(&filtered)
            .map(|db| db + self.config.calibration_offset_db);
        if let Some(power) = rf_power {
            let min_interval = 1.0 / self.config.power_update_rate.max(0.1);
            if self.last_power_update.elapsed().as_secs_f32() >= min_interval
                || self.last_rf_power_dbfs.is_none()
            {
                self.last_rf_power_dbfs = Some(power);
                self.last_power_update = Instant::now();
            }
        }

        let decimated: Vec<Complex32> = filtered
            .iter()
            .step_by(self.decimation)
            .copied()
            .collect();
        if decimated.is_empty() {
            return Ok(GateOutcome::Silent);
        }

        // Stage 6: mode-specific demodulation.
        let (audio, stereo) = match self.mode.as_mut() {
            Some(ModeState::Fm {
                discriminator,
                deemphasis,
            }) => {
                let mut audio = discriminator.process(&decimated);
                deemphasis.process(&mut audio);
                (audio, false)
            }
            Some(ModeState::FmStereo {
                discriminator,
                decoder,
            }) => {
                let composite = discriminator.process(&decimated);
                (decoder.process(&composite), true)
            }
            Some(ModeState::Am(detector)) => (detector.process(&decimated), false),
            Some(ModeState::Ssb(sideband)) => {
                (crate::signal_processing::demodulation::ssb_demodulate(&decimated, *sideband), false)
            }
            None => return Ok(GateOutcome::Silent),
        };
        if audio.is_empty() {
            return Ok(GateOutcome::Silent);
        }

        // Stages 7-8: audio shaping and resample to the output rate.
        let mut audio = if stereo {
            // The stereo decoder already band-limits both channels;
            // resample L and R independently and re-interleave.
            let left: Vec<f32> = audio.iter().step_by(2).copied().collect();
            let right: Vec<f32> = audio.iter().skip(1).step_by(2).copied().collect();
            let num_out = output_len(left.len(), self.intermediate_rate, self.config.audio_rate as f64);
            if num_out == 0 {
                return Ok(GateOutcome::Silent);
            }
            let left = resample(&left, num_out);
            let right = resample(&right, num_out);
            let mut interleaved = Vec::with_capacity(num_out * 2);
            for (l, r) in left.into_iter().zip(right.into_iter()) {
                interleaved.push(l);
                interleaved.push(r);
            }
            interleaved
        } else {
            let shaped = self.audio_filter.process(&audio);
            let num_out = output_len(shaped.len(), self.intermediate_rate, self.config.audio_rate as f64);
            if num_out == 0 {
                return Ok(GateOutcome::Silent);
            }
            resample(&shaped, num_out)
        };

        // Stage 9: gain, normalization and soft clipping.
        let gain = (vfo.volume as f32 / 100.0 * 6.0).clamp(0.0, 6.0);
        for sample in audio.iter_mut() {
            *sample *= gain;
        }
        let peak = audio.iter().fold(0.0f32, |acc, &x| acc.max(x.abs())) + 1e-10;
        let scale = 0.5 / peak;
        for sample in audio.iter_mut() {
            *sample = (*sample * scale).clamp(-0.95, 0.95);
        }

        // Stage 10: squelch with hysteresis against the fresh power
        // measurement; closed means zeros on the wire.
        if let Some(power) = rf_power {
            if self.squelch_open {
                if power < vfo.squelch_dbfs - SQUELCH_HYSTERESIS_DB {
                    self.squelch_open = false;
                }
            } else if power > vfo.squelch_dbfs + SQUELCH_HYSTERESIS_DB {
                self.squelch_open = true;
            }
        }
        if !self.squelch_open {
            for sample in audio.iter_mut() {
                *sample = 0.0;
            }
        }

        Ok(GateOutcome::Audio(audio))
    }

    fn redesign(&mut self, key: DesignKey, prime: Complex32) -> Result<(), DspError> {
        let rate = key.sample_rate as f64;
        let nyquist = rate / 2.0;
        let bandwidth = key.bandwidth as f64;

        // Intermediate rate: enough for the bandwidth, at least 48 kHz.
        let target_rate = (bandwidth * 2.5).max(48_000.0);
        self.decimation = ((rate / target_rate) as usize).max(1);
        self.intermediate_rate = rate / self.decimation as f64;

        // Anti-alias cutoff. FM needs the full deviation through to
        // the discriminator; the narrowband modes follow the 1.5-22 kHz
        // clamp.
        let cutoff = match key.modulation {
            Modulation::Fm | Modulation::FmStereo => (bandwidth / 2.0).max(1_500.0),
            _ => bandwidth.clamp(1_500.0, 22_000.0),
        };
        let normalized_cutoff = (cutoff / nyquist).clamp(0.01, 0.45);
        let sections = butterworth_lowpass(6, normalized_cutoff)?;
        self.decimation_filter.redesign(sections, prime);

        // Audio bandpass at the intermediate rate.
        let mut low = 300.0;
        let mut high = bandwidth.min(22_000.0);
        if high < low + 100.0 {
            low = 100.0;
            high = 3_000.0;
        }
        let inter_nyquist = self.intermediate_rate / 2.0;
        let normalized_low = (low / inter_nyquist).clamp(0.01, 0.45);
        let normalized_high = (high / inter_nyquist).clamp(normalized_low + 0.01, 0.45);
        self.audio_filter
            .redesign(firwin_bandpass(AUDIO_FIR_TAPS, normalized_low, normalized_high));

        // Mode state is rebuilt when the mode or rates changed; the
        // design key covers both.
        let inter = self.intermediate_rate as f32;
        self.mode = match key.modulation {
            Modulation::Fm => Some(ModeState::Fm {
                discriminator: FmDiscriminator::new(inter, self.config.fm_deviation_hz),
                deemphasis: Deemphasis::new(inter, self.config.deemphasis_us),
            }),
            Modulation::FmStereo => {
                let decoder = StereoDecoder::new(inter);
                match decoder {
                    Some(decoder) => Some(ModeState::FmStereo {
                        discriminator: FmDiscriminator::new(inter, self.config.fm_deviation_hz),
                        decoder,
                    }),
                    // Composite too narrow for the 38 kHz subcarrier:
                    // fall back to monaural FM.
                    None => Some(ModeState::Fm {
                        discriminator: FmDiscriminator::new(inter, self.config.fm_deviation_hz),
                        deemphasis: Deemphasis::new(inter, self.config.deemphasis_us),
                    }),
                }
            }
            Modulation::Am => Some(ModeState::Am(AmDetector::new())),
            Modulation::Usb | Modulation::Cw => Some(ModeState::Ssb(Sideband::Upper)),
            Modulation::Lsb => Some(ModeState::Ssb(Sideband::Lower)),
            Modulation::None => None,
        };

        self.design = Some(key);
        info!(
            sample_rate = key.sample_rate,
            bandwidth = key.bandwidth,
            mode = key.modulation.as_str(),
            decimation = self.decimation,
            intermediate_khz = self.intermediate_rate / 1e3,
            "demodulation filters initialized"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::VfoState;
    use std::f64::consts::TAU;
    use std::sync::Arc;

    fn vfo(center: i64, bandwidth: u32, modulation: Modulation) -> VfoState {
        VfoState {
            center_freq: center,
            bandwidth,
            modulation,
            active: true,
            ..Default::default()
        }
    }

    fn fm_block(
        center: i64,
        rate: u32,
        tone_hz: f64,
        deviation: f64,
        len: usize,
        carrier_offset: f64,
    ) -> IqBlock {
        let mut phase = 0.0f64;
        let samples: Vec<Complex32> = (0..len)
            .map(|n| {
                let t = n as f64 / rate as f64;
                let audio = (TAU * tone_hz * t).sin();
                phase += TAU * (carrier_offset + deviation * audio) / rate as f64;
                Complex32::new(phase.cos() as f32 * 0.5, phase.sin() as f32 * 0.5)
            })
            .collect();
        IqBlock {
            samples: Arc::new(samples),
            center_freq: center,
            sample_rate: rate,
            captured_at: std::time::Instant::now(),
            wall_clock: None,
            playback: None,
        }
    }

    #[test]
    fn test_fm_pipeline_produces_audio() {
        let mut pipeline = DemodPipeline::new(DemodConfig::default());
        let state = vfo(100_150_000, 200_000, Modulation::Fm);
        // VFO offset 50 kHz from the SDR center.
        let block = fm_block(100_100_000, 2_048_000, 1_000.0, 50_000.0, 262_144, 50_000.0);

        match pipeline.process(&block, &state).unwrap() {
            GateOutcome::Audio(audio) => {
                assert!(!audio.is_empty());
                // 262144 samples at 2.048 MS/s is 128 ms; expect about
                // 5.6k samples at 44.1 kHz.
                let expected = 262_144.0 / 2_048_000.0 * 44_100.0;
                let ratio = audio.len() as f64 / expected;
                assert!((0.9..1.1).contains(&ratio), "len ratio {ratio}");
                let peak = audio.iter().fold(0.0f32, |a, &x| a.max(x.abs()));
                assert!(peak > 0.05, "audio peak {peak} too small");
            }
            _ => panic!("expected audio"),
        }
    }

    #[test]
    fn test_out_of_band_vfo_sleeps_and_resumes() {
        let mut pipeline = DemodPipeline::new(DemodConfig::default());
        let rate = 2_048_000u32;
        // 0.99 * rate/2 beyond center: outside the 0.98 usable region.
        let offset = (0.99 * rate as f64 / 2.0) as i64;
        let state = vfo(100_000_000 + offset, 12_500, Modulation::Usb);
        let block = fm_block(100_000_000, rate, 1_000.0, 0.0, 65_536, 0.0);

        match pipeline.process(&block, &state).unwrap() {
            GateOutcome::Sleeping { dropped_samples } => {
                assert_eq!(dropped_samples, 65_536);
            }
            _ => panic!("expected sleeping"),
        }

        // Back in band: resumes within one block.
        let state = vfo(100_010_000, 12_500, Modulation::Usb);
        assert!(!matches!(
            pipeline.process(&block, &state).unwrap(),
            GateOutcome::Sleeping { .. }
        ));
    }

    #[test]
    fn test_squelch_closed_emits_zeros() {
        let mut pipeline = DemodPipeline::new(DemodConfig::default());
        let mut state = vfo(100_150_000, 200_000, Modulation::Fm);
        // Threshold far above any achievable power.
        state.squelch_dbfs = 100.0;
        let block = fm_block(100_100_000, 2_048_000, 1_000.0, 50_000.0, 262_144, 50_000.0);

        match pipeline.process(&block, &state).unwrap() {
            GateOutcome::Audio(audio) => {
                assert!(audio.iter().all(|&x| x == 0.0));
                assert!(!pipeline.is_squelch_open());
            }
            _ => panic!("expected (muted) audio"),
        }
    }

    #[test]
    fn test_squelch_opens_above_threshold() {
        let mut pipeline = DemodPipeline::new(DemodConfig::default());
        let mut state = vfo(100_150_000, 200_000, Modulation::Fm);
        state.squelch_dbfs = -120.0;
        let block = fm_block(100_100_000, 2_048_000, 1_000.0, 50_000.0, 262_144, 50_000.0);

        match pipeline.process(&block, &state).unwrap() {
            GateOutcome::Audio(audio) => {
                assert!(pipeline.is_squelch_open());
                assert!(audio.iter().any(|&x| x != 0.0));
            }
            _ => panic!("expected audio"),
        }
    }

    #[test]
    fn test_rf_power_within_tolerance() {
        // A full-scale tone at the VFO frequency should measure close
        // to 0 dBFS plus the calibration offset.
        let config = DemodConfig {
            calibration_offset_db: 0.0,
            ..Default::default()
        };
        let mut pipeline = DemodPipeline::new(config);
        let state = vfo(100_100_000, 200_000, Modulation::Fm);
        let block = fm_block(100_100_000, 2_048_000, 0.0, 0.0, 262_144, 0.0);
        let _ = pipeline.process(&block, &state).unwrap();
        let power = pipeline.last_rf_power_dbfs().expect("power measured");
        // The tone is at amplitude 0.5 => -6 dBFS.
        assert!((power - (-6.0)).abs() < 3.0, "power {power}");
    }

    #[test]
    fn test_chunker_fixed_frames_and_drop_oldest() {
        let mut chunker = AudioChunker::new(4, 2);
        assert!(chunker.push(vec![1.0, 2.0]).is_empty());
        let frames = chunker.push(vec![3.0, 4.0, 5.0]);
        assert_eq!(frames, vec![vec![1.0, 2.0, 3.0, 4.0]]);
        assert_eq!(chunker.pending(), 1);

        // Push far beyond capacity: oldest samples drop, newest stay.
        let frames = chunker.push((0..32).map(|i| i as f32).collect());
        let flat: Vec<f32> = frames.into_iter().flatten().collect();
        assert_eq!(flat.len(), 8);
        assert_eq!(flat[7], 31.0);
    }

    #[test]
    fn test_tiny_block_is_silent_not_error() {
        let mut pipeline = DemodPipeline::new(DemodConfig::default());
        let state = vfo(100_100_000, 200_000, Modulation::Fm);
        let block = IqBlock {
            samples: Arc::new(Vec::new()),
            center_freq: 100_100_000,
            sample_rate: 2_048_000,
            captured_at: std::time::Instant::now(),
            wall_clock: None,
            playback: None,
        };
        // An empty block cannot panic the pipeline.
        assert!(matches!(
            pipeline.process(&block, &state).unwrap(),
            GateOutcome::Silent | GateOutcome::Audio(_)
        ));
    }
}
