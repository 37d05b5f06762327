//! FSK-family front-end (GMSK/GFSK): quadrature demodulation, Carson
//! lowpass, square-pulse matched filter, DC block, AGC and Gardner
//! clock recovery, feeding NRZI + HDLC framing.
//!
//! GFSK differs from GMSK only in the reported mode string; the DSP is
//! identical.

use num_complex::Complex32;
use tracing::{info, warn};

use crate::errors::DspError;
use crate::signal_processing::demodulation::FmDiscriminator;
use crate::signal_processing::filters::{
    butterworth_lowpass, firwin_lowpass, FirFilter, IirFilter, MovingAverageDecimator,
};
use crate::signal_processing::mixer::FrequencyShifter;

use super::hdlc::{HdlcDeframer, NrziDecoder};
use super::sync::{Agc, DcBlocker, GardnerSync, DEFAULT_LOOP_BW, DEFAULT_LOOP_LIMIT};

/// Hard ceiling on samples per symbol entering the clock recovery.
const MAX_SPS: f64 = 10.0;

pub struct FskFrontEnd {
    baud: f64,
    deviation: f64,
    input_rate: Option<u32>,
    decoder_rate: f64,
    input_decimation: usize,
    mixer: FrequencyShifter,
    anti_alias: IirFilter<Complex32>,
    carson_filter: Option<FirFilter<Complex32>>,
    quad_demod: FmDiscriminator,
    pulse_filter: MovingAverageDecimator,
    dc_block: DcBlocker,
    agc: Agc,
    clock: GardnerSync,
    nrzi: NrziDecoder,
    deframer: HdlcDeframer,
    pub symbols_decoded: u64,
}

impl FskFrontEnd {
    pub fn new(baud: u32, deviation_hz: f32) -> Self {
        Self {
            baud: baud.max(1) as f64,
            deviation: deviation_hz.abs().max(1.0) as f64,
            input_rate: None,
            decoder_rate: 48_000.0,
            input_decimation: 1,
            mixer: FrequencyShifter::new(),
            anti_alias: IirFilter::new(Vec::new()),
            carson_filter: None,
            quad_demod: FmDiscriminator::new(48_000.0, 5_000.0),
            pulse_filter: MovingAverageDecimator::new(1, 1),
            dc_block: DcBlocker::new(32),
            agc: Agc::new(0.01),
            clock: GardnerSync::new(4.0, DEFAULT_LOOP_BW, DEFAULT_LOOP_LIMIT),
            nrzi: NrziDecoder::default(),
            deframer: HdlcDeframer::new(),
            symbols_decoded: 0,
        }
    }

    /// Processing rate after the input decimation stage.
    pub fn decoder_rate(&self) -> f64 {
        self.decoder_rate
    }

    fn design(&mut self, input_rate: u32) -> Result<(), DspError> {
        let rate = input_rate as f64;
        let mut baud = self.baud;
        if baud >= rate {
            warn!(
                sample_rate = input_rate,
                baud = self.baud,
                "sample rate insufficient for baud rate, halving"
            );
            baud = rate / 2.0;
        }

        let carson_cutoff = self.deviation + baud / 2.0;
        // Bring the stream down near the Carson bandwidth before the
        // discriminator; at least 4 samples per symbol must survive.
        let target_rate = (4.0 * carson_cutoff).max(8.0 * baud).min(rate);
        self.input_decimation = ((rate / target_rate) as usize).max(1);
        self.decoder_rate = rate / self.input_decimation as f64;

        let normalized = (target_rate / 2.0 / (rate / 2.0)).clamp(0.01, 0.45);
        self.anti_alias
            .redesign(butterworth_lowpass(6, normalized)?, Complex32::default());

        self.carson_filter = if carson_cutoff < self.decoder_rate / 2.0 {
            let normalized = (carson_cutoff / (self.decoder_rate / 2.0)).clamp(0.01, 0.95);
            Some(FirFilter::new(firwin_lowpass(65, normalized)))
        } else {
            None
        };

        self.quad_demod = FmDiscriminator::new(self.decoder_rate as f32, self.deviation as f32);

        // Square-pulse matched filter, decimating so the clock loop
        // sees at most MAX_SPS samples per symbol.
        let sps_full = self.decoder_rate / baud;
        let pulse_len = sps_full.round().max(1.0) as usize;
        let decimation = (sps_full / MAX_SPS).ceil().max(1.0) as usize;
        let sps = sps_full / decimation as f64;
        self.pulse_filter = MovingAverageDecimator::new(pulse_len, decimation);
        self.dc_block = DcBlocker::new(((sps * 32.0).ceil() as usize).max(8));
        self.agc = Agc::new((2e-2 / sps) as f32);
        self.clock = GardnerSync::new(sps as f32, DEFAULT_LOOP_BW, DEFAULT_LOOP_LIMIT);

        self.input_rate = Some(input_rate);
        info!(
            input_rate,
            decoder_rate = self.decoder_rate,
            baud,
            deviation = self.deviation,
            sps,
            "FSK front-end configured"
        );
        Ok(())
    }

    /// Process one IQ block (full source rate) already associated with
    /// this VFO. `offset_hz` is VFO center minus source center.
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
        let decimated: Vec<Complex32> = filtered
            .iter()
            .step_by(self.input_decimation)
            .copied()
            .collect();

        let narrowed = match self.carson_filter.as_mut() {
            Some(filter) => filter.process(&decimated),
            None => decimated,
        };

        let soft_fm = self.quad_demod.process(&narrowed);
        let pulse_shaped = self.pulse_filter.process(&soft_fm);
        if pulse_shaped.is_empty() {
            return Ok(Vec::new());
        }
        let centered = self.dc_block.process(&pulse_shaped);
        let leveled = self.agc.process(&centered);

        let symbols = self.clock.process(&leveled);
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

    /// Modulate an NRZI bit stream as FSK at `rate`, `baud`, `dev`.
    fn fsk_modulate(bits: &[bool], rate: f64, baud: f64, deviation: f64) -> Vec<Complex32> {
        let sps = rate / baud;
        let mut phase = 0.0f64;
        let mut samples = Vec::new();
        for &bit in bits {
            let tone = if bit { deviation } else { -deviation };
            for _ in 0..sps.round() as usize {
                phase += TAU * tone / rate;
                samples.push(Complex32::new(phase.cos() as f32, phase.sin() as f32));
            }
        }
        samples
    }

    #[test]
    fn test_fsk_decodes_ax25_frame() {
        let frame = ax25::build_ui_frame("LUSAT-1", "CQ", b"fsk loopback test");
        let stuffed = hdlc_encode(&frame, 32);
        // Pad with trailing flags so the clock loop has signal after
        // the closing flag.
        let mut padded = stuffed;
        padded.extend(hdlc_encode(b"tail pad", 16));
        let line_bits = nrzi_encode(&padded);

        let rate = 48_000.0;
        let baud = 1_200.0;
        let deviation = 3_000.0;
        let iq = fsk_modulate(&line_bits, rate, baud, deviation);

        let mut frontend = FskFrontEnd::new(baud as u32, deviation as f32);
        let mut frames = Vec::new();
        for chunk in iq.chunks(8192) {
            frames.extend(frontend.process(chunk, rate as u32, 0.0).unwrap());
        }
        assert!(
            frames.iter().any(|f| f == &frame),
            "expected frame not recovered ({} frames seen)",
            frames.len()
        );
    }

    #[test]
    fn test_fsk_tolerates_frequency_offset() {
        let frame = ax25::build_ui_frame("DP0BEE", "CQ", b"offset");
        let mut bits = hdlc_encode(&frame, 32);
        bits.extend(hdlc_encode(b"pad", 16));
        let line_bits = nrzi_encode(&bits);

        let rate = 48_000.0;
        let iq = fsk_modulate(&line_bits, rate, 1_200.0, 3_000.0);
        // Shift the whole signal up 500 Hz and tell the front-end.
        let mut shifter = FrequencyShifter::new();
        let shifted = shifter.shift(&iq, -500.0, rate);

        let mut frontend = FskFrontEnd::new(1_200, 3_000.0);
        let mut frames = Vec::new();
        for chunk in shifted.chunks(8192) {
            frames.extend(frontend.process(chunk, rate as u32, 500.0).unwrap());
        }
        assert!(frames.iter().any(|f| f == &frame));
    }

    #[test]
    fn test_fsk_survives_channel_noise() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};
        use rand_distr::StandardNormal;

        let frame = ax25::build_ui_frame("LUSAT", "CQ", b"noisy channel");
        let mut bits = hdlc_encode(&frame, 32);
        bits.extend(hdlc_encode(b"pad", 16));
        let line_bits = nrzi_encode(&bits);

        let rate = 48_000.0;
        let mut rng = StdRng::seed_from_u64(7);
        let iq: Vec<Complex32> = fsk_modulate(&line_bits, rate, 1_200.0, 3_000.0)
            .into_iter()
            .map(|s| {
                let ni: f32 = rng.sample::<f32, _>(StandardNormal) * 0.05;
                let nq: f32 = rng.sample::<f32, _>(StandardNormal) * 0.05;
                s + Complex32::new(ni, nq)
            })
            .collect();

        let mut frontend = FskFrontEnd::new(1_200, 3_000.0);
        let mut frames = Vec::new();
        for chunk in iq.chunks(8192) {
            frames.extend(frontend.process(chunk, rate as u32, 0.0).unwrap());
        }
        assert!(frames.iter().any(|f| f == &frame));
    }

    #[test]
    fn test_empty_input_is_noop() {
        let mut frontend = FskFrontEnd::new(9_600, 5_000.0);
        assert!(frontend.process(&[], 48_000, 0.0).unwrap().is_empty());
    }
}
