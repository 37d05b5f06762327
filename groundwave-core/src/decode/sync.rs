//! Symbol-recovery primitives: Gardner timing-error-detector clock
//! recovery, a BPSK Costas loop, DC blocking and slow AGC.

use num_complex::Complex32;

/// Gardner TED clock recovery with linear interpolation.
///
/// Loop constants follow the FSK demodulator lineage: TED gain 1.47,
/// damping 1.0, loop bandwidth and limit relative to the baud rate.
#[derive(Debug, Clone)]
pub struct GardnerSync {
    sps_nominal: f32,
    omega: f32,
    omega_limit: f32,
    gain_mu: f32,
    gain_omega: f32,
    buffer: Vec<f32>,
    /// Fractional position of the next symbol center in `buffer`.
    pos: f32,
}

pub const TED_GAIN: f32 = 1.47;
pub const DAMPING: f32 = 1.0;
pub const DEFAULT_LOOP_BW: f32 = 0.06;
pub const DEFAULT_LOOP_LIMIT: f32 = 0.004;

impl GardnerSync {
    pub fn new(samples_per_symbol: f32, loop_bw: f32, loop_limit: f32) -> Self {
        let bw = loop_bw.max(1e-4);
        let denom = 1.0 + 2.0 * DAMPING * bw + bw * bw;
        let gain_mu = (4.0 * DAMPING * bw / denom) / TED_GAIN;
        let gain_omega = (4.0 * bw * bw / denom) / TED_GAIN;
        Self {
            sps_nominal: samples_per_symbol,
            omega: samples_per_symbol,
            omega_limit: loop_limit * samples_per_symbol,
            gain_mu,
            gain_omega,
            buffer: Vec::new(),
            pos: samples_per_symbol,
        }
    }

    fn interpolate(&self, p: f32) -> f32 {
        let idx = p.max(0.0) as usize;
        let frac = p.max(0.0) - idx as f32;
        let a = self.buffer.get(idx).copied().unwrap_or(0.0);
        let b = self.buffer.get(idx + 1).copied().unwrap_or(a);
        a * (1.0 - frac) + b * frac
    }

    /// Push soft samples; returns soft symbol decisions at baud rate.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        self.buffer.extend_from_slice(input);
        let mut symbols = Vec::new();

        while (self.pos as usize) + 2 < self.buffer.len() {
            let y_cur = self.interpolate(self.pos);
            let y_mid = self.interpolate(self.pos - self.omega / 2.0);
            let y_prev = self.interpolate(self.pos - self.omega);

            let error = ((y_cur - y_prev) * y_mid).clamp(-1.0, 1.0);
            self.omega = (self.omega + self.gain_omega * error).clamp(
                self.sps_nominal - self.omega_limit,
                self.sps_nominal + self.omega_limit,
            );
            self.pos += self.omega + self.gain_mu * error;
            symbols.push(y_cur);
        }

        // Keep one symbol of history for the midpoint/previous taps.
        let history = (2.0 * self.sps_nominal).ceil() as usize + 2;
        if self.buffer.len() > history {
            let drop = self
                .buffer
                .len()
                .saturating_sub(history)
                .min(self.pos.max(0.0) as usize);
            if drop > 0 {
                self.buffer.drain(..drop);
                self.pos -= drop as f32;
            }
        }
        symbols
    }
}

/// Second-order Costas loop for BPSK carrier recovery.
#[derive(Debug, Clone)]
pub struct CostasLoop {
    phase: f32,
    freq: f32,
    alpha: f32,
    beta: f32,
    freq_limit: f32,
}

impl CostasLoop {
    pub fn new(loop_bw: f32) -> Self {
        let bw = loop_bw.max(1e-4);
        let denom = 1.0 + 2.0 * DAMPING * bw + bw * bw;
        Self {
            phase: 0.0,
            freq: 0.0,
            alpha: 4.0 * DAMPING * bw / denom,
            beta: 4.0 * bw * bw / denom,
            freq_limit: 1.0,
        }
    }

    /// Rotate the input onto the real axis; returns the real rail.
    pub fn process(&mut self, input: &[Complex32]) -> Vec<f32> {
        let mut output = Vec::with_capacity(input.len());
        for &x in input {
            let (sin, cos) = (-self.phase).sin_cos();
            let y = x * Complex32::new(cos, sin);
            // BPSK phase detector: re * im.
            let error = (y.re * y.im).clamp(-1.0, 1.0);
            self.freq = (self.freq + self.beta * error).clamp(-self.freq_limit, self.freq_limit);
            self.phase += self.freq + self.alpha * error;
            if self.phase > std::f32::consts::TAU {
                self.phase -= std::f32::consts::TAU;
            } else if self.phase < -std::f32::consts::TAU {
                self.phase += std::f32::consts::TAU;
            }
            output.push(y.re);
        }
        output
    }
}

/// Moving-average DC blocker over a fixed window.
#[derive(Debug, Clone)]
pub struct DcBlocker {
    window: usize,
    ring: Vec<f32>,
    next: usize,
    sum: f32,
    filled: usize,
}

impl DcBlocker {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            ring: vec![0.0; window],
            next: 0,
            sum: 0.0,
            filled: 0,
        }
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        input
            .iter()
            .map(|&x| {
                self.sum -= self.ring[self.next];
                self.ring[self.next] = x;
                self.sum += x;
                self.next = (self.next + 1) % self.window;
                self.filled = (self.filled + 1).min(self.window);
                x - self.sum / self.filled as f32
            })
            .collect()
    }
}

/// Slow AGC toward unit amplitude, time constant ~50 symbols.
#[derive(Debug, Clone)]
pub struct Agc {
    rate: f32,
    level: f32,
}

impl Agc {
    pub fn new(rate: f32) -> Self {
        Self {
            rate: rate.clamp(1e-6, 1.0),
            level: 1.0,
        }
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        input
            .iter()
            .map(|&x| {
                self.level += self.rate * (x.abs() - self.level);
                let level = self.level.max(1e-6);
                (x / level).clamp(-4.0, 4.0)
            })
            .collect()
    }
}
