//! Morse/CW decoder. Consumes demodulated SSB/CW audio (not IQ):
//! bandpass around the expected tone, RMS envelope detection over 5 ms
//! windows, an adaptive median threshold over a 500 ms history, and a
//! counter-based keying state machine. The counter advances once per
//! ~23 ms audio hop: positive while the tone is on, negative through
//! silence, with dit/dash/break/space thresholds.

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::signal_processing::filters::{butterworth_bandpass, IirFilter};

/// International Morse table, 54 symbols.
const MORSE_TABLE: &[(&str, char)] = &[
    (".-", 'A'),
    ("-...", 'B'),
    ("-.-.", 'C'),
    ("-..", 'D'),
    (".", 'E'),
    ("..-.", 'F'),
    ("--.", 'G'),
    ("....", 'H'),
    ("..", 'I'),
    (".---", 'J'),
    ("-.-", 'K'),
    (".-..", 'L'),
    ("--", 'M'),
    ("-.", 'N'),
    ("---", 'O'),
    (".--.", 'P'),
    ("--.-", 'Q'),
    (".-.", 'R'),
    ("...", 'S'),
    ("-", 'T'),
    ("..-", 'U'),
    ("...-", 'V'),
    (".--", 'W'),
    ("-..-", 'X'),
    ("-.--", 'Y'),
    ("--..", 'Z'),
    ("-----", '0'),
    (".----", '1'),
    ("..---", '2'),
    ("...--", '3'),
    ("....-", '4'),
    (".....", '5'),
    ("-....", '6'),
    ("--...", '7'),
    ("---..", '8'),
    ("----.", '9'),
    ("..--..", '?'),
    (".----.", '\''),
    (".-.-.-", '.'),
    ("--..--", ','),
    ("-.-.--", '!'),
    ("-..-.", '/'),
    ("-.--.", '('),
    ("-.--.-", ')'),
    (".-...", '&'),
    ("---...", ':'),
    ("-.-.-.", ';'),
    ("-...-", '='),
    (".-.-.", '+'),
    ("-....-", '-'),
    ("..--.-", '_'),
    (".-..-.", '"'),
    ("...-..-", '$'),
    (".--.-.", '@'),
];

fn lookup(symbol: &str) -> Option<char> {
    MORSE_TABLE
        .iter()
        .find(|(code, _)| *code == symbol)
        .map(|(_, ch)| *ch)
}

/// Counter thresholds, in hops.
const DIT_THRESHOLD: i32 = 4;
const DASH_THRESHOLD: i32 = 15;
const BREAK_THRESHOLD: i32 = -5;
const SPACE_THRESHOLD: i32 = -15;

const MAX_DECODED_LENGTH: usize = 300;

/// WPM bounds; dit length in seconds maps through `1.2 / wpm`.
const MIN_WPM: u32 = 5;
const MAX_WPM: u32 = 50;

/// Hop between state-machine steps, seconds (one audio frame at the
/// demodulator's 1024-sample cadence).
const HOP_SECS: f32 = 0.023;
/// RMS window inside a hop, seconds.
const ENVELOPE_WINDOW_SECS: f32 = 0.005;
/// Envelope history for the adaptive threshold, seconds.
const HISTORY_SECS: f32 = 0.5;

pub struct MorseDecoder {
    tone_filter: IirFilter<f32>,
    pending: Vec<f32>,
    hop: usize,
    envelope_window: usize,
    envelope_history: VecDeque<f32>,
    max_history: usize,
    state_counter: i32,
    current_symbol: String,
    decoded_text: String,
    pub character_count: u64,
    pub wpm: Option<u32>,
    hop_secs: f64,
    dit_elapsed_secs: Option<f64>,
    pub signal_strength: f32,
    pub threshold: f32,
}

impl MorseDecoder {
    pub fn new(sample_rate: u32, tone_freq_hz: f32, tone_bandwidth_hz: f32) -> Self {
        let rate = sample_rate.max(8_000) as f32;
        let nyquist = rate as f64 / 2.0;
        let center = (tone_freq_hz as f64 / nyquist).clamp(0.001, 0.999);
        let bandwidth = (tone_bandwidth_hz as f64 / nyquist).clamp(0.001, 0.5);
        let sections = butterworth_bandpass(center, bandwidth).unwrap_or_default();

        let hop = ((rate * HOP_SECS) as usize).max(64);
        let envelope_window = ((rate * ENVELOPE_WINDOW_SECS) as usize).max(16);
        let max_history = ((HISTORY_SECS / HOP_SECS) as usize).max(8);
        Self {
            tone_filter: IirFilter::new(sections),
            pending: Vec::with_capacity(hop * 2),
            hop,
            envelope_window,
            envelope_history: VecDeque::with_capacity(max_history),
            max_history,
            state_counter: 0,
            current_symbol: String::new(),
            decoded_text: String::new(),
            character_count: 0,
            wpm: None,
            hop_secs: hop as f64 / rate as f64,
            dit_elapsed_secs: None,
            signal_strength: 0.0,
            threshold: 0.0,
        }
    }

    pub fn decoded_text(&self) -> &str {
        &self.decoded_text
    }

    /// Feed demodulated audio; returns characters decoded in this call.
    pub fn process(&mut self, audio: &[f32]) -> Vec<char> {
        let filtered = self.tone_filter.process(audio);
        self.pending.extend(filtered);

        let mut decoded = Vec::new();
        while self.pending.len() >= self.hop {
            let hop: Vec<f32> = self.pending.drain(..self.hop).collect();

            // RMS over the tail window of this hop.
            let tail = &hop[hop.len() - self.envelope_window..];
            let level =
                (tail.iter().map(|x| x * x).sum::<f32>() / tail.len() as f32).sqrt();
            self.signal_strength = level;

            self.envelope_history.push_back(level);
            while self.envelope_history.len() > self.max_history {
                self.envelope_history.pop_front();
            }

            if let Some(threshold) = self.adaptive_threshold() {
                self.threshold = threshold;
                if let Some(ch) = self.step(level > threshold) {
                    decoded.push(ch);
                }
            }
        }
        decoded
    }

    /// 50th percentile of the envelope history, bounded by the
    /// min/max midpoint so a long dash that floods the window cannot
    /// drag the threshold up to the tone level itself.
    fn adaptive_threshold(&self) -> Option<f32> {
        if self.envelope_history.len() < 8 {
            return None;
        }
        let mut sorted: Vec<f32> = self.envelope_history.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = sorted[sorted.len() / 2];
        let midpoint = (sorted[0] + sorted[sorted.len() - 1]) / 2.0;
        Some(median.min(midpoint))
    }

    fn step(&mut self, tone_present: bool) -> Option<char> {
        if tone_present {
            if self.state_counter < 0 {
                self.state_counter = 0;
            }
            self.state_counter += 1;
            *self.dit_elapsed_secs.get_or_insert(0.0) += self.hop_secs;
            return None;
        }

        if self.state_counter > DASH_THRESHOLD {
            debug!(counter = self.state_counter, "dash detected");
            self.state_counter = 0;
            self.current_symbol.push('-');
            self.dit_elapsed_secs = None;
            return None;
        }

        if self.state_counter > DIT_THRESHOLD {
            debug!(counter = self.state_counter, "dit detected");
            self.state_counter = 0;
            self.current_symbol.push('.');
            if let Some(elapsed) = self.dit_elapsed_secs.take() {
                if elapsed > 0.0 {
                    let wpm = (1.2 / elapsed) as u32;
                    self.wpm = Some(wpm.clamp(MIN_WPM, MAX_WPM));
                }
            }
            return None;
        }

        if self.state_counter == BREAK_THRESHOLD {
            self.state_counter -= 1;
            if !self.current_symbol.is_empty() {
                let symbol = std::mem::take(&mut self.current_symbol);
                let ch = lookup(&symbol).unwrap_or('?');
                info!(morse = %symbol, decoded = %ch, "character decoded");
                self.push_char(ch);
                return Some(ch);
            }
            return None;
        }

        self.state_counter -= 1;
        if self.state_counter == SPACE_THRESHOLD
            && !self.decoded_text.is_empty()
            && !self.decoded_text.ends_with(' ')
        {
            self.push_char(' ');
            return Some(' ');
        }
        None
    }

    fn push_char(&mut self, ch: char) {
        self.decoded_text.push(ch);
        if self.decoded_text.len() > MAX_DECODED_LENGTH {
            let excess = self.decoded_text.len() - MAX_DECODED_LENGTH;
            self.decoded_text.drain(..excess);
        }
        if ch != ' ' {
            self.character_count += 1;
        }
    }
}
