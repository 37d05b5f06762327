//! Configuration types for the Groundwave pipeline.
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Window function applied before the FFT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    #[default]
    Hann,
    Hamming,
    Blackman,
    Rect,
}

/// Modulation assigned to a VFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Modulation {
    Fm,
    FmStereo,
    Am,
    Usb,
    Lsb,
    Cw,
    #[default]
    None,
}

impl Modulation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modulation::Fm => "fm",
            Modulation::FmStereo => "fm_stereo",
            Modulation::Am => "am",
            Modulation::Usb => "usb",
            Modulation::Lsb => "lsb",
            Modulation::Cw => "cw",
            Modulation::None => "none",
        }
    }

    /// SSB-family modes share the sideband-selection demodulator.
    pub fn is_ssb(&self) -> bool {
        matches!(self, Modulation::Usb | Modulation::Lsb | Modulation::Cw)
    }
}

/// Protocol decoder assigned to a VFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    #[default]
    None,
    Afsk,
    Bpsk,
    Gmsk,
    Gfsk,
    Morse,
}

impl DecoderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecoderKind::None => "none",
            DecoderKind::Afsk => "afsk",
            DecoderKind::Bpsk => "bpsk",
            DecoderKind::Gmsk => "gmsk",
            DecoderKind::Gfsk => "gfsk",
            DecoderKind::Morse => "morse",
        }
    }

    /// Morse feeds on demodulated audio; everything else consumes IQ.
    pub fn consumes_audio(&self) -> bool {
        matches!(self, DecoderKind::Morse)
    }
}

/// Link-layer framing used by a transmitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    #[default]
    Ax25,
    Usp,
    Ax100Rs,
    Ax100Asm,
    Geoscan,
    Doka,
}

impl Framing {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framing::Ax25 => "ax25",
            Framing::Usp => "usp",
            Framing::Ax100Rs => "ax100_rs",
            Framing::Ax100Asm => "ax100_asm",
            Framing::Geoscan => "geoscan",
            Framing::Doka => "doka",
        }
    }

    /// Payload protocol implied by the framing tag.
    pub fn payload_protocol(&self) -> &'static str {
        match self {
            Framing::Doka => "ccsds",
            Framing::Ax25 | Framing::Usp => "ax25",
            Framing::Ax100Rs | Framing::Ax100Asm => "csp",
            Framing::Geoscan => "proprietary",
        }
    }
}

/// Speech-to-text provider for a VFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionProvider {
    #[default]
    Deepgram,
    Gemini,
}

impl TranscriptionProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptionProvider::Deepgram => "deepgram",
            TranscriptionProvider::Gemini => "gemini",
        }
    }
}

/// Kind of sample source, with per-kind connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SourceKind {
    RtlsdrUsb {
        serial: String,
    },
    RtlsdrTcp {
        host: String,
        port: u16,
    },
    SoapyRemote {
        host: String,
        port: u16,
        driver: String,
    },
    SoapyLocal {
        driver: String,
        serial: String,
    },
    Uhd {
        serial: String,
    },
    SigmfPlayback {
        recording_path: String,
        #[serde(default = "default_true")]
        loop_playback: bool,
    },
}

fn default_true() -> bool {
    true
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::RtlsdrUsb { .. } => "rtlsdr-usb",
            SourceKind::RtlsdrTcp { .. } => "rtlsdr-tcp",
            SourceKind::SoapyRemote { .. } => "soapy-remote",
            SourceKind::SoapyLocal { .. } => "soapy-local",
            SourceKind::Uhd { .. } => "uhd",
            SourceKind::SigmfPlayback { .. } => "sigmf-playback",
        }
    }
}

/// Identity and connection parameters for one radio or recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: SourceKind,
}

/// Frequency range supported by a tuner, in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRange {
    pub min_hz: i64,
    pub max_hz: i64,
}

/// Runtime capabilities of a source, enumerated once and cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Capabilities {
    pub gain_values_db: Vec<f64>,
    pub sample_rate_values: Vec<u32>,
    pub fft_size_values: Vec<usize>,
    pub antennas: Vec<String>,
    pub frequency_range: Option<FrequencyRange>,
    pub has_agc: bool,
    pub clock_source: Option<String>,
    /// Playback-only: recording length in samples.
    pub total_samples: Option<u64>,
    /// Playback-only: recording length in seconds.
    pub duration_secs: Option<f64>,
}

/// Spectrum display parameters, applied in-flight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectrumConfig {
    pub fft_size: usize,
    pub window: Window,
    pub averaging: u32,
    pub overlap: bool,
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            fft_size: 1024,
            window: Window::Hann,
            averaging: 6,
            overlap: false,
        }
    }
}

/// Gain setting: a manual value in dB or hardware AGC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gain {
    Db(f64),
    Agc,
}

impl Default for Gain {
    fn default() -> Self {
        Gain::Db(20.0)
    }
}

/// Full configuration of a running source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub center_freq: i64,
    pub sample_rate: u32,
    pub gain: Gain,
    pub antenna: Option<String>,
    /// Offset applied for external down-converters.
    pub offset_freq: i64,
    pub spectrum: SpectrumConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            center_freq: 100_000_000,
            sample_rate: 2_048_000,
            gain: Gain::default(),
            antenna: None,
            offset_freq: 0,
            spectrum: SpectrumConfig::default(),
        }
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate {
                rate: self.sample_rate,
            });
        }
        if self.spectrum.averaging < 1 {
            return Err(ConfigError::InvalidAveraging {
                averaging: self.spectrum.averaging,
            });
        }
        Ok(())
    }

    /// Apply a patch, returning what kind of change it was.
    pub fn apply(&mut self, patch: &ConfigPatch) -> ConfigChange {
        let mut change = ConfigChange::None;

        if let Some(freq) = patch.center_freq {
            if freq != self.center_freq {
                self.center_freq = freq;
                change = change.max(ConfigChange::RequiresFlush);
            }
        }
        if let Some(rate) = patch.sample_rate {
            if rate != self.sample_rate {
                self.sample_rate = rate;
                change = change.max(ConfigChange::RequiresFlush);
            }
        }
        if let Some(gain) = patch.gain {
            if gain != self.gain {
                self.gain = gain;
                change = change.max(ConfigChange::InFlight);
            }
        }
        if let Some(ref antenna) = patch.antenna {
            if Some(antenna) != self.antenna.as_ref() {
                self.antenna = Some(antenna.clone());
                change = change.max(ConfigChange::InFlight);
            }
        }
        if let Some(offset) = patch.offset_freq {
            if offset != self.offset_freq {
                self.offset_freq = offset;
                change = change.max(ConfigChange::InFlight);
            }
        }
        if let Some(fft_size) = patch.fft_size {
            if fft_size != self.spectrum.fft_size {
                self.spectrum.fft_size = fft_size;
                change = change.max(ConfigChange::InFlight);
            }
        }
        if let Some(window) = patch.fft_window {
            if window != self.spectrum.window {
                self.spectrum.window = window;
                change = change.max(ConfigChange::InFlight);
            }
        }
        if let Some(averaging) = patch.fft_averaging {
            if averaging != self.spectrum.averaging {
                self.spectrum.averaging = averaging;
                change = change.max(ConfigChange::InFlight);
            }
        }
        if let Some(overlap) = patch.fft_overlap {
            if overlap != self.spectrum.overlap {
                self.spectrum.overlap = overlap;
                change = change.max(ConfigChange::InFlight);
            }
        }

        change
    }
}

/// Effect of applying a configuration patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigChange {
    /// Nothing changed; the patch was a no-op.
    None,
    /// Applied without interrupting the sample stream.
    InFlight,
    /// Sample-rate or center-frequency change: hardware buffers must be
    /// flushed (stop, set, restart) before the next block.
    RequiresFlush,
}

/// Partial update to a source configuration. Delivered to the worker as
/// a single message; unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub center_freq: Option<i64>,
    pub sample_rate: Option<u32>,
    pub gain: Option<Gain>,
    pub antenna: Option<String>,
    pub offset_freq: Option<i64>,
    pub fft_size: Option<usize>,
    pub fft_window: Option<Window>,
    pub fft_averaging: Option<u32>,
    pub fft_overlap: Option<bool>,
}

/// Demodulator tuning knobs shared by all modes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DemodConfig {
    /// Output audio rate, Hz.
    pub audio_rate: u32,
    /// Fixed output frame length, samples.
    pub frame_size: usize,
    /// Empirical offset aligning measured RF power with the waterfall.
    pub calibration_offset_db: f32,
    /// FM deviation used by the discriminator, Hz.
    pub fm_deviation_hz: f32,
    /// De-emphasis time constant, microseconds (75 in the Americas, 50
    /// elsewhere).
    pub deemphasis_us: f32,
    /// Power measurements republished at most this often, Hz.
    pub power_update_rate: f32,
}

impl Default for DemodConfig {
    fn default() -> Self {
        Self {
            audio_rate: 44_100,
            frame_size: 1024,
            calibration_offset_db: 17.0,
            fm_deviation_hz: 75_000.0,
            deemphasis_us: 75.0,
            power_update_rate: 4.0,
        }
    }
}

/// Satellite identity attached to decoder output when known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SatelliteInfo {
    pub norad_id: u32,
    pub name: String,
}

/// Transmitter context for a decoder, from the observation database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TransmitterInfo {
    pub description: String,
    pub mode: String,
    pub downlink_freq_hz: Option<i64>,
    pub baud: Option<u32>,
    pub deviation_hz: Option<f32>,
    #[serde(default)]
    pub framing: Framing,
}

/// Static parameters for one decoder instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub kind: DecoderKind,
    pub baudrate: u32,
    pub deviation_hz: f32,
    pub framing: Framing,
    /// Where the configuration came from ("vfo", "transmitter", ...).
    pub source: String,
    pub satellite: Option<SatelliteInfo>,
    pub transmitter: Option<TransmitterInfo>,
    pub output_dir: String,
    /// Morse only: expected tone frequency, Hz.
    pub tone_freq_hz: f32,
    /// Morse only: tone detection bandwidth, Hz.
    pub tone_bandwidth_hz: f32,
}

impl DecoderConfig {
    pub fn new(kind: DecoderKind) -> Self {
        Self {
            kind,
            baudrate: 9600,
            deviation_hz: 5000.0,
            framing: Framing::Ax25,
            source: "vfo".to_string(),
            satellite: None,
            transmitter: None,
            output_dir: "data/decoded".to_string(),
            tone_freq_hz: 800.0,
            tone_bandwidth_hz: 500.0,
        }
    }

    /// Fill baud/deviation/framing from a transmitter record.
    pub fn with_transmitter(mut self, transmitter: TransmitterInfo) -> Self {
        if let Some(baud) = transmitter.baud {
            self.baudrate = baud;
        }
        if let Some(dev) = transmitter.deviation_hz {
            self.deviation_hz = dev;
        }
        self.framing = transmitter.framing;
        self.source = "transmitter".to_string();
        self.transmitter = Some(transmitter);
        self
    }
}

/// Transcription settings carried per VFO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionSettings {
    pub enabled: bool,
    pub provider: TranscriptionProvider,
    /// Source language code, or "auto".
    pub language: String,
    /// Target language for translation, or "none".
    pub translate_to: String,
}

impl Default for TranscriptionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: TranscriptionProvider::Deepgram,
            language: "auto".to_string(),
            translate_to: "none".to_string(),
        }
    }
}

/// API credentials for the transcription providers. Rotating a key takes
/// effect on the next (re)connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiKeys {
    pub deepgram: Option<String>,
    pub gemini: Option<String>,
    pub google_translate: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_same_rate_is_no_op() {
        let mut config = SourceConfig::default();
        let patch = ConfigPatch {
            sample_rate: Some(config.sample_rate),
            ..Default::default()
        };
        assert_eq!(config.apply(&patch), ConfigChange::None);
    }

    #[test]
    fn test_patch_applied_twice_is_idempotent() {
        let mut config = SourceConfig::default();
        let patch = ConfigPatch {
            center_freq: Some(101_100_000),
            ..Default::default()
        };
        assert_eq!(config.apply(&patch), ConfigChange::RequiresFlush);
        assert_eq!(config.apply(&patch), ConfigChange::None);
        assert_eq!(config.center_freq, 101_100_000);
    }

    #[test]
    fn test_gain_change_applies_in_flight() {
        let mut config = SourceConfig::default();
        let patch = ConfigPatch {
            gain: Some(Gain::Agc),
            ..Default::default()
        };
        assert_eq!(config.apply(&patch), ConfigChange::InFlight);
    }

    #[test]
    fn test_mixed_patch_reports_strongest_change() {
        let mut config = SourceConfig::default();
        let patch = ConfigPatch {
            gain: Some(Gain::Db(30.0)),
            sample_rate: Some(1_024_000),
            ..Default::default()
        };
        assert_eq!(config.apply(&patch), ConfigChange::RequiresFlush);
    }

    #[test]
    fn test_framing_payload_protocols() {
        assert_eq!(Framing::Doka.payload_protocol(), "ccsds");
        assert_eq!(Framing::Usp.payload_protocol(), "ax25");
        assert_eq!(Framing::Ax100Rs.payload_protocol(), "csp");
        assert_eq!(Framing::Geoscan.payload_protocol(), "proprietary");
    }

    #[test]
    fn test_source_kind_roundtrips_through_json() {
        let descriptor = SourceDescriptor {
            id: "rtl-0".into(),
            name: "Roof dongle".into(),
            kind: SourceKind::RtlsdrTcp {
                host: "10.0.0.2".into(),
                port: 1234,
            },
        };
        let json = serde_json::to_string(&descriptor).unwrap();
        let back: SourceDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let config = SourceConfig {
            sample_rate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
