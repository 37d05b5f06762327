//! Groundwave error types with granular categories

use thiserror::Error;

/// Top-level error type for all Groundwave operations
#[derive(Debug, Error)]
pub enum GroundwaveError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("DSP processing error: {0}")]
    Dsp(#[from] DspError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transcription error: {0}")]
    Transcribe(#[from] TranscribeError),
}

/// Errors raised by sample-source drivers and workers
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Read timed out after {timeout_ms} ms")]
    ReadTimeout { timeout_ms: u64 },

    #[error("Hardware buffer overflow, block dropped")]
    Overflow,

    #[error("Unreachable server {host}:{port}: {reason}")]
    Unreachable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Bad handshake from {host}: expected RTL0 magic")]
    BadHandshake { host: String },

    #[error("No native driver available for source kind {kind}")]
    DriverUnavailable { kind: &'static str },

    #[error("SigMF metadata file not found: {path}")]
    MetadataNotFound { path: String },

    #[error("SigMF data file not found: {path}")]
    DataNotFound { path: String },

    #[error("Unsupported SigMF datatype: {datatype}")]
    UnsupportedDatatype { datatype: String },

    #[error("Capability probe timed out after {timeout_secs} s")]
    ProbeTimeout { timeout_secs: u64 },

    #[error("Source worker terminated unexpectedly")]
    Terminated,
}

/// DSP processing errors
#[derive(Debug, Error)]
pub enum DspError {
    #[error("Filter design failed: {reason}")]
    FilterDesignFailed { reason: String },

    #[error("Invalid cutoff {cutoff_hz} Hz for sample rate {sample_rate} Hz")]
    InvalidCutoff { cutoff_hz: f64, sample_rate: u32 },

    #[error("FFT size {size} is not a power of 2")]
    InvalidFftSize { size: usize },

    #[error("Non-finite sample encountered in {stage}")]
    NonFiniteSample { stage: &'static str },

    #[error("Decimation factor {factor} exceeds block length {len}")]
    DecimationTooLarge { factor: usize, len: usize },

    #[error("Resampler failed: {reason}")]
    ResampleFailed { reason: String },
}

/// Configuration errors, rejected before they reach a worker
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid sample rate: {rate} Hz (must be > 0)")]
    InvalidSampleRate { rate: u32 },

    #[error("Invalid VFO number: {vfo} (must be 1-4)")]
    InvalidVfoNumber { vfo: u8 },

    #[error("VFO at {vfo_freq_hz} Hz is outside SDR bandwidth ({low_hz}-{high_hz} Hz)")]
    VfoOutOfBand {
        vfo_freq_hz: i64,
        low_hz: i64,
        high_hz: i64,
    },

    #[error("Decoder {decoder} is incompatible with modulation {modulation}")]
    IncompatibleDecoder {
        decoder: &'static str,
        modulation: &'static str,
    },

    #[error("Invalid FFT averaging: {averaging} (must be >= 1)")]
    InvalidAveraging { averaging: u32 },

    #[error("Invalid volume: {volume} (must be 0-100)")]
    InvalidVolume { volume: u8 },

    #[error("Missing field in source configuration: {field}")]
    MissingField { field: &'static str },
}

/// Session/VFO state-store errors
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Unknown session: {session_id}")]
    UnknownSession { session_id: String },

    #[error("Session {session_id} is not attached to any source")]
    NotAttached { session_id: String },

    #[error("Unknown source: {source_id}")]
    UnknownSource { source_id: String },

    #[error("Observation {observation_id} has no internal session")]
    UnknownObservation { observation_id: String },
}

/// Packet decoder errors
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Frame checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("Frame too short: {len} bytes")]
    FrameTooShort { len: usize },

    #[error("Invalid AX.25 address field")]
    InvalidAddress,

    #[error("Packet persistence failed: {0}")]
    Persist(#[from] std::io::Error),

    #[error("Sample rate {sample_rate} sps insufficient for {baud} baud")]
    BaudTooHigh { sample_rate: u32, baud: u32 },

    #[error("Decoder kind {kind} does not consume this stream")]
    UnsupportedKind { kind: &'static str },
}

/// Transcription worker errors, surfaced to the UI with a typed tag
#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("API quota exceeded for {provider}")]
    QuotaExceeded { provider: &'static str },

    #[error("Invalid API key for {provider}")]
    InvalidApiKey { provider: &'static str },

    #[error("Rate limit reached for {provider}")]
    RateLimit { provider: &'static str },

    #[error("Network error connecting to {provider}: {reason}")]
    Network {
        provider: &'static str,
        reason: String,
    },

    #[error("Provider deadline exceeded")]
    Deadline,

    #[error("Transcription error: {reason}")]
    Unknown { reason: String },
}

impl TranscribeError {
    /// Classify a provider error by substring-matching the
    /// transport-level message; providers do not expose typed errors.
    pub fn classify(provider: &'static str, message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("quota") || lower.contains("exceeded") {
            TranscribeError::QuotaExceeded { provider }
        } else if lower.contains("api key")
            || lower.contains("authentication")
            || lower.contains("unauthorized")
            || lower.contains("401")
        {
            TranscribeError::InvalidApiKey { provider }
        } else if lower.contains("rate limit") || lower.contains("429") {
            TranscribeError::RateLimit { provider }
        } else if lower.contains("deadline") || lower.contains("timeout") {
            TranscribeError::Deadline
        } else if lower.contains("network") || lower.contains("connection") {
            TranscribeError::Network {
                provider,
                reason: message.to_string(),
            }
        } else {
            TranscribeError::Unknown {
                reason: message.to_string(),
            }
        }
    }

    /// Timeouts are retried silently, never shown to the UI.
    pub fn is_silent(&self) -> bool {
        matches!(self, TranscribeError::Deadline)
    }
}

/// Result type alias for Groundwave operations
pub type Result<T> = std::result::Result<T, GroundwaveError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_quota_error() {
        let err = TranscribeError::classify("deepgram", "Quota exceeded for project");
        assert!(matches!(err, TranscribeError::QuotaExceeded { .. }));
    }

    #[test]
    fn test_classify_timeout_is_silent() {
        let err = TranscribeError::classify("gemini", "Deadline exceeded while streaming");
        assert!(err.is_silent());
    }

    #[test]
    fn test_classify_unknown_falls_through() {
        let err = TranscribeError::classify("deepgram", "something odd happened");
        assert!(matches!(err, TranscribeError::Unknown { .. }));
        assert!(!err.is_silent());
    }
}
