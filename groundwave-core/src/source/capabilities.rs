//! Source capability enumeration with caching.
//!
//! Hardware probing is slow (tens of seconds against remote Soapy and
//! UHD devices), so results are cached per descriptor. A probe timeout
//! falls back to cached data when present. Playback capabilities are
//! never cached: the recording behind the descriptor may change.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::{Capabilities, FrequencyRange, SourceDescriptor, SourceKind};
use crate::errors::SourceError;
use crate::sigmf::Recording;

/// Overall budget for a hardware capability probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Tuner gain steps common to RTL-SDR dongles, dB.
pub const RTL_GAIN_VALUES: [f64; 28] = [
    0.0, 0.9, 1.4, 2.7, 3.7, 7.7, 8.7, 12.5, 14.4, 15.7, 16.6, 19.7, 20.7, 22.9, 25.4, 28.0, 29.7,
    32.8, 33.8, 36.4, 37.2, 38.6, 40.2, 42.1, 43.4, 43.9, 44.5, 48.0,
];

/// Sample rates common to RTL-SDR dongles, Hz.
pub const RTL_SAMPLE_RATES: [u32; 13] = [
    240_000, 300_000, 960_000, 1_024_000, 1_536_000, 1_792_000, 1_920_000, 2_048_000, 2_304_000,
    2_400_000, 2_560_000, 2_880_000, 3_200_000,
];

/// FFT sizes offered to every source.
pub const FFT_SIZE_VALUES: [usize; 9] = [256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536];

fn rtl_capabilities() -> Capabilities {
    Capabilities {
        gain_values_db: RTL_GAIN_VALUES.to_vec(),
        sample_rate_values: RTL_SAMPLE_RATES.to_vec(),
        fft_size_values: FFT_SIZE_VALUES.to_vec(),
        antennas: vec!["RX".to_string()],
        frequency_range: Some(FrequencyRange {
            min_hz: 24_000_000,
            max_hz: 1_766_000_000,
        }),
        has_agc: true,
        clock_source: None,
        total_samples: None,
        duration_secs: None,
    }
}

fn playback_capabilities(recording_path: &str) -> Result<Capabilities, SourceError> {
    let recording = Recording::open(recording_path)?;
    Ok(Capabilities {
        gain_values_db: vec![0.0],
        sample_rate_values: vec![recording.sample_rate()],
        fft_size_values: FFT_SIZE_VALUES.to_vec(),
        antennas: vec!["RX".to_string()],
        frequency_range: None,
        has_agc: false,
        clock_source: None,
        total_samples: Some(recording.total_samples),
        duration_secs: Some(recording.duration_secs()),
    })
}

/// Per-descriptor capability cache.
pub struct CapabilityCache {
    entries: Mutex<HashMap<String, Capabilities>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Enumerate capabilities for a descriptor, consulting the cache.
    /// On probe failure the cached entry (when present) is returned
    /// instead of the error.
    pub fn enumerate(&self, descriptor: &SourceDescriptor) -> Result<Capabilities, SourceError> {
        let is_playback = matches!(descriptor.kind, SourceKind::SigmfPlayback { .. });
        if !is_playback {
            if let Some(cached) = self.entries.lock().get(&descriptor.id) {
                info!(source = %descriptor.id, "using cached capabilities");
                return Ok(cached.clone());
            }
        }

        let probed = match &descriptor.kind {
            SourceKind::RtlsdrUsb { .. } | SourceKind::RtlsdrTcp { .. } => Ok(rtl_capabilities()),
            SourceKind::SigmfPlayback { recording_path, .. } => {
                playback_capabilities(recording_path)
            }
            SourceKind::SoapyRemote { .. } | SourceKind::SoapyLocal { .. } => {
                Err(SourceError::DriverUnavailable {
                    kind: "soapy",
                })
            }
            SourceKind::Uhd { .. } => Err(SourceError::DriverUnavailable { kind: "uhd" }),
        };

        match probed {
            Ok(capabilities) => {
                if !is_playback {
                    self.entries
                        .lock()
                        .insert(descriptor.id.clone(), capabilities.clone());
                }
                Ok(capabilities)
            }
            Err(err) => {
                if let Some(cached) = self.entries.lock().get(&descriptor.id) {
                    warn!(
                        source = %descriptor.id,
                        %err,
                        "probe failed, returning cached capabilities"
                    );
                    return Ok(cached.clone());
                }
                Err(err)
            }
        }
    }

    pub fn invalidate(&self, source_id: &str) {
        self.entries.lock().remove(source_id);
    }
}

impl Default for CapabilityCache {
    fn default() -> Self {
        Self::new()
    }
}
