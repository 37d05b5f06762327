//! Value types flowing through the pipeline: IQ blocks, audio frames
//! and spectrum frames.
//!
//! An [`IqBlock`] is immutable once published; the broadcast fabric
//! hands consumers a shared `Arc` view, never a deep copy.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use num_complex::Complex32;

/// Playback-position hints carried by file-source blocks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackPosition {
    pub elapsed_secs: f64,
    pub remaining_secs: f64,
    pub total_secs: f64,
}

/// A batch of complex baseband samples with shared capture metadata.
#[derive(Debug, Clone)]
pub struct IqBlock {
    pub samples: Arc<Vec<Complex32>>,
    /// Center frequency at the moment of capture, Hz.
    pub center_freq: i64,
    /// Sample rate at the moment of capture, Hz. Consumers observe
    /// configuration changes through this field, never out of band.
    pub sample_rate: u32,
    /// Monotonic capture timestamp.
    pub captured_at: Instant,
    /// Wall-clock datetime of the samples; for playback sources this is
    /// derived from the recording's start timestamp.
    pub wall_clock: Option<DateTime<Utc>>,
    pub playback: Option<PlaybackPosition>,
}

impl IqBlock {
    pub fn new(samples: Vec<Complex32>, center_freq: i64, sample_rate: u32) -> Self {
        Self {
            samples: Arc::new(samples),
            center_freq,
            sample_rate,
            captured_at: Instant::now(),
            wall_clock: None,
            playback: None,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration covered by this block at its capture rate.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Channel layout of an audio frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioLayout {
    Mono,
    /// Interleaved L/R.
    Stereo,
}

/// A fixed-size chunk of demodulated audio for one (session, VFO).
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub session_id: String,
    pub vfo: u8,
    /// Float samples at `sample_rate`; interleaved when stereo.
    pub samples: Arc<Vec<f32>>,
    pub sample_rate: u32,
    pub layout: AudioLayout,
    /// Most recent RF power measurement, dBFS, republished at <= 4 Hz.
    pub rf_power_dbfs: Option<f32>,
    pub captured_at: Instant,
}

/// One power-spectrum row for the waterfall, dBFS per bin, DC-centered.
#[derive(Debug, Clone)]
pub struct SpectrumFrame {
    pub source_id: String,
    pub power_dbfs: Arc<Vec<f32>>,
    pub center_freq: i64,
    pub sample_rate: u32,
    pub fft_size: usize,
    pub averaging: u32,
    pub wall_clock: Option<DateTime<Utc>>,
    pub playback: Option<PlaybackPosition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_duration() {
        let block = IqBlock::new(vec![Complex32::new(0.0, 0.0); 2048], 100_000_000, 2_048_000);
        assert!((block.duration_secs() - 0.001).abs() < 1e-9);
    }

    #[test]
    fn test_zero_rate_block_has_zero_duration() {
        let block = IqBlock::new(Vec::new(), 0, 0);
        assert_eq!(block.duration_secs(), 0.0);
        assert!(block.is_empty());
    }

    #[test]
    fn test_blocks_share_samples_across_clones() {
        let block = IqBlock::new(vec![Complex32::new(1.0, -1.0); 64], 0, 48_000);
        let copy = block.clone();
        assert!(Arc::ptr_eq(&block.samples, &copy.samples));
    }
}
