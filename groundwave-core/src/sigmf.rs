//! SigMF recording support: metadata sidecar parsing and raw IQ
//! sample conversion.
//!
//! Reads the standard `core:datatype`, `core:sample_rate` and
//! per-capture `core:frequency` / `core:datetime` fields. Unknown
//! datatypes are logged and tolerated by falling back to cf32.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use num_complex::Complex32;
use serde::Deserialize;
use tracing::warn;

use crate::errors::SourceError;

/// Sample encodings accepted from recordings. All little-endian; the
/// `_le` suffix is optional in the wild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Cf32,
    Ci16,
    Ci8,
    Cu8,
}

impl SampleFormat {
    pub fn parse(datatype: &str) -> Option<Self> {
        match datatype {
            "cf32_le" | "cf32" => Some(SampleFormat::Cf32),
            "ci16_le" | "ci16" => Some(SampleFormat::Ci16),
            "ci8_le" | "ci8" => Some(SampleFormat::Ci8),
            "cu8_le" | "cu8" => Some(SampleFormat::Cu8),
            _ => None,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::Cf32 => 8,
            SampleFormat::Ci16 => 4,
            SampleFormat::Ci8 => 2,
            SampleFormat::Cu8 => 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigmfGlobal {
    #[serde(rename = "core:datatype")]
    pub datatype: String,
    #[serde(rename = "core:sample_rate")]
    pub sample_rate: f64,
    #[serde(rename = "core:description", default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigmfCapture {
    #[serde(rename = "core:sample_start", default)]
    pub sample_start: u64,
    #[serde(rename = "core:frequency", default)]
    pub frequency: Option<f64>,
    #[serde(rename = "core:datetime", default)]
    pub datetime: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigmfMetadata {
    pub global: SigmfGlobal,
    #[serde(default)]
    pub captures: Vec<SigmfCapture>,
}

impl SigmfMetadata {
    /// Datetime of the first capture segment, if parseable.
    pub fn start_datetime(&self) -> Option<DateTime<Utc>> {
        let raw = self.captures.first()?.datetime.as_deref()?;
        match DateTime::parse_from_rfc3339(raw) {
            Ok(dt) => Some(dt.with_timezone(&Utc)),
            Err(err) => {
                warn!(datetime = raw, %err, "could not parse recording datetime");
                None
            }
        }
    }
}

/// A SigMF recording resolved on disk: metadata plus data-file path.
#[derive(Debug, Clone)]
pub struct Recording {
    pub metadata: SigmfMetadata,
    pub data_path: PathBuf,
    pub format: SampleFormat,
    pub total_samples: u64,
}

impl Recording {
    /// Resolve a recording from a path with or without the SigMF
    /// extensions, read its metadata and size the data file.
    pub fn open(recording_path: &str) -> Result<Self, SourceError> {
        let meta_path = if recording_path.ends_with(".sigmf-meta") {
            PathBuf::from(recording_path)
        } else if recording_path.ends_with(".sigmf-data") {
            PathBuf::from(recording_path.replace(".sigmf-data", ".sigmf-meta"))
        } else {
            PathBuf::from(format!("{recording_path}.sigmf-meta"))
        };

        if !meta_path.exists() {
            return Err(SourceError::MetadataNotFound {
                path: meta_path.display().to_string(),
            });
        }

        let raw = std::fs::read_to_string(&meta_path)?;
        let metadata: SigmfMetadata = serde_json::from_str(&raw)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

        let format = match SampleFormat::parse(&metadata.global.datatype) {
            Some(fmt) => fmt,
            None => {
                warn!(
                    datatype = %metadata.global.datatype,
                    "unsupported SigMF datatype, falling back to cf32"
                );
                SampleFormat::Cf32
            }
        };

        let data_path = sibling_data_path(&meta_path);
        if !data_path.exists() {
            return Err(SourceError::DataNotFound {
                path: data_path.display().to_string(),
            });
        }

        let file_size = std::fs::metadata(&data_path)?.len();
        let bps = format.bytes_per_sample() as u64;
        if file_size % bps != 0 {
            warn!(
                path = %data_path.display(),
                "data file size is not aligned to sample size"
            );
        }

        Ok(Self {
            metadata,
            data_path,
            format,
            total_samples: file_size / bps,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.metadata.global.sample_rate as u32
    }

    pub fn duration_secs(&self) -> f64 {
        self.total_samples as f64 / self.metadata.global.sample_rate
    }

    /// Center frequency of the capture segment covering `sample_index`.
    pub fn frequency_at(&self, sample_index: u64) -> i64 {
        let mut freq = 100_000_000.0;
        for capture in &self.metadata.captures {
            if sample_index >= capture.sample_start {
                if let Some(f) = capture.frequency {
                    freq = f;
                }
            }
        }
        freq as i64
    }
}

fn sibling_data_path(meta_path: &Path) -> PathBuf {
    PathBuf::from(
        meta_path
            .display()
            .to_string()
            .replace(".sigmf-meta", ".sigmf-data"),
    )
}

/// Parse raw IQ bytes into cf32 samples. Integer formats are scaled to
/// +/-1.0 full scale; an odd trailing component is discarded.
pub fn parse_iq_samples(data: &[u8], format: SampleFormat) -> Vec<Complex32> {
    match format {
        SampleFormat::Cf32 => data
            .chunks_exact(8)
            .map(|chunk| {
                let i = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let q = f32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
                Complex32::new(i, q)
            })
            .collect(),
        SampleFormat::Ci16 => data
            .chunks_exact(4)
            .map(|chunk| {
                let i = i16::from_le_bytes([chunk[0], chunk[1]]) as f32;
                let q = i16::from_le_bytes([chunk[2], chunk[3]]) as f32;
                Complex32::new(i / 32768.0, q / 32768.0)
            })
            .collect(),
        SampleFormat::Ci8 => data
            .chunks_exact(2)
            .map(|chunk| {
                let i = chunk[0] as i8 as f32;
                let q = chunk[1] as i8 as f32;
                Complex32::new(i / 128.0, q / 128.0)
            })
            .collect(),
        SampleFormat::Cu8 => data
            .chunks_exact(2)
            .map(|chunk| {
                let i = chunk[0] as f32 - 128.0;
                let q = chunk[1] as f32 - 128.0;
                Complex32::new(i / 128.0, q / 128.0)
            })
            .collect(),
    }
}

/// Remove DC offset by subtracting the block mean, guarding against
/// NaN/Inf means from overflowed input.
pub fn remove_dc_offset(samples: &mut [Complex32]) {
    if samples.is_empty() {
        return;
    }
    let mut sum = Complex32::new(0.0, 0.0);
    for s in samples.iter() {
        sum += s;
    }
    let mean = sum / samples.len() as f32;
    if !mean.re.is_finite() || !mean.im.is_finite() {
        warn!("invalid mean in DC offset removal, skipping block");
        return;
    }
    for s in samples.iter_mut() {
        *s -= mean;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_sample_format_bytes() {
        assert_eq!(SampleFormat::Cf32.bytes_per_sample(), 8);
        assert_eq!(SampleFormat::Ci16.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::Ci8.bytes_per_sample(), 2);
        assert_eq!(SampleFormat::Cu8.bytes_per_sample(), 2);
    }

    #[test]
    fn test_parse_cu8_full_scale() {
        let data = [255u8, 0u8];
        let samples = parse_iq_samples(&data, SampleFormat::Cu8);
        assert_eq!(samples.len(), 1);
        assert_abs_diff_eq!(samples[0].re, 127.0 / 128.0, epsilon = 1e-6);
        assert_abs_diff_eq!(samples[0].im, -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_parse_ci16_scaling() {
        let mut data = Vec::new();
        data.extend_from_slice(&i16::MIN.to_le_bytes());
        data.extend_from_slice(&(16384i16).to_le_bytes());
        let samples = parse_iq_samples(&data, SampleFormat::Ci16);
        assert_abs_diff_eq!(samples[0].re, -1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(samples[0].im, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn test_parse_cf32_roundtrip() {
        let mut data = Vec::new();
        data.extend_from_slice(&0.25f32.to_le_bytes());
        data.extend_from_slice(&(-0.75f32).to_le_bytes());
        let samples = parse_iq_samples(&data, SampleFormat::Cf32);
        assert_eq!(samples[0], Complex32::new(0.25, -0.75));
    }

    #[test]
    fn test_odd_trailing_bytes_discarded() {
        let data = [1u8, 2, 3];
        let samples = parse_iq_samples(&data, SampleFormat::Cu8);
        assert_eq!(samples.len(), 1);
    }

    #[test]
    fn test_dc_offset_removal_centers_block() {
        let mut samples = vec![Complex32::new(1.0, 0.5); 128];
        remove_dc_offset(&mut samples);
        for s in &samples {
            assert_abs_diff_eq!(s.re, 0.0, epsilon = 1e-6);
            assert_abs_diff_eq!(s.im, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_dc_offset_skips_non_finite() {
        let mut samples = vec![Complex32::new(f32::INFINITY, 0.0), Complex32::new(1.0, 0.0)];
        remove_dc_offset(&mut samples);
        assert_eq!(samples[1], Complex32::new(1.0, 0.0));
    }

    #[test]
    fn test_metadata_parse_with_captures() {
        let raw = r#"{
            "global": {"core:datatype": "cf32_le", "core:sample_rate": 2048000.0},
            "captures": [
                {"core:sample_start": 0, "core:frequency": 100100000.0,
                 "core:datetime": "2025-11-29T11:07:23Z"},
                {"core:sample_start": 4096000, "core:frequency": 101100000.0}
            ]
        }"#;
        let meta: SigmfMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.global.sample_rate as u32, 2_048_000);
        assert_eq!(meta.captures.len(), 2);
        assert!(meta.start_datetime().is_some());
    }

    #[test]
    fn test_frequency_advances_with_capture_segments() {
        let raw = r#"{
            "global": {"core:datatype": "cf32_le", "core:sample_rate": 1000000.0},
            "captures": [
                {"core:sample_start": 0, "core:frequency": 100000000.0},
                {"core:sample_start": 500, "core:frequency": 101000000.0}
            ]
        }"#;
        let metadata: SigmfMetadata = serde_json::from_str(raw).unwrap();
        let recording = Recording {
            metadata,
            data_path: PathBuf::new(),
            format: SampleFormat::Cf32,
            total_samples: 1000,
        };
        assert_eq!(recording.frequency_at(0), 100_000_000);
        assert_eq!(recording.frequency_at(499), 100_000_000);
        assert_eq!(recording.frequency_at(500), 101_000_000);
    }
}
