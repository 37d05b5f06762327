//! TOML configuration for the CLI receiver.

use std::path::{Path, PathBuf};

use color_eyre::eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use groundwave_core::config::{ApiKeys, DecoderKind, Gain, Modulation, SourceConfig};
use groundwave_core::{SourceDescriptor, SourceKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    /// SigMF recording path (base name or either sidecar file).
    pub recording: Option<String>,
    /// rtl_tcp server, "host:port".
    pub rtl_tcp: Option<String>,
    pub center_freq_hz: i64,
    pub sample_rate_hz: u32,
    pub gain_db: Option<f64>,
    pub loop_playback: bool,
}

impl Default for SourceSection {
    fn default() -> Self {
        Self {
            recording: None,
            rtl_tcp: None,
            center_freq_hz: 100_100_000,
            sample_rate_hz: 2_048_000,
            gain_db: Some(20.0),
            loop_playback: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VfoSection {
    pub frequency_hz: i64,
    pub bandwidth_hz: u32,
    pub mode: Modulation,
    pub decoder: DecoderKind,
    pub volume: u8,
    pub squelch_dbfs: Option<f32>,
}

impl Default for VfoSection {
    fn default() -> Self {
        Self {
            frequency_hz: 100_100_000,
            bandwidth_hz: 200_000,
            mode: Modulation::Fm,
            decoder: DecoderKind::None,
            volume: 50,
            squelch_dbfs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub wav: Option<PathBuf>,
    pub decoded_dir: String,
    /// Stop after this many seconds; 0 runs until interrupted.
    pub duration_secs: u64,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            wav: None,
            decoded_dir: "data/decoded".to_string(),
            duration_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub source: SourceSection,
    pub vfo: VfoSection,
    pub output: OutputSection,
    pub api_keys: ApiKeys,
}

impl CliConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .wrap_err_with(|| format!("reading {}", path.as_ref().display()))?;
        toml::from_str(&raw).wrap_err("parsing TOML configuration")
    }

    /// Resolve the configured source into a descriptor + config pair.
    pub fn source_descriptor(&self) -> Result<(SourceDescriptor, SourceConfig)> {
        let kind = if let Some(recording) = &self.source.recording {
            SourceKind::SigmfPlayback {
                recording_path: recording.clone(),
                loop_playback: self.source.loop_playback,
            }
        } else if let Some(server) = &self.source.rtl_tcp {
            let (host, port) = server
                .rsplit_once(':')
                .ok_or_else(|| color_eyre::eyre::eyre!("rtl_tcp must be host:port"))?;
            SourceKind::RtlsdrTcp {
                host: host.to_string(),
                port: port.parse().wrap_err("parsing rtl_tcp port")?,
            }
        } else {
            color_eyre::eyre::bail!("configure either source.recording or source.rtl_tcp");
        };

        let descriptor = SourceDescriptor {
            id: "cli-source".to_string(),
            name: "CLI receiver source".to_string(),
            kind,
        };
        let config = SourceConfig {
            center_freq: self.source.center_freq_hz,
            sample_rate: self.source.sample_rate_hz,
            gain: match self.source.gain_db {
                Some(db) => Gain::Db(db),
                None => Gain::Agc,
            },
            ..Default::default()
        };
        Ok((descriptor, config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let raw = r#"
            [source]
            recording = "captures/pass42"
            center_freq_hz = 437500000
            sample_rate_hz = 48000

            [vfo]
            frequency_hz = 437500000
            bandwidth_hz = 20000
            mode = "usb"
            decoder = "gmsk"

            [output]
            duration_secs = 30
        "#;
        let config: CliConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.source.recording.as_deref(), Some("captures/pass42"));
        assert_eq!(config.vfo.mode, Modulation::Usb);
        assert_eq!(config.vfo.decoder, DecoderKind::Gmsk);
        assert_eq!(config.output.duration_secs, 30);

        let (descriptor, source) = config.source_descriptor().unwrap();
        assert!(matches!(descriptor.kind, SourceKind::SigmfPlayback { .. }));
        assert_eq!(source.center_freq, 437_500_000);
    }

    #[test]
    fn test_rtl_tcp_source() {
        let raw = r#"
            [source]
            rtl_tcp = "10.0.0.2:1234"
        "#;
        let config: CliConfig = toml::from_str(raw).unwrap();
        let (descriptor, _) = config.source_descriptor().unwrap();
        match descriptor.kind {
            SourceKind::RtlsdrTcp { host, port } => {
                assert_eq!(host, "10.0.0.2");
                assert_eq!(port, 1234);
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_no_source_rejected() {
        let config = CliConfig::default();
        assert!(config.source_descriptor().is_err());
    }
}
