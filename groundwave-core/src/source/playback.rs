//! SigMF playback driver: streams a recording as if it were a live
//! radio, pacing reads to the recording's sample rate.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use crate::block::PlaybackPosition;
use crate::config::{ConfigChange, SourceConfig};
use crate::errors::SourceError;
use crate::sigmf::{parse_iq_samples, Recording};

use super::{RawBlock, ReadOutcome, SourceDriver};

pub struct SigmfPlaybackDriver {
    recording_path: String,
    loop_playback: bool,
    recording: Option<Recording>,
    data_file: Option<File>,
    total_samples_read: u64,
    current_capture_idx: usize,
    current_freq: i64,
    start_datetime: Option<DateTime<Utc>>,
}

impl SigmfPlaybackDriver {
    pub fn new(recording_path: String, loop_playback: bool) -> Self {
        Self {
            recording_path,
            loop_playback,
            recording: None,
            data_file: None,
            total_samples_read: 0,
            current_capture_idx: 0,
            current_freq: 0,
            start_datetime: None,
        }
    }

    fn rewind(&mut self) -> Result<(), SourceError> {
        if let Some(file) = self.data_file.as_mut() {
            file.seek(SeekFrom::Start(0))?;
        }
        self.total_samples_read = 0;
        self.current_capture_idx = 0;
        if let Some(recording) = &self.recording {
            self.current_freq = recording.frequency_at(0);
        }
        Ok(())
    }

    /// Advance the current capture segment as the read position crosses
    /// segment boundaries, taking each segment's frequency as current.
    fn advance_capture_segment(&mut self) {
        let Some(recording) = &self.recording else {
            return;
        };
        let captures = &recording.metadata.captures;
        for idx in (self.current_capture_idx + 1)..captures.len() {
            if self.total_samples_read >= captures[idx].sample_start {
                self.current_capture_idx = idx;
                if let Some(freq) = captures[idx].frequency {
                    self.current_freq = freq as i64;
                }
                info!(
                    segment = idx,
                    freq_mhz = self.current_freq as f64 / 1e6,
                    "moved to capture segment"
                );
            }
        }
    }
}

impl SourceDriver for SigmfPlaybackDriver {
    fn open(&mut self, _config: &SourceConfig) -> Result<(), SourceError> {
        let recording = Recording::open(&self.recording_path)?;
        info!(
            path = %recording.data_path.display(),
            rate_msps = recording.sample_rate() as f64 / 1e6,
            duration_secs = recording.duration_secs(),
            "opened SigMF recording"
        );

        self.data_file = Some(File::open(&recording.data_path)?);
        self.current_freq = recording.frequency_at(0);
        self.start_datetime = recording.metadata.start_datetime();
        self.recording = Some(recording);
        self.total_samples_read = 0;
        self.current_capture_idx = 0;
        Ok(())
    }

    fn read_block(&mut self, num_samples: usize) -> Result<ReadOutcome, SourceError> {
        let (bytes_per_sample, sample_rate, total_samples, format) = {
            let recording = self
                .recording
                .as_ref()
                .ok_or(SourceError::Terminated)?;
            (
                recording.format.bytes_per_sample(),
                recording.metadata.global.sample_rate,
                recording.total_samples,
                recording.format,
            )
        };
        let file = self.data_file.as_mut().ok_or(SourceError::Terminated)?;

        let bytes_to_read = num_samples * bytes_per_sample;
        let mut data = vec![0u8; bytes_to_read];
        let mut filled = 0;
        while filled < bytes_to_read {
            let n = file.read(&mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled < bytes_to_read {
            if self.loop_playback {
                info!("reached end of recording, looping back to start");
                self.rewind()?;
                let file = self.data_file.as_mut().ok_or(SourceError::Terminated)?;
                filled = 0;
                while filled < bytes_to_read {
                    let n = file.read(&mut data[filled..])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
            } else if filled == 0 {
                return Ok(ReadOutcome::EndOfStream);
            }
        }
        data.truncate(filled);
        if data.is_empty() {
            warn!("no data read from recording");
            std::thread::sleep(Duration::from_millis(100));
            return Ok(ReadOutcome::Timeout);
        }

        let samples = parse_iq_samples(&data, format);
        self.total_samples_read += samples.len() as u64;
        self.advance_capture_segment();

        let elapsed_secs = self.total_samples_read as f64 / sample_rate;
        let total_secs = total_samples as f64 / sample_rate;
        let playback = PlaybackPosition {
            elapsed_secs,
            remaining_secs: total_secs - elapsed_secs,
            total_secs,
        };
        let wall_clock = self.start_datetime.map(|start| {
            start + ChronoDuration::milliseconds((elapsed_secs * 1000.0) as i64)
        });

        // Pace the stream to real time: one block takes exactly its
        // duration at the recorded sample rate.
        let block_duration = samples.len() as f64 / sample_rate;
        std::thread::sleep(Duration::from_secs_f64(block_duration));

        Ok(ReadOutcome::Block(RawBlock {
            samples,
            center_freq: self.current_freq,
            wall_clock,
            playback: Some(playback),
        }))
    }

    fn reconfigure(
        &mut self,
        _config: &SourceConfig,
        change: ConfigChange,
    ) -> Result<(), SourceError> {
        // A recording has a fixed rate and frequency plan; display
        // parameters apply in-flight and a flush is just a no-op here.
        if change == ConfigChange::RequiresFlush {
            info!("playback ignores rate/frequency changes; recording governs both");
        }
        Ok(())
    }

    fn close(&mut self) {
        self.data_file = None;
        self.recording = None;
        info!("SigMF playback closed");
    }
}
