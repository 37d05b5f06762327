//! Sample source workers: one per radio, owning the hardware or file
//! handle and producing a continuous stream of IQ blocks.
//!
//! A worker runs on its own OS thread so blocking hardware I/O never
//! stalls another source. Control arrives as [`SourceCommand`]s,
//! lifecycle flows out as [`SourceEvent`]s, and samples go straight to
//! the broadcast fabric.

pub mod capabilities;
pub mod playback;
pub mod rtl_tcp;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError};
use num_complex::Complex32;
use tracing::{debug, error, info, warn};

use crate::block::{IqBlock, PlaybackPosition};
use crate::config::{ConfigChange, ConfigPatch, SourceConfig, SourceDescriptor, SourceKind};
use crate::errors::SourceError;
use crate::events::{SourceEvent, SourceStats};
use crate::fabric::IqBroadcaster;
use crate::sigmf::remove_dc_offset;

/// Target cadence for IQ blocks, so consumers see a predictable rate.
pub const TARGET_BLOCKS_PER_SEC: u32 = 15;

/// Upper bound on a single block, samples.
pub const MAX_SAMPLES_PER_BLOCK: usize = 1 << 20;

/// Hardware reads block for at most this long so stop signals are
/// observed promptly.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Compute the per-read block size for a constant block rate: round up
/// to a power of two, floor at the FFT size, cap at 2^20.
pub fn samples_per_block(sample_rate: u32, fft_size: usize) -> usize {
    let target = (sample_rate / TARGET_BLOCKS_PER_SEC).max(1) as usize;
    let pow2 = target.next_power_of_two();
    pow2.max(fft_size).min(MAX_SAMPLES_PER_BLOCK)
}

/// One block as produced by a driver, before normalization.
pub struct RawBlock {
    pub samples: Vec<Complex32>,
    /// Center frequency the samples were captured at.
    pub center_freq: i64,
    pub wall_clock: Option<DateTime<Utc>>,
    pub playback: Option<PlaybackPosition>,
}

/// Result of one driver read.
pub enum ReadOutcome {
    Block(RawBlock),
    /// Nothing arrived within the read timeout; retry without loss.
    Timeout,
    /// The stream is finished (non-looping playback).
    EndOfStream,
}

/// A sample-source driver: opens the device or file, reads blocks, and
/// applies configuration changes.
pub trait SourceDriver: Send {
    fn open(&mut self, config: &SourceConfig) -> Result<(), SourceError>;

    /// Read up to `num_samples` samples, blocking at most
    /// [`READ_TIMEOUT`].
    fn read_block(&mut self, num_samples: usize) -> Result<ReadOutcome, SourceError>;

    /// Apply a configuration change. `RequiresFlush` changes must
    /// stop the stream, apply, and restart so stale samples never
    /// carry the new tags.
    fn reconfigure(
        &mut self,
        config: &SourceConfig,
        change: ConfigChange,
    ) -> Result<(), SourceError>;

    fn close(&mut self);
}

/// Build the driver for a descriptor. Hardware kinds that need native
/// vendor libraries are represented but unavailable in this build.
pub fn driver_for(descriptor: &SourceDescriptor) -> Result<Box<dyn SourceDriver>, SourceError> {
    match &descriptor.kind {
        SourceKind::SigmfPlayback {
            recording_path,
            loop_playback,
        } => Ok(Box::new(playback::SigmfPlaybackDriver::new(
            recording_path.clone(),
            *loop_playback,
        ))),
        SourceKind::RtlsdrTcp { host, port } => {
            Ok(Box::new(rtl_tcp::RtlTcpDriver::new(host.clone(), *port)))
        }
        other => Err(SourceError::DriverUnavailable {
            kind: match other {
                SourceKind::RtlsdrUsb { .. } => "rtlsdr-usb",
                SourceKind::SoapyRemote { .. } => "soapy-remote",
                SourceKind::SoapyLocal { .. } => "soapy-local",
                SourceKind::Uhd { .. } => "uhd",
                _ => unreachable!(),
            },
        }),
    }
}

/// Control messages accepted by a running source worker.
#[derive(Debug)]
pub enum SourceCommand {
    Configure(ConfigPatch),
    Stop,
}

/// Lifecycle of a source worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Init,
    Opening,
    Streaming,
    Reconfiguring,
    Terminating,
    Terminated,
}

/// Handle owned by the lifecycle manager.
pub struct SourceHandle {
    pub source_id: String,
    commands: Sender<SourceCommand>,
    join: Option<JoinHandle<()>>,
}

impl SourceHandle {
    pub fn configure(&self, patch: ConfigPatch) -> bool {
        self.commands.send(SourceCommand::Configure(patch)).is_ok()
    }

    /// Signal the worker to stop. Does not wait.
    pub fn stop(&self) {
        let _ = self.commands.send(SourceCommand::Stop);
    }

    /// Wait for the worker thread to exit, up to `timeout`. Returns
    /// true when the thread finished in time.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self
                .join
                .as_ref()
                .map(|handle| handle.is_finished())
                .unwrap_or(true)
            {
                if let Some(handle) = self.join.take() {
                    let _ = handle.join();
                }
                return true;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        false
    }

    pub fn is_finished(&self) -> bool {
        self.join
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }
}

/// Spawn a source worker thread for `descriptor`, publishing blocks to
/// `fabric` and lifecycle events to `status`.
pub fn spawn(
    descriptor: SourceDescriptor,
    config: SourceConfig,
    fabric: Arc<IqBroadcaster>,
    status: Sender<SourceEvent>,
) -> SourceHandle {
    let (command_tx, command_rx) = bounded(32);
    let source_id = descriptor.id.clone();
    let thread_name = format!("groundwave-source-{source_id}");

    let id_for_thread = source_id.clone();
    let join = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let mut worker = SourceWorker {
                source_id: id_for_thread,
                descriptor,
                config,
                fabric,
                status,
                commands: command_rx,
                state: SourceState::Init,
                stats: SourceStats::default(),
            };
            worker.run();
        })
        .expect("spawning a source thread cannot fail with a valid name");

    SourceHandle {
        source_id,
        commands: command_tx,
        join: Some(join),
    }
}

struct SourceWorker {
    source_id: String,
    descriptor: SourceDescriptor,
    config: SourceConfig,
    fabric: Arc<IqBroadcaster>,
    status: Sender<SourceEvent>,
    commands: Receiver<SourceCommand>,
    state: SourceState,
    stats: SourceStats,
}

impl SourceWorker {
    fn run(&mut self) {
        self.state = SourceState::Opening;
        let mut driver = match driver_for(&self.descriptor) {
            Ok(driver) => driver,
            Err(err) => {
                self.emit_error(err.to_string());
                self.emit_terminated();
                return;
            }
        };

        if let Err(err) = driver.open(&self.config) {
            error!(source = %self.source_id, %err, "failed to open source");
            self.emit_error(err.to_string());
            self.emit_terminated();
            return;
        }

        self.state = SourceState::Streaming;
        info!(source = %self.source_id, kind = self.descriptor.kind.as_str(), "streaming started");
        let _ = self.status.send(SourceEvent::StreamingStarted {
            source_id: self.source_id.clone(),
        });

        let mut block_size = samples_per_block(self.config.sample_rate, self.config.spectrum.fft_size);
        let mut last_stats = Instant::now();

        loop {
            match self.drain_commands(driver.as_mut(), &mut block_size) {
                CommandOutcome::Continue => {}
                CommandOutcome::Stop => break,
                CommandOutcome::Fatal(message) => {
                    self.emit_error(message);
                    break;
                }
            }

            match driver.read_block(block_size) {
                Ok(ReadOutcome::Block(raw)) => {
                    self.publish_block(raw);
                }
                Ok(ReadOutcome::Timeout) => {
                    // Logged and retried without state loss.
                    self.stats.read_errors += 1;
                    debug!(source = %self.source_id, "read timeout, retrying");
                }
                Ok(ReadOutcome::EndOfStream) => {
                    info!(source = %self.source_id, "end of stream");
                    break;
                }
                Err(SourceError::Overflow) => {
                    // The affected block is dropped; streaming continues.
                    self.stats.read_errors += 1;
                    warn!(source = %self.source_id, "hardware overflow, block dropped");
                }
                Err(err) => {
                    error!(source = %self.source_id, %err, "source read failed");
                    self.stats.errors += 1;
                    self.emit_error(err.to_string());
                    break;
                }
            }

            if last_stats.elapsed() >= STATS_INTERVAL {
                let _ = self.status.send(SourceEvent::Stats {
                    source_id: self.source_id.clone(),
                    stats: self.stats.clone(),
                });
                last_stats = Instant::now();
            }
        }

        self.state = SourceState::Terminating;
        debug!(source = %self.source_id, state = ?self.state, "source worker winding down");
        driver.close();
        self.emit_terminated();
    }

    fn drain_commands(
        &mut self,
        driver: &mut dyn SourceDriver,
        block_size: &mut usize,
    ) -> CommandOutcome {
        loop {
            match self.commands.try_recv() {
                Ok(SourceCommand::Stop) => return CommandOutcome::Stop,
                Ok(SourceCommand::Configure(patch)) => {
                    let change = self.config.apply(&patch);
                    if change == ConfigChange::None {
                        continue;
                    }
                    if change == ConfigChange::RequiresFlush {
                        self.state = SourceState::Reconfiguring;
                    }
                    match driver.reconfigure(&self.config, change) {
                        Ok(()) => {
                            *block_size = samples_per_block(
                                self.config.sample_rate,
                                self.config.spectrum.fft_size,
                            );
                            self.state = SourceState::Streaming;
                            info!(
                                source = %self.source_id,
                                center_freq = self.config.center_freq,
                                sample_rate = self.config.sample_rate,
                                ?change,
                                "configuration applied"
                            );
                        }
                        Err(err) => {
                            return CommandOutcome::Fatal(format!(
                                "reconfiguration failed: {err}"
                            ));
                        }
                    }
                }
                Err(TryRecvError::Empty) => return CommandOutcome::Continue,
                Err(TryRecvError::Disconnected) => return CommandOutcome::Stop,
            }
        }
    }

    fn publish_block(&mut self, raw: RawBlock) {
        if raw.samples.is_empty() {
            return;
        }
        let mut samples = raw.samples;
        remove_dc_offset(&mut samples);

        self.stats.samples_read += samples.len() as u64;
        let delivered = self.fabric.publish(&IqBlock {
            samples: Arc::new(samples),
            center_freq: raw.center_freq,
            sample_rate: self.config.sample_rate,
            captured_at: Instant::now(),
            wall_clock: raw.wall_clock,
            playback: raw.playback,
        });
        self.stats.blocks_out += 1;
        if delivered == 0 && self.fabric.tap_count() > 0 {
            self.stats.queue_drops += 1;
        }
    }

    fn emit_error(&self, message: String) {
        let _ = self.status.send(SourceEvent::Error {
            source_id: self.source_id.clone(),
            message,
        });
    }

    fn emit_terminated(&mut self) {
        self.state = SourceState::Terminated;
        let _ = self.status.send(SourceEvent::Terminated {
            source_id: self.source_id.clone(),
        });
    }
}

enum CommandOutcome {
    Continue,
    Stop,
    Fatal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_targets_fifteen_per_second() {
        // 2.048 MS/s / 15 = 136533, next pow2 = 262144
        assert_eq!(samples_per_block(2_048_000, 1024), 262_144);
    }

    #[test]
    fn test_block_size_floors_at_fft_size() {
        assert_eq!(samples_per_block(48_000, 16_384), 16_384);
    }

    #[test]
    fn test_block_size_caps_at_one_mega_sample() {
        assert_eq!(samples_per_block(40_000_000, 1024), MAX_SAMPLES_PER_BLOCK);
    }

    #[test]
    fn test_driver_for_unavailable_hardware() {
        let descriptor = SourceDescriptor {
            id: "usrp-0".into(),
            name: "bench USRP".into(),
            kind: SourceKind::Uhd {
                serial: "A1B2".into(),
            },
        };
        match driver_for(&descriptor) {
            Err(SourceError::DriverUnavailable { kind }) => assert_eq!(kind, "uhd"),
            Err(other) => panic!("expected DriverUnavailable, got {other}"),
            Ok(_) => panic!("expected DriverUnavailable, got a driver"),
        }
    }
}
