//! Per-VFO demodulator workers.
//!
//! One worker per (session, VFO) with an active modulation. Each
//! consumes the source's demodulation IQ stream and produces 44.1 kHz
//! float audio frames of a fixed size, with the measured RF power
//! embedded. Parameter changes are observed at block boundaries; the
//! block in progress is never retroactively reprocessed.

mod pipeline;

pub use pipeline::{DemodPipeline, GateOutcome};

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::block::AudioFrame;
use crate::config::DemodConfig;
use crate::events::{Event, EventBus};
use crate::session::SessionTracker;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Counters kept by a demodulator worker, snapshotted by observers.
#[derive(Debug, Clone, Default)]
pub struct DemodStats {
    pub iq_chunks_in: u64,
    pub iq_samples_in: u64,
    pub audio_chunks_out: u64,
    pub audio_samples_out: u64,
    pub queue_timeouts: u64,
    pub errors: u64,
    pub ingest_samples_per_sec: f64,
    pub ingest_chunks_per_sec: f64,
    pub samples_dropped_out_of_band: u64,
    pub is_sleeping: bool,
}

/// Extra audio consumers beside the UI event stream (transcription,
/// audio-fed decoders). Taps are added and removed at runtime; a full
/// tap drops the frame for that consumer only.
pub struct AudioFanout {
    taps: RwLock<Vec<(String, Sender<AudioFrame>)>>,
}

impl AudioFanout {
    pub fn new() -> Self {
        Self {
            taps: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, name: impl Into<String>, tx: Sender<AudioFrame>) {
        let name = name.into();
        let mut taps = self.taps.write();
        taps.retain(|(existing, _)| existing != &name);
        taps.push((name, tx));
    }

    pub fn remove(&self, name: &str) {
        self.taps.write().retain(|(existing, _)| existing != name);
    }

    pub fn publish(&self, frame: &AudioFrame) {
        for (name, tx) in self.taps.read().iter() {
            match tx.try_send(frame.clone()) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(tap = %name, "audio tap full, dropping frame");
                }
            }
        }
    }
}

impl Default for AudioFanout {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle owned by the lifecycle manager.
pub struct DemodHandle {
    pub session_id: String,
    pub vfo: u8,
    pub fanout: Arc<AudioFanout>,
    stats: Arc<Mutex<DemodStats>>,
    stop: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl DemodHandle {
    pub fn stats(&self) -> DemodStats {
        self.stats.lock().clone()
    }

    pub fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn a demodulator worker thread for one (session, VFO).
pub fn spawn(
    session_id: String,
    vfo: u8,
    config: DemodConfig,
    tracker: Arc<SessionTracker>,
    blocks: Receiver<crate::block::IqBlock>,
    events: EventBus,
) -> DemodHandle {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let stats = Arc::new(Mutex::new(DemodStats::default()));
    let fanout = Arc::new(AudioFanout::new());

    let worker = Worker {
        session_id: session_id.clone(),
        vfo,
        config,
        tracker,
        blocks,
        stop: stop_rx,
        events,
        fanout: Arc::clone(&fanout),
        stats: Arc::clone(&stats),
        pipeline: DemodPipeline::new(config),
    };

    let join = std::thread::Builder::new()
        .name(format!("groundwave-demod-{session_id}-vfo{vfo}"))
        .spawn(move || worker.run())
        .expect("spawning a demodulator thread cannot fail with a valid name");

    DemodHandle {
        session_id,
        vfo,
        fanout,
        stats,
        stop: stop_tx,
        join: Some(join),
    }
}

struct Worker {
    session_id: String,
    vfo: u8,
    config: DemodConfig,
    tracker: Arc<SessionTracker>,
    blocks: Receiver<crate::block::IqBlock>,
    stop: Receiver<()>,
    events: EventBus,
    fanout: Arc<AudioFanout>,
    stats: Arc<Mutex<DemodStats>>,
    pipeline: DemodPipeline,
}

impl Worker {
    fn run(mut self) {
        info!(
            session = %self.session_id,
            vfo = self.vfo,
            "demodulator started"
        );

        let mut ingest_window_start = Instant::now();
        let mut ingest_samples: u64 = 0;
        let mut ingest_chunks: u64 = 0;
        let mut last_stats = Instant::now();

        loop {
            if self.stop.try_recv().is_ok() {
                break;
            }

            let block = match self.blocks.recv_timeout(RECV_TIMEOUT) {
                Ok(block) => block,
                Err(RecvTimeoutError::Timeout) => {
                    self.stats.lock().queue_timeouts += 1;
                    self.tick_stats(&mut ingest_window_start, &mut ingest_samples, &mut ingest_chunks, &mut last_stats);
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            {
                let mut stats = self.stats.lock();
                stats.iq_chunks_in += 1;
                stats.iq_samples_in += block.len() as u64;
            }
            ingest_samples += block.len() as u64;
            ingest_chunks += 1;

            if block.is_empty() {
                continue;
            }

            // Parameter reads happen here, at the block boundary; the
            // block in progress sees one consistent view.
            let vfo_state = match self.tracker.get_vfo(&self.session_id, self.vfo) {
                Some(state) if state.active => state,
                _ => continue,
            };
            if vfo_state.modulation == crate::config::Modulation::None {
                continue;
            }
            if vfo_state.center_freq == 0 {
                debug!(session = %self.session_id, vfo = self.vfo, "VFO frequency not set, skipping block");
                continue;
            }

            match self.pipeline.process(&block, &vfo_state) {
                Ok(GateOutcome::Audio(samples)) => {
                    self.stats.lock().is_sleeping = false;
                    self.publish_audio(samples, vfo_state.modulation);
                }
                Ok(GateOutcome::Silent) => {
                    self.stats.lock().is_sleeping = false;
                }
                Ok(GateOutcome::Sleeping { dropped_samples }) => {
                    let mut stats = self.stats.lock();
                    let was_sleeping = stats.is_sleeping;
                    stats.samples_dropped_out_of_band += dropped_samples;
                    stats.is_sleeping = true;
                    drop(stats);
                    if !was_sleeping {
                        warn!(
                            session = %self.session_id,
                            vfo = self.vfo,
                            vfo_mhz = vfo_state.center_freq as f64 / 1e6,
                            sdr_mhz = block.center_freq as f64 / 1e6,
                            "VFO out of SDR bandwidth, sleeping"
                        );
                    }
                }
                Err(err) => {
                    // Transient DSP faults: drop the block, keep the
                    // filter state, continue.
                    warn!(session = %self.session_id, vfo = self.vfo, %err, "DSP error, block dropped");
                    self.stats.lock().errors += 1;
                }
            }

            self.tick_stats(&mut ingest_window_start, &mut ingest_samples, &mut ingest_chunks, &mut last_stats);
        }

        info!(session = %self.session_id, vfo = self.vfo, "demodulator stopped");
    }

    fn publish_audio(&mut self, samples: Vec<f32>, modulation: crate::config::Modulation) {
        let frames = self.pipeline.chunker_mut().push(samples);
        if frames.is_empty() {
            return;
        }
        let layout = if modulation == crate::config::Modulation::FmStereo {
            crate::block::AudioLayout::Stereo
        } else {
            crate::block::AudioLayout::Mono
        };
        let rf_power = self.pipeline.last_rf_power_dbfs();
        for frame_samples in frames {
            let frame = AudioFrame {
                session_id: self.session_id.clone(),
                vfo: self.vfo,
                samples: Arc::new(frame_samples),
                sample_rate: self.config.audio_rate,
                layout,
                rf_power_dbfs: rf_power,
                captured_at: Instant::now(),
            };
            {
                let mut stats = self.stats.lock();
                stats.audio_chunks_out += 1;
                stats.audio_samples_out += frame.samples.len() as u64;
            }
            self.fanout.publish(&frame);
            self.events.publish(Event::Audio(frame));
        }
    }

    fn tick_stats(
        &self,
        window_start: &mut Instant,
        samples: &mut u64,
        chunks: &mut u64,
        last_stats: &mut Instant,
    ) {
        if last_stats.elapsed() < STATS_INTERVAL {
            return;
        }
        let dt = window_start.elapsed().as_secs_f64();
        let mut stats = self.stats.lock();
        if dt > 0.0 {
            stats.ingest_samples_per_sec = *samples as f64 / dt;
            stats.ingest_chunks_per_sec = *chunks as f64 / dt;
        }
        drop(stats);
        *window_start = Instant::now();
        *samples = 0;
        *chunks = 0;
        *last_stats = Instant::now();
    }
}
