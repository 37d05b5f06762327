//! Transcription workers: stream demodulated audio to an external
//! speech-to-text provider over a persistent bidirectional connection
//! and emit text events.
//!
//! Each worker is an OS thread owning a small single-threaded tokio
//! runtime for its network edge; the DSP side never awaits. Providers
//! are interchangeable behind [`TranscriptionProvider`].

pub mod deepgram;
pub mod gemini;
pub mod translate;

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::block::{AudioFrame, AudioLayout};
use crate::config::{ApiKeys, TranscriptionProvider as ProviderKind, TranscriptionSettings};
use crate::errors::TranscribeError;
use crate::events::{Event, EventBus, WorkerErrorKind, WorkerStatus};
use crate::signal_processing::resample::FixedChunkResampler;

/// Input rate from the demodulators.
const INPUT_SAMPLE_RATE: u32 = 44_100;
/// Rate preferred by the provider APIs.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;
/// Seconds of audio accumulated before each send.
const CHUNK_DURATION_SECS: f64 = 3.0;
/// RMS below this is treated as silence and not sent.
const SILENCE_THRESHOLD: f32 = 0.001;
/// Wait after a failed connection before trying again.
const CONNECTION_BACKOFF: Duration = Duration::from_secs(60);
const STATUS_INTERVAL: Duration = Duration::from_secs(5);
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// One transcription result from a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionFrame {
    pub text: String,
    pub language: String,
    pub is_final: bool,
    pub confidence: Option<f32>,
}

/// A speech-to-text backend with a persistent streaming connection.
#[async_trait]
pub trait TranscriptionProvider: Send {
    fn name(&self) -> &'static str;

    /// Open the streaming connection with the current API key.
    async fn connect(&mut self, api_key: &str) -> Result<(), TranscribeError>;

    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Send one chunk of 16 kHz linear-16 mono audio.
    async fn send_audio(&mut self, pcm: &[i16]) -> Result<(), TranscribeError>;

    /// Drain any pending transcription frames without blocking longer
    /// than `budget`.
    async fn drain(&mut self, budget: Duration) -> Result<Vec<TranscriptionFrame>, TranscribeError>;
}

/// Counters kept by a transcription worker.
#[derive(Debug, Clone, Default)]
pub struct TranscribeStats {
    pub audio_chunks_in: u64,
    pub audio_samples_in: u64,
    pub transcriptions_sent: u64,
    pub transcriptions_received: u64,
    pub queue_timeouts: u64,
    pub errors: u64,
    pub connection_attempts: u64,
    pub connection_failures: u64,
    pub is_connected: bool,
}

enum Control {
    RotateKeys(ApiKeys),
    Stop,
}

/// Handle owned by the lifecycle manager.
pub struct TranscribeHandle {
    pub session_id: String,
    pub vfo: u8,
    control: Sender<Control>,
    stats: Arc<Mutex<TranscribeStats>>,
    join: Option<JoinHandle<()>>,
}

impl TranscribeHandle {
    pub fn stats(&self) -> TranscribeStats {
        self.stats.lock().clone()
    }

    /// Rotate API keys: the current connection closes and the next
    /// audio chunk reconnects with the new key. No demodulator audio
    /// is lost; frames may drop inside this worker's own queue.
    pub fn rotate_keys(&self, keys: ApiKeys) -> bool {
        self.control.send(Control::RotateKeys(keys)).is_ok()
    }

    pub fn stop(mut self) {
        let _ = self.control.send(Control::Stop);
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

fn build_provider(kind: ProviderKind, settings: &TranscriptionSettings) -> Box<dyn TranscriptionProvider> {
    match kind {
        ProviderKind::Deepgram => Box::new(deepgram::DeepgramProvider::new(&settings.language)),
        ProviderKind::Gemini => Box::new(gemini::GeminiProvider::new(
            &settings.language,
            &settings.translate_to,
        )),
    }
}

fn key_for(kind: ProviderKind, keys: &ApiKeys) -> Option<String> {
    match kind {
        ProviderKind::Deepgram => keys.deepgram.clone(),
        ProviderKind::Gemini => keys.gemini.clone(),
    }
}

pub fn error_kind(err: &TranscribeError) -> WorkerErrorKind {
    match err {
        TranscribeError::QuotaExceeded { .. } => WorkerErrorKind::QuotaExceeded,
        TranscribeError::InvalidApiKey { .. } => WorkerErrorKind::InvalidApiKey,
        TranscribeError::RateLimit { .. } => WorkerErrorKind::RateLimit,
        TranscribeError::Network { .. } => WorkerErrorKind::NetworkError,
        TranscribeError::Deadline | TranscribeError::Unknown { .. } => WorkerErrorKind::UnknownError,
    }
}

/// Spawn a transcription worker for one (session, VFO).
pub fn spawn(
    session_id: String,
    vfo: u8,
    settings: TranscriptionSettings,
    keys: ApiKeys,
    audio: Receiver<AudioFrame>,
    events: EventBus,
) -> TranscribeHandle {
    let (control_tx, control_rx) = bounded(8);
    let stats = Arc::new(Mutex::new(TranscribeStats::default()));

    let stats_for_thread = Arc::clone(&stats);
    let session_for_thread = session_id.clone();
    let join = std::thread::Builder::new()
        .name(format!("groundwave-stt-{session_id}-vfo{vfo}"))
        .spawn(move || {
            let worker = Worker {
                session_id: session_for_thread,
                vfo,
                settings,
                keys,
                audio,
                control: control_rx,
                events,
                stats: stats_for_thread,
            };
            worker.run();
        })
        .expect("spawning a transcription thread cannot fail with a valid name");

    TranscribeHandle {
        session_id,
        vfo,
        control: control_tx,
        stats,
        join: Some(join),
    }
}

struct Worker {
    session_id: String,
    vfo: u8,
    settings: TranscriptionSettings,
    keys: ApiKeys,
    audio: Receiver<AudioFrame>,
    control: Receiver<Control>,
    events: EventBus,
    stats: Arc<Mutex<TranscribeStats>>,
}

impl Worker {
    fn run(mut self) {
        let provider_name = self.settings.provider.as_str();
        info!(
            session = %self.session_id,
            vfo = self.vfo,
            provider = provider_name,
            language = %self.settings.language,
            translate_to = %self.settings.translate_to,
            "transcription worker started"
        );

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(%err, "could not build transcription runtime");
                return;
            }
        };

        let mut provider = build_provider(self.settings.provider, &self.settings);
        let mut resampler =
            FixedChunkResampler::new(INPUT_SAMPLE_RATE as usize, TARGET_SAMPLE_RATE as usize, 1024)
                .ok();

        self.send_status(WorkerStatus::Idle);
        let mut buffer: Vec<f32> = Vec::new();
        let mut last_connection_attempt: Option<Instant> = None;
        let mut last_status = Instant::now();

        'outer: loop {
            while let Ok(control) = self.control.try_recv() {
                match control {
                    Control::Stop => break 'outer,
                    Control::RotateKeys(keys) => {
                        info!(provider = provider_name, "API keys rotated, closing connection");
                        self.keys = keys;
                        runtime.block_on(provider.disconnect());
                    }
                }
            }

            let frame = match self.audio.recv_timeout(RECV_TIMEOUT) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => {
                    self.stats.lock().queue_timeouts += 1;
                    self.heartbeat(&mut last_status, provider.is_connected());
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            {
                let mut stats = self.stats.lock();
                stats.audio_chunks_in += 1;
                stats.audio_samples_in += frame.samples.len() as u64;
            }

            // Stereo frames fold down to mono before buffering.
            match frame.layout {
                AudioLayout::Mono => buffer.extend(frame.samples.iter()),
                AudioLayout::Stereo => buffer.extend(
                    frame
                        .samples
                        .chunks_exact(2)
                        .map(|pair| (pair[0] + pair[1]) / 2.0),
                ),
            }

            let chunk_samples = (INPUT_SAMPLE_RATE as f64 * CHUNK_DURATION_SECS) as usize;
            if buffer.len() < chunk_samples {
                self.heartbeat(&mut last_status, provider.is_connected());
                continue;
            }
            let chunk: Vec<f32> = buffer.drain(..).collect();

            let rms = (chunk.iter().map(|x| x * x).sum::<f32>() / chunk.len() as f32).sqrt();
            if rms < SILENCE_THRESHOLD {
                debug!("silence detected, chunk skipped");
                continue;
            }

            let Some(api_key) = key_for(self.settings.provider, &self.keys) else {
                debug!(provider = provider_name, "no API key configured, skipping");
                continue;
            };

            // Resample to the provider rate and convert to linear-16.
            let resampled = match resampler.as_mut() {
                Some(resampler) => match resampler.process(&chunk) {
                    Ok(resampled) => resampled,
                    Err(err) => {
                        warn!(%err, "resample failed, chunk dropped");
                        self.stats.lock().errors += 1;
                        continue;
                    }
                },
                None => chunk.clone(),
            };
            let pcm: Vec<i16> = resampled
                .iter()
                .map(|&x| (x.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .collect();

            // Connect if needed, honoring the backoff window.
            if !provider.is_connected() {
                if let Some(last) = last_connection_attempt {
                    if last.elapsed() < CONNECTION_BACKOFF {
                        continue;
                    }
                }
                self.send_status(WorkerStatus::Connecting);
                last_connection_attempt = Some(Instant::now());
                self.stats.lock().connection_attempts += 1;
                if let Err(err) = runtime.block_on(provider.connect(&api_key)) {
                    self.stats.lock().connection_failures += 1;
                    self.report_error(&err);
                    continue;
                }
                // A successful connect clears the backoff.
                last_connection_attempt = None;
            }

            match runtime.block_on(provider.send_audio(&pcm)) {
                Ok(()) => {
                    self.stats.lock().transcriptions_sent += 1;
                }
                Err(err) => {
                    runtime.block_on(provider.disconnect());
                    self.stats.lock().connection_failures += 1;
                    self.report_error(&err);
                    continue;
                }
            }

            match runtime.block_on(provider.drain(Duration::from_millis(250))) {
                Ok(frames) => {
                    for result in frames {
                        self.emit_transcription(&runtime, result);
                    }
                }
                Err(err) => {
                    runtime.block_on(provider.disconnect());
                    self.report_error(&err);
                }
            }

            self.heartbeat(&mut last_status, provider.is_connected());
        }

        runtime.block_on(provider.disconnect());
        self.send_status(WorkerStatus::Closed);
        info!(session = %self.session_id, vfo = self.vfo, "transcription worker stopped");
    }

    fn emit_transcription(&self, runtime: &tokio::runtime::Runtime, frame: TranscriptionFrame) {
        if frame.text.trim().is_empty() {
            return;
        }
        self.stats.lock().transcriptions_received += 1;

        // Providers without built-in translation get the REST
        // post-step; a failure never blocks the audio path.
        let mut text = frame.text.clone();
        if self.settings.translate_to != "none"
            && self.settings.provider == ProviderKind::Deepgram
        {
            if let Some(key) = self.keys.google_translate.as_deref() {
                if let Some(translated) = runtime.block_on(translate::translate(
                    &frame.text,
                    &self.settings.translate_to,
                    key,
                )) {
                    text = translated;
                }
            }
        }

        self.events.publish(Event::Transcription {
            session_id: self.session_id.clone(),
            vfo: self.vfo,
            text,
            language: frame.language,
            is_final: frame.is_final,
            provider: self.settings.provider.as_str(),
            confidence: frame.confidence,
        });
    }

    fn heartbeat(&self, last_status: &mut Instant, connected: bool) {
        {
            let mut stats = self.stats.lock();
            stats.is_connected = connected;
        }
        if last_status.elapsed() >= STATUS_INTERVAL {
            self.send_status(if connected {
                WorkerStatus::Transcribing
            } else {
                WorkerStatus::Idle
            });
            *last_status = Instant::now();
        }
    }

    fn send_status(&self, status: WorkerStatus) {
        self.events.publish(Event::WorkerStatus {
            session_id: self.session_id.clone(),
            vfo: self.vfo,
            provider: self.settings.provider.as_str(),
            status,
        });
    }

    fn report_error(&self, err: &TranscribeError) {
        self.stats.lock().errors += 1;
        // Timeouts are retried silently, never surfaced.
        if err.is_silent() {
            debug!(%err, "transient provider timeout");
            return;
        }
        warn!(%err, "transcription provider error");
        self.events.publish(Event::WorkerError {
            session_id: self.session_id.clone(),
            vfo: self.vfo,
            provider: self.settings.provider.as_str(),
            kind: error_kind(err),
            message: err.to_string(),
            details: err.to_string(),
        });
    }
}
