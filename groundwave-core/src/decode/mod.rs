//! Channel decoders: frame/symbol recovery front-ends plus the shared
//! packet pipeline that validates, parses, persists and publishes
//! every decoded transmission.

pub mod afsk;
pub mod ax25;
pub mod fsk;
pub mod hdlc;
pub mod morse;
pub mod psk;
pub mod sync;
pub mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use num_complex::Complex32;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{error, info, warn};

use crate::block::{AudioFrame, IqBlock};
use crate::config::{DecoderConfig, DecoderKind};
use crate::errors::DecodeError;
use crate::events::{DecoderStatus, Event, EventBus, PacketRecord};
use crate::session::SessionTracker;
use crate::signal_processing::measure_power_dbfs;

use self::ax25::Callsigns;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const STATUS_INTERVAL: Duration = Duration::from_secs(5);
const TEXT_OUTPUT_INTERVAL: Duration = Duration::from_millis(500);

/// Rolling signal-power history, measured per incoming block before
/// decimation and AGC.
#[derive(Debug, Clone, Default)]
pub struct PowerHistory {
    measurements: Vec<f32>,
    pub current_dbfs: Option<f32>,
}

impl PowerHistory {
    const MAX_HISTORY: usize = 100;

    pub fn update(&mut self, samples: &[Complex32]) {
        if let Some(power) = measure_power_dbfs(samples) {
            self.current_dbfs = Some(power);
            self.measurements.push(power);
            if self.measurements.len() > Self::MAX_HISTORY {
                self.measurements.remove(0);
            }
        }
    }

    pub fn statistics(&self) -> serde_json::Value {
        if self.measurements.is_empty() {
            return json!({});
        }
        let sum: f32 = self.measurements.iter().sum();
        let avg = sum / self.measurements.len() as f32;
        let max = self.measurements.iter().cloned().fold(f32::MIN, f32::max);
        let min = self.measurements.iter().cloned().fold(f32::MAX, f32::min);
        let mut stats = json!({
            "signal_power_avg_dbfs": round1(avg),
            "signal_power_max_dbfs": round1(max),
            "signal_power_min_dbfs": round1(min),
        });
        if let Some(current) = self.current_dbfs {
            stats["signal_power_dbfs"] = json!(round1(current));
        }
        stats
    }
}

fn round1(value: f32) -> f64 {
    (value as f64 * 10.0).round() / 10.0
}

/// Counters kept by a decoder worker.
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub iq_chunks_in: u64,
    pub samples_in: u64,
    pub packets_decoded: u64,
    pub symbols_decoded: u64,
    pub data_messages_out: u64,
    pub queue_timeouts: u64,
    pub errors: u64,
}

/// Shared packet pipeline: every decoder funnels its recovered frames
/// through here. Validate, count, strip HDLC flags, parse telemetry
/// with a protocol hint, identify the satellite, persist binary +
/// metadata sidecar, publish one packet-decoded event.
pub struct PacketSink {
    config: DecoderConfig,
    session_id: String,
    vfo: u8,
    tracker: Arc<SessionTracker>,
    events: EventBus,
    packet_count: u64,
    /// Capture context stamped into metadata, updated per block.
    pub sdr_center_freq: Option<i64>,
    pub sdr_sample_rate: Option<u32>,
    pub decoder_rate: Option<f64>,
    /// Rolling power history, merged into every packet's metadata.
    pub power: PowerHistory,
}

impl PacketSink {
    pub fn new(
        config: DecoderConfig,
        session_id: String,
        vfo: u8,
        tracker: Arc<SessionTracker>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            session_id,
            vfo,
            tracker,
            events,
            packet_count: 0,
            sdr_center_freq: None,
            sdr_sample_rate: None,
            decoder_rate: None,
            power: PowerHistory::default(),
        }
    }

    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    fn should_accept(&self, _payload: &[u8], _callsigns: &Option<Callsigns>) -> bool {
        true
    }

    fn strip_hdlc_flags(payload: &[u8]) -> &[u8] {
        let mut data = payload;
        if let Some((&first, rest)) = data.split_first() {
            if first == hdlc::HDLC_FLAG {
                data = rest;
            }
        }
        if let Some((&last, rest)) = data.split_last() {
            if last == hdlc::HDLC_FLAG {
                data = rest;
            }
        }
        data
    }

    fn filename(&self, timestamp: DateTime<Utc>) -> String {
        let stamp = timestamp.with_timezone(&Local).format("%Y%m%d_%H%M%S");
        let micros = timestamp.timestamp_subsec_micros();
        let decoder_type = self.config.kind.as_str();
        let params = match self.config.kind {
            DecoderKind::Morse => format!("{:.0}hz", self.config.tone_freq_hz),
            _ => format!("{}baud", self.config.baudrate),
        };
        format!("{decoder_type}_{params}_{stamp}_{micros:06}.bin")
    }

    /// Run one recovered frame through the shared pipeline. Errors are
    /// logged and counted by the caller; the decode loop continues.
    pub fn on_packet_decoded(
        &mut self,
        payload: &[u8],
        callsigns: Option<Callsigns>,
    ) -> Result<Option<PacketRecord>, DecodeError> {
        let mut callsigns = callsigns;
        if !self.should_accept(payload, &callsigns) {
            return Ok(None);
        }

        self.packet_count += 1;
        let decoder_type = self.config.kind.as_str();
        info!(
            decoder = decoder_type,
            bytes = payload.len(),
            number = self.packet_count,
            "transmission decoded"
        );

        let packet_data = Self::strip_hdlc_flags(payload);
        let protocol_hint = self.config.framing.payload_protocol();
        let sat_hint = self.config.satellite.as_ref().map(|s| s.name.clone());
        let parsed = telemetry::parse(packet_data, protocol_hint, sat_hint.as_deref());

        // Some framings surface no callsigns at the deframer stage;
        // when the telemetry parser still found an AX.25 header, take
        // the callsigns from there.
        if callsigns.is_none() && parsed.parser.as_deref() == Some("ax25") {
            if let (Some(source), Some(destination)) = (
                parsed.frame.get("source").and_then(|v| v.as_str()),
                parsed.frame.get("destination").and_then(|v| v.as_str()),
            ) {
                callsigns = Some(Callsigns {
                    from: source.to_string(),
                    to: destination.to_string(),
                });
            }
        }

        let identified = callsigns
            .as_ref()
            .and_then(|c| telemetry::identify_satellite(&c.from));
        if let Some((sat, matched)) = &identified {
            info!(
                satellite = %matched,
                norad_id = sat.norad_id,
                "identified satellite from callsign"
            );
        }

        let now = Utc::now();
        let timestamp = now.timestamp() as f64 + now.timestamp_subsec_micros() as f64 / 1e6;
        let filename = self.filename(now);
        let output_dir = PathBuf::from(&self.config.output_dir);
        std::fs::create_dir_all(&output_dir)?;
        let binary_path = output_dir.join(&filename);
        std::fs::write(&binary_path, payload)?;

        let vfo_state = self.tracker.get_vfo(&self.session_id, self.vfo);
        let mut metadata = json!({
            "packet": {
                "number": self.packet_count,
                "length_bytes": payload.len(),
                "timestamp": timestamp,
                "timestamp_iso": now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                "hex": telemetry::hex_string(payload),
            },
            "decoder": {
                "type": decoder_type,
                "session_id": self.session_id,
                "baudrate": self.config.baudrate,
                "deviation_hz": self.config.deviation_hz,
                "framing": self.config.framing.as_str(),
            },
            "signal": {
                "frequency_hz": vfo_state.as_ref().map(|v| v.center_freq),
                "sample_rate_hz": self.decoder_rate,
                "sdr_sample_rate_hz": self.sdr_sample_rate,
                "sdr_center_freq_hz": self.sdr_center_freq,
            },
            "vfo": {
                "id": self.vfo,
                "center_freq_hz": vfo_state.as_ref().map(|v| v.center_freq),
                "bandwidth_hz": vfo_state.as_ref().map(|v| v.bandwidth),
                "active": vfo_state.as_ref().map(|v| v.active),
            },
            "decoder_config": {
                "source": self.config.source,
                "framing": self.config.framing.as_str(),
                "payload_protocol": protocol_hint,
            },
            "demodulator_parameters": {
                "baudrate": self.config.baudrate,
                "deviation_hz": self.config.deviation_hz,
                "decoder_rate_hz": self.decoder_rate,
            },
            "file": {
                "binary": filename,
                "binary_path": binary_path.display().to_string(),
            },
            "telemetry": parsed.to_json(),
        });

        // Fold the power statistics into the signal section.
        if let Some(signal) = metadata["signal"].as_object_mut() {
            if let Some(power_stats) = self.power.statistics().as_object() {
                for (key, value) in power_stats {
                    signal.insert(key.clone(), value.clone());
                }
            }
        }

        if let Some(sat) = identified
            .as_ref()
            .map(|(s, _)| s)
            .or(self.config.satellite.as_ref())
        {
            metadata["satellite"] = json!({
                "norad_id": sat.norad_id,
                "name": sat.name,
            });
        }
        if let Some(transmitter) = &self.config.transmitter {
            metadata["transmitter"] = json!({
                "description": transmitter.description,
                "mode": transmitter.mode,
                "downlink_freq_hz": transmitter.downlink_freq_hz,
            });
        }
        if let Some(calls) = &callsigns {
            let mut ax25_meta = json!({
                "from_callsign": calls.from,
                "to_callsign": calls.to,
            });
            if let Some((sat, matched)) = &identified {
                ax25_meta["identified_norad_id"] = json!(sat.norad_id);
                ax25_meta["identified_satellite"] = json!(matched);
            }
            metadata["ax25"] = ax25_meta;
        }

        let metadata_filename = filename.replace(".bin", ".json");
        let metadata_path = output_dir.join(&metadata_filename);
        std::fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;
        info!(path = %metadata_path.display(), "packet persisted");

        let record = PacketRecord {
            decoder_type,
            session_id: self.session_id.clone(),
            vfo: self.vfo,
            packet_number: self.packet_count,
            payload: payload.to_vec(),
            timestamp,
            binary_path: binary_path.display().to_string(),
            metadata_path: metadata_path.display().to_string(),
            metadata,
        };
        if !self.events.publish_packet(record.clone()) {
            warn!("event bus full, packet event dropped");
        }
        Ok(Some(record))
    }
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::Persist(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

enum FrontEnd {
    Fsk(fsk::FskFrontEnd),
    Bpsk(psk::BpskFrontEnd),
    Afsk(afsk::AfskFrontEnd),
}

impl FrontEnd {
    fn process(
        &mut self,
        samples: &[Complex32],
        rate: u32,
        offset_hz: f64,
    ) -> Result<Vec<Vec<u8>>, crate::errors::DspError> {
        match self {
            FrontEnd::Fsk(fe) => fe.process(samples, rate, offset_hz),
            FrontEnd::Bpsk(fe) => fe.process(samples, rate, offset_hz),
            FrontEnd::Afsk(fe) => fe.process(samples, rate, offset_hz),
        }
    }

    fn symbols_decoded(&self) -> u64 {
        match self {
            FrontEnd::Fsk(fe) => fe.symbols_decoded,
            FrontEnd::Bpsk(fe) => fe.symbols_decoded,
            FrontEnd::Afsk(fe) => fe.symbols_decoded,
        }
    }

    fn decoder_rate(&self) -> f64 {
        match self {
            FrontEnd::Fsk(fe) => fe.decoder_rate(),
            FrontEnd::Bpsk(fe) => fe.decoder_rate(),
            FrontEnd::Afsk(fe) => fe.decoder_rate(),
        }
    }
}

/// Handle owned by the lifecycle manager.
pub struct DecoderHandle {
    pub session_id: String,
    pub vfo: u8,
    pub kind: DecoderKind,
    stats: Arc<Mutex<DecoderStats>>,
    stop: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl DecoderHandle {
    pub fn stats(&self) -> DecoderStats {
        self.stats.lock().clone()
    }

    pub fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn an IQ-fed decoder worker (AFSK/BPSK/GMSK/GFSK).
pub fn spawn_iq_decoder(
    config: DecoderConfig,
    session_id: String,
    vfo: u8,
    tracker: Arc<SessionTracker>,
    blocks: Receiver<IqBlock>,
    events: EventBus,
) -> Result<DecoderHandle, DecodeError> {
    let front_end = match config.kind {
        DecoderKind::Gmsk | DecoderKind::Gfsk => {
            FrontEnd::Fsk(fsk::FskFrontEnd::new(config.baudrate, config.deviation_hz))
        }
        DecoderKind::Bpsk => FrontEnd::Bpsk(psk::BpskFrontEnd::new(config.baudrate)),
        DecoderKind::Afsk => {
            FrontEnd::Afsk(afsk::AfskFrontEnd::new(config.baudrate, config.deviation_hz))
        }
        DecoderKind::Morse | DecoderKind::None => {
            return Err(DecodeError::UnsupportedKind {
                kind: config.kind.as_str(),
            });
        }
    };

    let (stop_tx, stop_rx) = bounded::<()>(1);
    let stats = Arc::new(Mutex::new(DecoderStats::default()));
    let kind = config.kind;
    let sink = PacketSink::new(
        config,
        session_id.clone(),
        vfo,
        Arc::clone(&tracker),
        events.clone(),
    );

    let stats_for_thread = Arc::clone(&stats);
    let session_for_thread = session_id.clone();
    let join = std::thread::Builder::new()
        .name(format!("groundwave-decode-{session_id}-vfo{vfo}"))
        .spawn(move || {
            run_iq_decoder(
                session_for_thread,
                vfo,
                kind,
                tracker,
                blocks,
                stop_rx,
                events,
                sink,
                front_end,
                stats_for_thread,
            );
        })
        .expect("spawning a decoder thread cannot fail with a valid name");

    Ok(DecoderHandle {
        session_id,
        vfo,
        kind,
        stats,
        stop: stop_tx,
        join: Some(join),
    })
}

#[allow(clippy::too_many_arguments)]
fn run_iq_decoder(
    session_id: String,
    vfo: u8,
    kind: DecoderKind,
    tracker: Arc<SessionTracker>,
    blocks: Receiver<IqBlock>,
    stop: Receiver<()>,
    events: EventBus,
    mut sink: PacketSink,
    mut front_end: FrontEnd,
    stats: Arc<Mutex<DecoderStats>>,
) {
    info!(session = %session_id, vfo, decoder = kind.as_str(), "decoder started");
    let send_status = |status: DecoderStatus| {
        events.publish(Event::DecoderStatus {
            session_id: session_id.clone(),
            vfo,
            decoder_type: kind.as_str(),
            status,
        });
    };
    send_status(DecoderStatus::Listening);

    let mut mixer_for_power = crate::signal_processing::mixer::FrequencyShifter::new();
    let mut last_status = Instant::now();
    let mut decoding = false;

    loop {
        if stop.try_recv().is_ok() {
            break;
        }
        let block = match blocks.recv_timeout(RECV_TIMEOUT) {
            Ok(block) => block,
            Err(RecvTimeoutError::Timeout) => {
                stats.lock().queue_timeouts += 1;
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if block.is_empty() {
            continue;
        }

        let vfo_state = match tracker.get_vfo(&session_id, vfo) {
            Some(state) if state.active => state,
            _ => continue,
        };

        {
            let mut s = stats.lock();
            s.iq_chunks_in += 1;
            s.samples_in += block.len() as u64;
        }

        sink.sdr_center_freq = Some(block.center_freq);
        sink.sdr_sample_rate = Some(block.sample_rate);

        let offset = (vfo_state.center_freq - block.center_freq) as f64;

        // Power is measured on the translated signal, before any
        // decimation or AGC touches it.
        let translated = mixer_for_power.shift(&block.samples, offset, block.sample_rate as f64);
        sink.power.update(&translated);

        match front_end.process(&block.samples, block.sample_rate, offset) {
            Ok(frames) => {
                sink.decoder_rate = Some(front_end.decoder_rate());
                stats.lock().symbols_decoded = front_end.symbols_decoded();
                for frame in frames {
                    let callsigns = ax25::callsigns(&frame);
                    match sink.on_packet_decoded(&frame, callsigns) {
                        Ok(Some(_)) => {
                            let mut s = stats.lock();
                            s.packets_decoded = sink.packet_count();
                            s.data_messages_out += 1;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            error!(%err, "error processing decoded packet");
                            stats.lock().errors += 1;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(%err, "decoder DSP error, block dropped");
                stats.lock().errors += 1;
            }
        }

        if !decoding && front_end.symbols_decoded() > 0 {
            decoding = true;
            send_status(DecoderStatus::Decoding);
        }
        if last_status.elapsed() >= STATUS_INTERVAL {
            send_status(if decoding {
                DecoderStatus::Decoding
            } else {
                DecoderStatus::Listening
            });
            last_status = Instant::now();
        }
    }

    send_status(DecoderStatus::Closed);
    info!(session = %session_id, vfo, decoder = kind.as_str(), "decoder stopped");
}

/// Spawn a Morse decoder worker, fed demodulated audio frames from the
/// demodulator's fanout.
pub fn spawn_morse_decoder(
    config: DecoderConfig,
    session_id: String,
    vfo: u8,
    audio: Receiver<AudioFrame>,
    events: EventBus,
) -> DecoderHandle {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let stats = Arc::new(Mutex::new(DecoderStats::default()));

    let stats_for_thread = Arc::clone(&stats);
    let session_for_thread = session_id.clone();
    let join = std::thread::Builder::new()
        .name(format!("groundwave-morse-{session_id}-vfo{vfo}"))
        .spawn(move || {
            run_morse_decoder(
                config,
                session_for_thread,
                vfo,
                audio,
                stop_rx,
                events,
                stats_for_thread,
            );
        })
        .expect("spawning a morse thread cannot fail with a valid name");

    DecoderHandle {
        session_id,
        vfo,
        kind: DecoderKind::Morse,
        stats,
        stop: stop_tx,
        join: Some(join),
    }
}

fn run_morse_decoder(
    config: DecoderConfig,
    session_id: String,
    vfo: u8,
    audio: Receiver<AudioFrame>,
    stop: Receiver<()>,
    events: EventBus,
    stats: Arc<Mutex<DecoderStats>>,
) {
    info!(session = %session_id, vfo, "morse decoder started");
    events.publish(Event::DecoderStatus {
        session_id: session_id.clone(),
        vfo,
        decoder_type: "morse",
        status: DecoderStatus::Listening,
    });

    let mut decoder: Option<morse::MorseDecoder> = None;
    let mut last_output = Instant::now() - TEXT_OUTPUT_INTERVAL;

    loop {
        if stop.try_recv().is_ok() {
            break;
        }
        let frame = match audio.recv_timeout(RECV_TIMEOUT) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => {
                stats.lock().queue_timeouts += 1;
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let morse = decoder.get_or_insert_with(|| {
            morse::MorseDecoder::new(
                frame.sample_rate,
                config.tone_freq_hz,
                config.tone_bandwidth_hz,
            )
        });

        {
            let mut s = stats.lock();
            s.iq_chunks_in += 1;
            s.samples_in += frame.samples.len() as u64;
        }

        let decoded = morse.process(&frame.samples);
        if !decoded.is_empty() {
            stats.lock().packets_decoded += decoded.len() as u64;
        }

        // Rate-limited text output.
        if !decoded.is_empty() && last_output.elapsed() >= TEXT_OUTPUT_INTERVAL {
            last_output = Instant::now();
            events.publish(Event::DecoderText {
                session_id: session_id.clone(),
                vfo,
                text: morse.decoded_text().to_string(),
                character_count: morse.character_count,
                wpm: morse.wpm,
            });
            stats.lock().data_messages_out += 1;
        }
    }

    // Persist whatever was decoded.
    if let Some(morse) = &decoder {
        let text = morse.decoded_text().trim();
        if !text.is_empty() {
            let stamp = Local::now().format("%Y%m%d_%H%M%S");
            let path = PathBuf::from(&config.output_dir).join(format!("cw_{stamp}.txt"));
            if std::fs::create_dir_all(&config.output_dir).is_ok() {
                match std::fs::write(&path, text) {
                    Ok(()) => info!(path = %path.display(), "saved decoded CW text"),
                    Err(err) => error!(%err, "failed to save decoded CW text"),
                }
            }
        }
    }

    events.publish(Event::DecoderStatus {
        session_id: session_id.clone(),
        vfo,
        decoder_type: "morse",
        status: DecoderStatus::Closed,
    });
    info!(session = %session_id, vfo, "morse decoder stopped");
}
