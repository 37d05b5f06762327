//! End-to-end pipeline tests: SigMF playback through the runtime to
//! spectrum frames, audio frames and lifecycle events.

use std::f64::consts::TAU;
use std::io::Write;
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;
use num_complex::Complex32;

use groundwave_core::config::{DemodConfig, Gain, SourceConfig, SpectrumConfig};
use groundwave_core::events::{Event, SourceEvent};
use groundwave_core::session::{SessionMetadata, VfoPatch};
use groundwave_core::{Modulation, Runtime, SourceDescriptor, SourceKind};

const RATE: u32 = 48_000;
const CENTER: i64 = 100_100_000;

/// Write a one-second FM recording: a 1 kHz tone at 5 kHz deviation,
/// centered on the capture frequency.
fn write_fm_recording(dir: &std::path::Path) -> String {
    let base = dir.join("fm_capture");
    let meta = serde_json::json!({
        "global": {
            "core:datatype": "cf32_le",
            "core:sample_rate": RATE as f64,
        },
        "captures": [
            {"core:sample_start": 0, "core:frequency": CENTER as f64,
             "core:datetime": "2026-07-01T12:00:00Z"}
        ]
    });
    std::fs::write(
        base.with_extension("sigmf-meta"),
        serde_json::to_string(&meta).unwrap(),
    )
    .unwrap();

    let mut file = std::fs::File::create(base.with_extension("sigmf-data")).unwrap();
    let mut phase = 0.0f64;
    for n in 0..RATE as usize {
        let audio = (TAU * 1000.0 * n as f64 / RATE as f64).sin();
        phase += TAU * 5_000.0 * audio / RATE as f64;
        let sample = Complex32::new(phase.cos() as f32 * 0.5, phase.sin() as f32 * 0.5);
        file.write_all(&sample.re.to_le_bytes()).unwrap();
        file.write_all(&sample.im.to_le_bytes()).unwrap();
    }
    base.display().to_string()
}

fn playback_descriptor(recording: String) -> SourceDescriptor {
    SourceDescriptor {
        id: "playback-0".into(),
        name: "FM test capture".into(),
        kind: SourceKind::SigmfPlayback {
            recording_path: recording,
            loop_playback: true,
        },
    }
}

fn source_config() -> SourceConfig {
    SourceConfig {
        center_freq: CENTER,
        sample_rate: RATE,
        gain: Gain::Db(20.0),
        antenna: None,
        offset_freq: 0,
        spectrum: SpectrumConfig {
            fft_size: 1024,
            ..Default::default()
        },
    }
}

/// Wait for an event matching `predicate`, consuming others.
fn wait_for(events: &Receiver<Event>, timeout: Duration, predicate: impl Fn(&Event) -> bool) -> Option<Event> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) if predicate(&event) => return Some(event),
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    None
}

#[test]
fn cold_start_single_session_fm() {
    let dir = tempfile::tempdir().unwrap();
    let recording = write_fm_recording(dir.path());

    let (runtime, events) = Runtime::start(
        DemodConfig::default(),
        Default::default(),
        dir.path().join("decoded").display().to_string(),
    );
    runtime
        .manager
        .register_source(playback_descriptor(recording), source_config());

    runtime.tracker.create_session("user-a", SessionMetadata::default());
    runtime
        .tracker
        .attach_session_to_source("user-a", "playback-0")
        .unwrap();
    runtime
        .tracker
        .configure_vfo(
            "user-a",
            1,
            VfoPatch {
                center_freq: Some(CENTER),
                bandwidth: Some(12_500),
                modulation: Some(Modulation::Fm),
                active: Some(true),
                selected: Some(true),
                ..Default::default()
            },
        )
        .unwrap();

    let started = wait_for(&events, Duration::from_secs(3), |event| {
        matches!(
            event,
            Event::Source(SourceEvent::StreamingStarted { source_id }) if source_id == "playback-0"
        )
    });
    assert!(started.is_some(), "no streaming-started event");

    let spectrum = wait_for(&events, Duration::from_secs(3), |event| {
        matches!(event, Event::Spectrum(frame) if frame.source_id == "playback-0")
    });
    match spectrum {
        Some(Event::Spectrum(frame)) => {
            assert_eq!(frame.power_dbfs.len(), 1024);
            assert_eq!(frame.center_freq, CENTER);
            assert_eq!(frame.sample_rate, RATE);
            assert!(frame.wall_clock.is_some());
        }
        _ => panic!("no spectrum frame"),
    }

    let audio = wait_for(&events, Duration::from_secs(5), |event| {
        matches!(event, Event::Audio(frame) if frame.session_id == "user-a" && frame.vfo == 1)
    });
    match audio {
        Some(Event::Audio(frame)) => {
            assert_eq!(frame.samples.len(), 1024);
            assert_eq!(frame.sample_rate, 44_100);
        }
        _ => panic!("no audio frame"),
    }

    assert!(runtime.manager.is_source_running("playback-0"));
    assert_eq!(runtime.manager.client_count("playback-0"), 1);

    // Last session detaching stops the source within bounded time.
    runtime.tracker.remove_session("user-a");
    let deadline = Instant::now() + Duration::from_secs(6);
    while runtime.manager.is_source_running("playback-0") && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(!runtime.manager.is_source_running("playback-0"));

    runtime.shutdown();
}

#[test]
fn two_sessions_share_one_source() {
    let dir = tempfile::tempdir().unwrap();
    let recording = write_fm_recording(dir.path());

    let (runtime, events) = Runtime::start(
        DemodConfig::default(),
        Default::default(),
        dir.path().join("decoded").display().to_string(),
    );
    runtime
        .manager
        .register_source(playback_descriptor(recording), source_config());

    for session in ["user-a", "user-b"] {
        runtime
            .tracker
            .create_session(session, SessionMetadata::default());
        runtime
            .tracker
            .attach_session_to_source(session, "playback-0")
            .unwrap();
    }
    runtime
        .tracker
        .configure_vfo(
            "user-a",
            1,
            VfoPatch {
                center_freq: Some(CENTER),
                bandwidth: Some(12_500),
                modulation: Some(Modulation::Fm),
                active: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
    runtime
        .tracker
        .configure_vfo(
            "user-b",
            2,
            VfoPatch {
                center_freq: Some(CENTER + 5_000),
                bandwidth: Some(12_500),
                modulation: Some(Modulation::Usb),
                active: Some(true),
                ..Default::default()
            },
        )
        .unwrap();

    // Both sessions' demodulators produce audio.
    let got_a = wait_for(&events, Duration::from_secs(5), |event| {
        matches!(event, Event::Audio(frame) if frame.session_id == "user-a")
    });
    assert!(got_a.is_some(), "session A got no audio");
    let got_b = wait_for(&events, Duration::from_secs(5), |event| {
        matches!(event, Event::Audio(frame) if frame.session_id == "user-b")
    });
    assert!(got_b.is_some(), "session B got no audio");

    assert_eq!(runtime.manager.client_count("playback-0"), 2);
    let snapshot = runtime.manager.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].demodulators.len(), 2);

    // Detaching A leaves B running.
    runtime.tracker.remove_session("user-a");
    std::thread::sleep(Duration::from_millis(300));
    assert!(runtime.manager.is_source_running("playback-0"));
    assert_eq!(runtime.manager.client_count("playback-0"), 1);
    let got_b = wait_for(&events, Duration::from_secs(5), |event| {
        matches!(event, Event::Audio(frame) if frame.session_id == "user-b")
    });
    assert!(got_b.is_some(), "session B audio stopped after A detached");

    runtime.shutdown();
}

/// Write a recording carrying one FSK AX.25 frame (1200 baud, 3 kHz
/// deviation), padded with flag fill for clock acquisition.
fn write_fsk_recording(dir: &std::path::Path) -> (String, Vec<u8>) {
    use groundwave_core::decode::ax25;
    use groundwave_core::decode::hdlc::{hdlc_encode, nrzi_encode};

    let frame = ax25::build_ui_frame("LUSAT-1", "CQ", b"end to end packet");
    let mut bits = hdlc_encode(&frame, 64);
    bits.extend(hdlc_encode(b"postamble", 32));
    let line_bits = nrzi_encode(&bits);

    let sps = RATE as usize / 1_200;
    let mut phase = 0.0f64;
    let mut samples = Vec::new();
    for &bit in &line_bits {
        let tone = if bit { 3_000.0 } else { -3_000.0 };
        for _ in 0..sps {
            phase += TAU * tone / RATE as f64;
            samples.push(Complex32::new(phase.cos() as f32, phase.sin() as f32));
        }
    }

    let base = dir.join("fsk_capture");
    let meta = serde_json::json!({
        "global": {
            "core:datatype": "cf32_le",
            "core:sample_rate": RATE as f64,
        },
        "captures": [
            {"core:sample_start": 0, "core:frequency": CENTER as f64}
        ]
    });
    std::fs::write(
        base.with_extension("sigmf-meta"),
        serde_json::to_string(&meta).unwrap(),
    )
    .unwrap();
    let mut file = std::fs::File::create(base.with_extension("sigmf-data")).unwrap();
    for s in &samples {
        file.write_all(&s.re.to_le_bytes()).unwrap();
        file.write_all(&s.im.to_le_bytes()).unwrap();
    }
    (base.display().to_string(), frame)
}

#[test]
fn gmsk_packet_roundtrip_through_runtime() {
    use groundwave_core::config::{DecoderKind, Framing, TransmitterInfo};

    let dir = tempfile::tempdir().unwrap();
    let (recording, frame) = write_fsk_recording(dir.path());
    let decoded_dir = dir.path().join("decoded");

    let (runtime, events) = Runtime::start(
        DemodConfig::default(),
        Default::default(),
        decoded_dir.display().to_string(),
    );
    let descriptor = SourceDescriptor {
        id: "playback-fsk".into(),
        name: "FSK capture".into(),
        kind: SourceKind::SigmfPlayback {
            recording_path: recording,
            loop_playback: true,
        },
    };
    runtime.manager.register_source(descriptor, source_config());
    runtime.manager.register_transmitter(
        "tx-1200",
        TransmitterInfo {
            description: "1k2 FSK beacon".into(),
            mode: "GMSK".into(),
            downlink_freq_hz: Some(CENTER),
            baud: Some(1_200),
            deviation_hz: Some(3_000.0),
            framing: Framing::Ax25,
        },
    );

    runtime
        .tracker
        .create_session("user-a", SessionMetadata::default());
    runtime
        .tracker
        .attach_session_to_source("user-a", "playback-fsk")
        .unwrap();
    runtime
        .tracker
        .configure_vfo(
            "user-a",
            1,
            VfoPatch {
                center_freq: Some(CENTER),
                bandwidth: Some(20_000),
                decoder: Some(DecoderKind::Gmsk),
                active: Some(true),
                locked_transmitter_id: Some(Some("tx-1200".into())),
                ..Default::default()
            },
        )
        .unwrap();

    let packet = wait_for(&events, Duration::from_secs(15), |event| {
        matches!(event, Event::PacketDecoded(_))
    });
    match packet {
        Some(Event::PacketDecoded(record)) => {
            assert_eq!(record.payload, frame);
            assert_eq!(record.metadata["ax25"]["from_callsign"], "LUSAT-1");
            assert_eq!(record.metadata["ax25"]["identified_norad_id"], 20442);
            // Binary persisted byte-identical.
            let written = std::fs::read(&record.binary_path).unwrap();
            assert_eq!(written, frame);
            assert!(std::path::Path::new(&record.metadata_path).exists());
        }
        _ => panic!("no packet decoded"),
    }

    runtime.shutdown();
}

#[test]
fn internal_session_drives_a_source() {
    let dir = tempfile::tempdir().unwrap();
    let recording = write_fm_recording(dir.path());

    let (runtime, events) = Runtime::start(
        DemodConfig::default(),
        Default::default(),
        dir.path().join("decoded").display().to_string(),
    );
    runtime
        .manager
        .register_source(playback_descriptor(recording), source_config());

    let session_id = runtime
        .tracker
        .register_internal_session("obs-7", "playback-0", 1, SessionMetadata::default())
        .unwrap();
    runtime
        .tracker
        .configure_vfo(
            &session_id,
            1,
            VfoPatch {
                center_freq: Some(CENTER),
                bandwidth: Some(12_500),
                modulation: Some(Modulation::Fm),
                active: Some(true),
                ..Default::default()
            },
        )
        .unwrap();

    let audio = wait_for(&events, Duration::from_secs(5), |event| {
        matches!(event, Event::Audio(frame) if frame.session_id == session_id)
    });
    assert!(audio.is_some(), "observation session got no audio");

    runtime.tracker.cleanup_internal_session("obs-7").unwrap();
    let deadline = Instant::now() + Duration::from_secs(6);
    while runtime.manager.is_source_running("playback-0") && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(!runtime.manager.is_source_running("playback-0"));

    runtime.shutdown();
}
