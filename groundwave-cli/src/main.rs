mod config;
mod logging;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use color_eyre::eyre::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use groundwave_core::block::AudioLayout;
use groundwave_core::config::DemodConfig;
use groundwave_core::events::{Event, SourceEvent};
use groundwave_core::session::SessionMetadata;
use groundwave_core::{Runtime, VfoPatch};

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Groundwave receiver front-end", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Enable verbose diagnostic output
    #[arg(short, long)]
    verbose: bool,

    /// Write demodulated audio to a WAV file (overrides config)
    #[arg(short = 'w', long)]
    wav_output: Option<PathBuf>,

    /// Tune the VFO to this frequency in Hz (overrides config)
    #[arg(short = 'f', long)]
    frequency: Option<i64>,

    /// Stop after this many seconds (overrides config)
    #[arg(short = 'd', long)]
    duration: Option<u64>,
}

const SESSION_ID: &str = "cli";

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();
    logging::init(args.verbose);

    let mut config = CliConfig::from_file(&args.config)?;
    if let Some(wav) = args.wav_output {
        config.output.wav = Some(wav);
    }
    if let Some(frequency) = args.frequency {
        config.vfo.frequency_hz = frequency;
    }
    if let Some(duration) = args.duration {
        config.output.duration_secs = duration;
    }

    let (descriptor, source_config) = config.source_descriptor()?;
    info!(
        source = descriptor.kind.as_str(),
        center_mhz = source_config.center_freq as f64 / 1e6,
        rate_msps = source_config.sample_rate as f64 / 1e6,
        "starting receiver"
    );

    let (runtime, events) = Runtime::start(
        DemodConfig::default(),
        config.api_keys.clone(),
        config.output.decoded_dir.clone(),
    );
    runtime.manager.register_source(descriptor, source_config);

    runtime
        .tracker
        .create_session(SESSION_ID, SessionMetadata::default());
    runtime
        .tracker
        .attach_session_to_source(SESSION_ID, "cli-source")
        .map_err(|err| color_eyre::eyre::eyre!("attach failed: {err}"))?;
    runtime
        .tracker
        .configure_vfo(
            SESSION_ID,
            1,
            VfoPatch {
                center_freq: Some(config.vfo.frequency_hz),
                bandwidth: Some(config.vfo.bandwidth_hz),
                modulation: Some(config.vfo.mode),
                decoder: Some(config.vfo.decoder),
                volume: Some(config.vfo.volume),
                squelch_dbfs: config.vfo.squelch_dbfs,
                active: Some(true),
                selected: Some(true),
                ..Default::default()
            },
        )
        .map_err(|err| color_eyre::eyre::eyre!("VFO rejected: {err}"))?;

    let mut wav_writer = match &config.output.wav {
        Some(path) => {
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: 44_100,
                bits_per_sample: 32,
                sample_format: hound::SampleFormat::Float,
            };
            info!(path = %path.display(), "writing audio to WAV");
            Some(hound::WavWriter::create(path, spec)?)
        }
        None => None,
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrl_c_handler(move || interrupted.store(true, Ordering::SeqCst));
    }

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("static template is valid"),
    );
    progress.enable_steady_tick(Duration::from_millis(200));

    let started = Instant::now();
    let deadline = if config.output.duration_secs > 0 {
        Some(started + Duration::from_secs(config.output.duration_secs))
    } else {
        None
    };

    let mut audio_frames: u64 = 0;
    let mut spectrum_frames: u64 = 0;
    let mut packets: u64 = 0;
    let mut last_power: Option<f32> = None;

    loop {
        if interrupted.load(Ordering::SeqCst) {
            info!("interrupted, shutting down");
            break;
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                info!("duration reached, shutting down");
                break;
            }
        }

        let event = match events.recv_timeout(Duration::from_millis(250)) {
            Ok(event) => event,
            Err(_) => continue,
        };
        match event {
            Event::Audio(frame) => {
                audio_frames += 1;
                if let Some(power) = frame.rf_power_dbfs {
                    last_power = Some(power);
                }
                if let Some(writer) = wav_writer.as_mut() {
                    match frame.layout {
                        AudioLayout::Mono => {
                            for &sample in frame.samples.iter() {
                                writer.write_sample(sample)?;
                            }
                        }
                        AudioLayout::Stereo => {
                            // Mono WAV out: fold stereo down.
                            for pair in frame.samples.chunks_exact(2) {
                                writer.write_sample((pair[0] + pair[1]) / 2.0)?;
                            }
                        }
                    }
                }
            }
            Event::Spectrum(frame) => {
                spectrum_frames += 1;
                let position = frame
                    .playback
                    .map(|p| format!(" {:>5.1}s/{:.1}s", p.elapsed_secs, p.total_secs))
                    .unwrap_or_default();
                progress.set_message(format!(
                    "{:.3} MHz | audio {} | spectrum {} | packets {} | RF {}{}",
                    frame.center_freq as f64 / 1e6,
                    audio_frames,
                    spectrum_frames,
                    packets,
                    last_power
                        .map(|p| format!("{p:.1} dBFS"))
                        .unwrap_or_else(|| "--".to_string()),
                    position,
                ));
            }
            Event::PacketDecoded(record) => {
                packets += 1;
                let from = record.metadata["ax25"]["from_callsign"]
                    .as_str()
                    .unwrap_or("?");
                let to = record.metadata["ax25"]["to_callsign"].as_str().unwrap_or("?");
                progress.println(format!(
                    "packet #{} [{}] {} -> {} ({} bytes) saved to {}",
                    record.packet_number,
                    record.decoder_type,
                    from,
                    to,
                    record.payload.len(),
                    record.binary_path,
                ));
            }
            Event::DecoderText {
                text,
                wpm,
                character_count,
                ..
            } => {
                progress.println(format!(
                    "cw [{} chars{}] {}",
                    character_count,
                    wpm.map(|w| format!(", {w} wpm")).unwrap_or_default(),
                    text,
                ));
            }
            Event::Transcription {
                text,
                language,
                is_final,
                ..
            } => {
                let marker = if is_final { "" } else { " (partial)" };
                progress.println(format!("stt [{language}]{marker} {text}"));
            }
            Event::WorkerError { kind, message, .. } => {
                warn!(?kind, %message, "transcription error");
            }
            Event::Source(SourceEvent::Error { message, .. }) => {
                warn!(%message, "source error");
            }
            Event::Source(SourceEvent::Terminated { source_id }) => {
                info!(source = %source_id, "source terminated");
                break;
            }
            _ => {}
        }
    }

    progress.finish_and_clear();
    if let Some(writer) = wav_writer {
        writer.finalize()?;
    }
    runtime.shutdown();

    info!(
        audio_frames,
        spectrum_frames,
        packets,
        elapsed_secs = started.elapsed().as_secs(),
        "receiver stopped"
    );
    Ok(())
}

/// SIGINT hook: a helper thread waits for ctrl-c and sets the flag the
/// synchronous main loop polls.
fn ctrl_c_handler(callback: impl Fn() + Send + 'static) {
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build();
        if let Ok(runtime) = runtime {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    callback();
                }
            });
        }
    });
}
