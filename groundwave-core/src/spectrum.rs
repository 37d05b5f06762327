//! Per-source spectrum worker: consumes the fabric's spectrum tap and
//! emits frequency-domain frames at the block cadence.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::info;

use crate::block::{IqBlock, SpectrumFrame};
use crate::config::SpectrumConfig;
use crate::events::{Event, EventBus};
use crate::signal_processing::spectrum::PowerSpectrum;

const RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// Handle for a running spectrum worker.
pub struct SpectrumHandle {
    control: Sender<SpectrumConfig>,
    stop: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl SpectrumHandle {
    /// Display parameters apply in-flight at the next block boundary.
    pub fn reconfigure(&self, config: SpectrumConfig) -> bool {
        self.control.send(config).is_ok()
    }

    pub fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

/// Spawn the spectrum worker for one source.
pub fn spawn(
    source_id: String,
    config: SpectrumConfig,
    blocks: Receiver<IqBlock>,
    events: EventBus,
) -> SpectrumHandle {
    let (control_tx, control_rx) = bounded::<SpectrumConfig>(8);
    let (stop_tx, stop_rx) = bounded::<()>(1);

    let join = std::thread::Builder::new()
        .name(format!("groundwave-spectrum-{source_id}"))
        .spawn(move || {
            run(source_id, config, blocks, control_rx, stop_rx, events);
        })
        .expect("spawning a spectrum thread cannot fail with a valid name");

    SpectrumHandle {
        control: control_tx,
        stop: stop_tx,
        join: Some(join),
    }
}

fn run(
    source_id: String,
    mut config: SpectrumConfig,
    blocks: Receiver<IqBlock>,
    control: Receiver<SpectrumConfig>,
    stop: Receiver<()>,
    events: EventBus,
) {
    info!(source = %source_id, fft_size = config.fft_size, "spectrum processor started");
    let mut spectrum = PowerSpectrum::new(config.fft_size, config.window, config.averaging);

    loop {
        if stop.try_recv().is_ok() {
            break;
        }
        while let Ok(next) = control.try_recv() {
            config = next;
            spectrum.reconfigure(config.fft_size, config.window, config.averaging);
        }

        let block = match blocks.recv_timeout(RECV_TIMEOUT) {
            Ok(block) => block,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if block.is_empty() {
            continue;
        }

        let frame = spectrum.process(&block.samples);
        events.publish(Event::Spectrum(SpectrumFrame {
            source_id: source_id.clone(),
            power_dbfs: Arc::new(frame),
            center_freq: block.center_freq,
            sample_rate: block.sample_rate,
            fft_size: spectrum.fft_size(),
            averaging: config.averaging,
            wall_clock: block.wall_clock,
            playback: block.playback,
        }));
    }
    info!(source = %source_id, "spectrum processor stopped");
}
