//! Process/lifecycle manager: owns the set of running sources and
//! their downstream consumers, and reconciles desired state (from the
//! session tracker) against what is actually running.
//!
//! Workers own only their channels; the manager owns the workers.
//! Nothing here ever holds a lock across a DSP operation.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{
    ApiKeys, ConfigPatch, DecoderConfig, DecoderKind, DemodConfig, Modulation, SourceConfig,
    SourceDescriptor, TransmitterInfo,
};
use crate::decode::{self, DecoderHandle};
use crate::demod::{self, DemodHandle};
use crate::errors::StateError;
use crate::events::{Event, EventBus, SourceEvent};
use crate::fabric::{IqBroadcaster, TapId, DEFAULT_TAP_CAPACITY};
use crate::session::{SessionTracker, StateChange, VfoState};
use crate::source::{self, SourceHandle};
use crate::spectrum::{self, SpectrumHandle};
use crate::transcribe::{self, TranscribeHandle};

/// Graceful stop budget for a source worker.
const GRACEFUL_STOP: Duration = Duration::from_secs(5);
/// Final grace after a failed graceful stop.
const FINAL_GRACE: Duration = Duration::from_secs(1);

/// Audio tap names registered on a demodulator's fanout.
const TAP_TRANSCRIPTION: &str = "transcription";
const TAP_MORSE: &str = "morse";
const AUDIO_TAP_CAPACITY: usize = 32;

type ConsumerKey = (String, u8);

/// Everything running for one source.
struct SourceRuntime {
    descriptor: SourceDescriptor,
    config: SourceConfig,
    fabric: Arc<IqBroadcaster>,
    source: SourceHandle,
    spectrum: SpectrumHandle,
    demodulators: HashMap<ConsumerKey, DemodHandle>,
    decoders: HashMap<ConsumerKey, DecoderHandle>,
    transcribers: HashMap<ConsumerKey, TranscribeHandle>,
    /// Attached sessions; the source lives while this is non-empty.
    clients: HashSet<String>,
}

/// Read-only snapshot of one source's runtime, for observability.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSnapshot {
    pub source_id: String,
    pub alive: bool,
    pub clients: Vec<String>,
    /// Demodulator worker class names keyed by "session:vfo".
    pub demodulators: HashMap<String, String>,
    pub decoders: HashMap<String, String>,
    pub transcribers: Vec<String>,
}

pub struct RuntimeManager {
    tracker: Arc<SessionTracker>,
    events: EventBus,
    demod_config: DemodConfig,
    api_keys: RwLock<ApiKeys>,
    output_dir: String,
    /// Descriptors and initial configs known to the system, keyed by
    /// source id.
    registry: RwLock<HashMap<String, (SourceDescriptor, SourceConfig)>>,
    /// Transmitter overrides pinned by observations, keyed by the
    /// locked transmitter id.
    transmitters: RwLock<HashMap<String, TransmitterInfo>>,
    sources: Mutex<HashMap<String, SourceRuntime>>,
}

impl RuntimeManager {
    pub fn new(
        tracker: Arc<SessionTracker>,
        events: EventBus,
        demod_config: DemodConfig,
        api_keys: ApiKeys,
        output_dir: impl Into<String>,
    ) -> Self {
        Self {
            tracker,
            events,
            demod_config,
            api_keys: RwLock::new(api_keys),
            output_dir: output_dir.into(),
            registry: RwLock::new(HashMap::new()),
            transmitters: RwLock::new(HashMap::new()),
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Make a source available for sessions to attach to.
    pub fn register_source(&self, descriptor: SourceDescriptor, config: SourceConfig) {
        self.registry
            .write()
            .insert(descriptor.id.clone(), (descriptor, config));
    }

    /// Register a transmitter record observations can lock VFOs to.
    pub fn register_transmitter(&self, id: impl Into<String>, info: TransmitterInfo) {
        self.transmitters.write().insert(id.into(), info);
    }

    /// Rotate provider API keys. Running transcription workers close
    /// their connections and reconnect with the new keys.
    pub fn rotate_api_keys(&self, keys: ApiKeys) {
        *self.api_keys.write() = keys.clone();
        let sources = self.sources.lock();
        for runtime in sources.values() {
            for transcriber in runtime.transcribers.values() {
                transcriber.rotate_keys(keys.clone());
            }
        }
    }

    /// The diff-driven core loop: apply one state change.
    pub fn handle_change(&self, change: StateChange) {
        match change {
            StateChange::SessionCreated { .. } => {}
            StateChange::Attached {
                session_id,
                source_id,
            } => {
                if let Err(err) = self.attach(&session_id, &source_id) {
                    warn!(%err, session = %session_id, source = %source_id, "attach failed");
                }
            }
            StateChange::Detached {
                session_id,
                source_id,
            } => self.detach(&session_id, &source_id),
            StateChange::SessionRemoved {
                session_id,
                source_id,
            } => {
                if let Some(source_id) = source_id {
                    self.detach(&session_id, &source_id);
                }
            }
            StateChange::VfoChanged {
                session_id,
                vfo,
                previous,
                current,
            } => self.reconcile_vfo(&session_id, vfo, &previous, &current),
        }
    }

    /// Run the reconcile loop until the change channel closes.
    pub fn run(&self, changes: Receiver<StateChange>) {
        for change in changes.iter() {
            self.handle_change(change);
        }
    }

    fn attach(&self, session_id: &str, source_id: &str) -> Result<(), StateError> {
        let mut sources = self.sources.lock();

        // A dead worker is reaped and the source rebuilt.
        let needs_restart = sources
            .get(source_id)
            .map(|runtime| runtime.source.is_finished())
            .unwrap_or(false);
        if needs_restart {
            let dead = sources.remove(source_id).expect("present");
            drop(sources);
            self.teardown(dead);
            return self.attach(session_id, source_id);
        }

        if let Some(runtime) = sources.get_mut(source_id) {
            runtime.clients.insert(session_id.to_string());
            info!(session = session_id, source = source_id, "client joined running source");
        } else {
            let (descriptor, config) = self
                .registry
                .read()
                .get(source_id)
                .cloned()
                .ok_or_else(|| StateError::UnknownSource {
                    source_id: source_id.to_string(),
                })?;

            let fabric = Arc::new(IqBroadcaster::new(source_id.to_string()));
            let (status_tx, status_rx) = unbounded();
            let source =
                source::spawn(descriptor.clone(), config.clone(), Arc::clone(&fabric), status_tx);
            self.spawn_status_monitor(status_rx);

            let (spectrum_rx, _drops) = fabric.subscribe(TapId::Spectrum, DEFAULT_TAP_CAPACITY);
            let spectrum = spectrum::spawn(
                source_id.to_string(),
                config.spectrum,
                spectrum_rx,
                self.events.clone(),
            );

            let mut clients = HashSet::new();
            clients.insert(session_id.to_string());
            sources.insert(
                source_id.to_string(),
                SourceRuntime {
                    descriptor,
                    config,
                    fabric,
                    source,
                    spectrum,
                    demodulators: HashMap::new(),
                    decoders: HashMap::new(),
                    transcribers: HashMap::new(),
                    clients,
                },
            );
            info!(session = session_id, source = source_id, "source started");
        }
        drop(sources);

        // The session may already carry active VFOs (reattach case).
        for (sid, vfo, state) in self.tracker.list_vfos_for_source(source_id) {
            if sid == session_id {
                self.reconcile_vfo(&sid, vfo, &VfoState::default(), &state);
            }
        }
        Ok(())
    }

    fn detach(&self, session_id: &str, source_id: &str) {
        let mut sources = self.sources.lock();
        let Some(runtime) = sources.get_mut(source_id) else {
            return;
        };
        runtime.clients.remove(session_id);

        // Stop this session's consumers regardless of refcount.
        let keys: Vec<ConsumerKey> = runtime
            .demodulators
            .keys()
            .chain(runtime.decoders.keys())
            .chain(runtime.transcribers.keys())
            .filter(|(sid, _)| sid == session_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(handle) = runtime.demodulators.remove(&key) {
                runtime.fabric.unsubscribe(&TapId::Demodulator {
                    session_id: key.0.clone(),
                    vfo: key.1,
                });
                handle.stop();
            }
            if let Some(handle) = runtime.decoders.remove(&key) {
                runtime.fabric.unsubscribe(&TapId::Decoder {
                    session_id: key.0.clone(),
                    vfo: key.1,
                });
                handle.stop();
            }
            if let Some(handle) = runtime.transcribers.remove(&key) {
                handle.stop();
            }
        }

        if runtime.clients.is_empty() {
            let runtime = sources.remove(source_id).expect("present");
            drop(sources);
            info!(source = source_id, "last client detached, stopping source");
            self.teardown(runtime);
        }
    }

    /// Stop a source and cascade through its consumers: signal, wait
    /// up to 5 s, then a final grace second. `Terminated` always goes
    /// out, whichever path was taken.
    fn teardown(&self, mut runtime: SourceRuntime) {
        runtime.source.stop();
        let graceful = runtime.source.join_timeout(GRACEFUL_STOP);
        if !graceful {
            warn!(
                source = %runtime.source.source_id,
                "source did not stop gracefully, abandoning thread"
            );
            let _ = runtime.source.join_timeout(FINAL_GRACE);
            // The worker could not emit its own event; do it here.
            self.events
                .publish(Event::Source(SourceEvent::Terminated {
                    source_id: runtime.source.source_id.clone(),
                }));
        }

        runtime.spectrum.stop();
        for (_, handle) in runtime.demodulators.drain() {
            handle.stop();
        }
        for (_, handle) in runtime.decoders.drain() {
            handle.stop();
        }
        for (_, handle) in runtime.transcribers.drain() {
            handle.stop();
        }
        info!(source = %runtime.descriptor.id, "source runtime torn down");
    }

    /// Reconcile one VFO's workers against its new state.
    fn reconcile_vfo(&self, session_id: &str, vfo: u8, previous: &VfoState, current: &VfoState) {
        let Some(source_id) = self.tracker.source_for_session(session_id) else {
            return;
        };
        let key: ConsumerKey = (session_id.to_string(), vfo);
        let mut sources = self.sources.lock();
        let Some(runtime) = sources.get_mut(&source_id) else {
            return;
        };

        // Demodulator: exists iff active with a known modulation.
        // Mode changes respawn; frequency changes reuse the worker.
        let wants_demod = current.active && current.modulation != Modulation::None;
        let demod_running = runtime.demodulators.contains_key(&key);
        let mode_changed = previous.modulation != current.modulation;
        if demod_running && (!wants_demod || mode_changed) {
            if let Some(handle) = runtime.demodulators.remove(&key) {
                runtime.fabric.unsubscribe(&TapId::Demodulator {
                    session_id: key.0.clone(),
                    vfo,
                });
                handle.stop();
            }
        }
        if wants_demod && !runtime.demodulators.contains_key(&key) {
            let (rx, _drops) = runtime.fabric.subscribe(
                TapId::Demodulator {
                    session_id: key.0.clone(),
                    vfo,
                },
                DEFAULT_TAP_CAPACITY,
            );
            let handle = demod::spawn(
                session_id.to_string(),
                vfo,
                self.demod_config,
                Arc::clone(&self.tracker),
                rx,
                self.events.clone(),
            );
            runtime.demodulators.insert(key.clone(), handle);
        }

        // Decoder: keyed on the decoder tag.
        let wants_decoder = current.active && current.decoder != DecoderKind::None;
        let kind_changed = previous.decoder != current.decoder;
        if runtime.decoders.contains_key(&key) && (!wants_decoder || kind_changed || mode_changed) {
            if let Some(handle) = runtime.decoders.remove(&key) {
                runtime.fabric.unsubscribe(&TapId::Decoder {
                    session_id: key.0.clone(),
                    vfo,
                });
                if handle.kind == DecoderKind::Morse {
                    if let Some(demod) = runtime.demodulators.get(&key) {
                        demod.fanout.remove(TAP_MORSE);
                    }
                }
                handle.stop();
            }
        }
        if wants_decoder && !runtime.decoders.contains_key(&key) {
            let mut config = DecoderConfig::new(current.decoder);
            config.output_dir = self.output_dir.clone();
            if let Some(transmitter_id) = &current.locked_transmitter_id {
                if let Some(info) = self.transmitters.read().get(transmitter_id).cloned() {
                    config = config.with_transmitter(info);
                }
            }

            if current.decoder == DecoderKind::Morse {
                // Morse feeds on the demodulated audio path.
                if let Some(demod) = runtime.demodulators.get(&key) {
                    let (tx, rx) = crossbeam::channel::bounded(AUDIO_TAP_CAPACITY);
                    demod.fanout.add(TAP_MORSE, tx);
                    let handle = decode::spawn_morse_decoder(
                        config,
                        session_id.to_string(),
                        vfo,
                        rx,
                        self.events.clone(),
                    );
                    runtime.decoders.insert(key.clone(), handle);
                } else {
                    warn!(
                        session = session_id,
                        vfo, "morse decoder needs an active CW/SSB demodulator"
                    );
                }
            } else {
                let (rx, _drops) = runtime.fabric.subscribe(
                    TapId::Decoder {
                        session_id: key.0.clone(),
                        vfo,
                    },
                    DEFAULT_TAP_CAPACITY,
                );
                match decode::spawn_iq_decoder(
                    config,
                    session_id.to_string(),
                    vfo,
                    Arc::clone(&self.tracker),
                    rx,
                    self.events.clone(),
                ) {
                    Ok(handle) => {
                        runtime.decoders.insert(key.clone(), handle);
                    }
                    Err(err) => warn!(%err, "decoder spawn failed"),
                }
            }
        }

        // Transcription: exists iff enabled on an active VFO with a
        // demodulator feeding it.
        // A mode change replaced the demodulator (and its fanout), so
        // the transcriber must re-tap the new one.
        let wants_stt = current.active && current.transcription.enabled;
        let stt_settings_changed = previous.transcription != current.transcription;
        if runtime.transcribers.contains_key(&key)
            && (!wants_stt || stt_settings_changed || mode_changed)
        {
            if let Some(handle) = runtime.transcribers.remove(&key) {
                if let Some(demod) = runtime.demodulators.get(&key) {
                    demod.fanout.remove(TAP_TRANSCRIPTION);
                }
                handle.stop();
            }
        }
        if wants_stt && !runtime.transcribers.contains_key(&key) {
            if let Some(demod) = runtime.demodulators.get(&key) {
                let (tx, rx) = crossbeam::channel::bounded(AUDIO_TAP_CAPACITY);
                demod.fanout.add(TAP_TRANSCRIPTION, tx);
                let handle = transcribe::spawn(
                    session_id.to_string(),
                    vfo,
                    current.transcription.clone(),
                    self.api_keys.read().clone(),
                    rx,
                    self.events.clone(),
                );
                runtime.transcribers.insert(key.clone(), handle);
            }
        }
    }

    /// Forward a configuration patch to a running source (and its
    /// spectrum processor, for the display parameters).
    pub fn configure_source(&self, source_id: &str, patch: ConfigPatch) -> Result<(), StateError> {
        let mut sources = self.sources.lock();
        let runtime = sources
            .get_mut(source_id)
            .ok_or_else(|| StateError::UnknownSource {
                source_id: source_id.to_string(),
            })?;
        runtime.config.apply(&patch);
        runtime.source.configure(patch);
        runtime.spectrum.reconfigure(runtime.config.spectrum);
        Ok(())
    }

    fn spawn_status_monitor(&self, status: Receiver<SourceEvent>) {
        let events = self.events.clone();
        std::thread::Builder::new()
            .name("groundwave-source-monitor".to_string())
            .spawn(move || {
                for event in status.iter() {
                    let terminal = matches!(event, SourceEvent::Terminated { .. });
                    events.publish(Event::Source(event));
                    if terminal {
                        break;
                    }
                }
            })
            .expect("spawning a monitor thread cannot fail with a valid name");
    }

    /// Read-only introspection over every source runtime.
    pub fn snapshot(&self) -> Vec<SourceSnapshot> {
        let sources = self.sources.lock();
        let mut snapshots: Vec<SourceSnapshot> = sources
            .iter()
            .map(|(source_id, runtime)| {
                let mut clients: Vec<String> = runtime.clients.iter().cloned().collect();
                clients.sort();
                SourceSnapshot {
                    source_id: source_id.clone(),
                    alive: !runtime.source.is_finished(),
                    clients,
                    demodulators: runtime
                        .demodulators
                        .keys()
                        .map(|(sid, vfo)| (format!("{sid}:{vfo}"), "DemodWorker".to_string()))
                        .collect(),
                    decoders: runtime
                        .decoders
                        .iter()
                        .map(|((sid, vfo), handle)| {
                            (format!("{sid}:{vfo}"), handle.kind.as_str().to_string())
                        })
                        .collect(),
                    transcribers: runtime
                        .transcribers
                        .keys()
                        .map(|(sid, vfo)| format!("{sid}:{vfo}"))
                        .collect(),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        snapshots
    }

    pub fn client_count(&self, source_id: &str) -> usize {
        self.sources
            .lock()
            .get(source_id)
            .map(|runtime| runtime.clients.len())
            .unwrap_or(0)
    }

    pub fn is_source_running(&self, source_id: &str) -> bool {
        self.sources
            .lock()
            .get(source_id)
            .map(|runtime| !runtime.source.is_finished())
            .unwrap_or(false)
    }

    /// Stop everything. Used at process shutdown.
    pub fn shutdown(&self) {
        let runtimes: Vec<SourceRuntime> = {
            let mut sources = self.sources.lock();
            sources.drain().map(|(_, runtime)| runtime).collect()
        };
        for runtime in runtimes {
            self.teardown(runtime);
        }
    }
}
