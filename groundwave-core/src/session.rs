//! Session and VFO state: the single source of truth for what every
//! worker should be doing right now.
//!
//! The tracker is an owned, typed store. Mutations are serialized under
//! one lock and each emits a diff event the lifecycle manager consumes;
//! reads hand out cloned snapshots so workers never hold the lock
//! across DSP.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{DecoderKind, Modulation, TranscriptionSettings};
use crate::errors::{ConfigError, StateError};

pub const VFO_COUNT: u8 = 4;

/// State of one VFO within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VfoState {
    pub center_freq: i64,
    pub bandwidth: u32,
    pub modulation: Modulation,
    pub decoder: DecoderKind,
    pub active: bool,
    /// Only one VFO per session is selected for foreground audio.
    pub selected: bool,
    /// 0-100, mapped linearly onto 0.0-6.0x gain.
    pub volume: u8,
    /// Squelch threshold in dBFS; negative infinity disables the gate.
    pub squelch_dbfs: f32,
    pub transcription: TranscriptionSettings,
    /// Set by observations to pin a transmitter's parameters.
    pub locked_transmitter_id: Option<String>,
}

impl Default for VfoState {
    fn default() -> Self {
        Self {
            center_freq: 0,
            bandwidth: 12_500,
            modulation: Modulation::None,
            decoder: DecoderKind::None,
            active: false,
            selected: false,
            volume: 50,
            squelch_dbfs: f32::NEG_INFINITY,
            transcription: TranscriptionSettings::default(),
            locked_transmitter_id: None,
        }
    }
}

/// Partial update to a VFO. Unset fields are untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VfoPatch {
    pub center_freq: Option<i64>,
    pub bandwidth: Option<u32>,
    pub modulation: Option<Modulation>,
    pub decoder: Option<DecoderKind>,
    pub active: Option<bool>,
    pub selected: Option<bool>,
    pub volume: Option<u8>,
    pub squelch_dbfs: Option<f32>,
    pub transcription: Option<TranscriptionSettings>,
    /// `Some(None)` clears the lock.
    pub locked_transmitter_id: Option<Option<String>>,
}

/// Client metadata collected at connect time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub metadata: SessionMetadata,
    pub source_id: Option<String>,
    pub vfos: Vec<VfoState>,
    /// Observation-driven sessions never receive UI events.
    pub internal: bool,
}

impl Session {
    fn new(id: String, metadata: SessionMetadata, internal: bool) -> Self {
        Self {
            id,
            metadata,
            source_id: None,
            vfos: (0..VFO_COUNT).map(|_| VfoState::default()).collect(),
            internal,
        }
    }

    pub fn vfo(&self, vfo: u8) -> Option<&VfoState> {
        if (1..=VFO_COUNT).contains(&vfo) {
            self.vfos.get((vfo - 1) as usize)
        } else {
            None
        }
    }
}

/// Diff emitted on every mutation; consumed by the lifecycle manager.
#[derive(Debug, Clone)]
pub enum StateChange {
    SessionCreated {
        session_id: String,
    },
    SessionRemoved {
        session_id: String,
        source_id: Option<String>,
    },
    Attached {
        session_id: String,
        source_id: String,
    },
    Detached {
        session_id: String,
        source_id: String,
    },
    VfoChanged {
        session_id: String,
        vfo: u8,
        previous: VfoState,
        current: VfoState,
    },
}

/// Thread-safe session/VFO store with serialized mutations.
pub struct SessionTracker {
    sessions: RwLock<HashMap<String, Session>>,
    changes: Mutex<Option<Sender<StateChange>>>,
}

impl SessionTracker {
    pub fn new() -> (Self, Receiver<StateChange>) {
        let (tx, rx) = unbounded();
        (
            Self {
                sessions: RwLock::new(HashMap::new()),
                changes: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Close the diff channel; consumers observe the end of stream.
    pub fn close(&self) {
        self.changes.lock().take();
    }

    fn emit(&self, change: StateChange) {
        if let Some(tx) = self.changes.lock().as_ref() {
            let _ = tx.send(change);
        }
    }

    pub fn create_session(&self, session_id: &str, metadata: SessionMetadata) {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(session_id) {
            return;
        }
        sessions.insert(
            session_id.to_string(),
            Session::new(session_id.to_string(), metadata, false),
        );
        drop(sessions);
        info!(session = session_id, "session created");
        self.emit(StateChange::SessionCreated {
            session_id: session_id.to_string(),
        });
    }

    /// Destroy a session: clears its VFOs and detaches from its source.
    pub fn remove_session(&self, session_id: &str) {
        let removed = self.sessions.write().remove(session_id);
        if let Some(session) = removed {
            info!(session = session_id, "session removed");
            self.emit(StateChange::SessionRemoved {
                session_id: session_id.to_string(),
                source_id: session.source_id,
            });
        } else {
            debug!(
                session = session_id,
                "session not found during cleanup; normal for sessions that never streamed"
            );
        }
    }

    pub fn attach_session_to_source(
        &self,
        session_id: &str,
        source_id: &str,
    ) -> Result<(), StateError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StateError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        let previous = session.source_id.replace(source_id.to_string());
        drop(sessions);

        if let Some(previous) = previous.filter(|p| p != source_id) {
            self.emit(StateChange::Detached {
                session_id: session_id.to_string(),
                source_id: previous,
            });
        }
        self.emit(StateChange::Attached {
            session_id: session_id.to_string(),
            source_id: source_id.to_string(),
        });
        Ok(())
    }

    pub fn detach(&self, session_id: &str) -> Result<(), StateError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StateError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        let source_id = session.source_id.take();
        drop(sessions);

        if let Some(source_id) = source_id {
            self.emit(StateChange::Detached {
                session_id: session_id.to_string(),
                source_id,
            });
        }
        Ok(())
    }

    /// Apply a partial update to one VFO. Enforces the
    /// single-selected-per-session invariant and validates the
    /// mode/decoder combination before anything is mutated.
    pub fn configure_vfo(
        &self,
        session_id: &str,
        vfo: u8,
        patch: VfoPatch,
    ) -> Result<VfoState, ConfigError> {
        if !(1..=VFO_COUNT).contains(&vfo) {
            return Err(ConfigError::InvalidVfoNumber { vfo });
        }
        if let Some(volume) = patch.volume {
            if volume > 100 {
                return Err(ConfigError::InvalidVolume { volume });
            }
        }

        let mut sessions = self.sessions.write();
        let session = match sessions.get_mut(session_id) {
            Some(session) => session,
            None => {
                // Unknown sessions are created lazily; a VFO tweak can
                // legitimately arrive before streaming starts.
                sessions.insert(
                    session_id.to_string(),
                    Session::new(session_id.to_string(), SessionMetadata::default(), false),
                );
                self.emit(StateChange::SessionCreated {
                    session_id: session_id.to_string(),
                });
                sessions.get_mut(session_id).expect("just inserted")
            }
        };

        let idx = (vfo - 1) as usize;
        let previous = session.vfos[idx].clone();
        let mut next = previous.clone();

        if let Some(v) = patch.center_freq {
            next.center_freq = v;
        }
        if let Some(v) = patch.bandwidth {
            next.bandwidth = v;
        }
        if let Some(v) = patch.modulation {
            next.modulation = v;
        }
        if let Some(v) = patch.decoder {
            next.decoder = v;
        }
        if let Some(v) = patch.active {
            next.active = v;
        }
        if let Some(v) = patch.volume {
            next.volume = v;
        }
        if let Some(v) = patch.squelch_dbfs {
            next.squelch_dbfs = v;
        }
        if let Some(v) = patch.transcription {
            next.transcription = v;
        }
        if let Some(v) = patch.locked_transmitter_id {
            next.locked_transmitter_id = v;
        }

        // Morse rides on the demodulated CW/SSB audio path; pairing it
        // with anything else leaves it deaf.
        if next.decoder == DecoderKind::Morse && next.active && !next.modulation.is_ssb() {
            return Err(ConfigError::IncompatibleDecoder {
                decoder: next.decoder.as_str(),
                modulation: next.modulation.as_str(),
            });
        }

        if let Some(selected) = patch.selected {
            next.selected = selected;
            if selected {
                for (i, other) in session.vfos.iter_mut().enumerate() {
                    if i != idx {
                        other.selected = false;
                    }
                }
            }
        }

        session.vfos[idx] = next.clone();
        drop(sessions);

        if next != previous {
            self.emit(StateChange::VfoChanged {
                session_id: session_id.to_string(),
                vfo,
                previous,
                current: next.clone(),
            });
        }
        Ok(next)
    }

    pub fn get_vfo(&self, session_id: &str, vfo: u8) -> Option<VfoState> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(|session| session.vfo(vfo))
            .cloned()
    }

    pub fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn source_for_session(&self, session_id: &str) -> Option<String> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(|session| session.source_id.clone())
    }

    /// All sessions attached to a source.
    pub fn sessions_for_source(&self, source_id: &str) -> Vec<String> {
        self.sessions
            .read()
            .values()
            .filter(|session| session.source_id.as_deref() == Some(source_id))
            .map(|session| session.id.clone())
            .collect()
    }

    /// Every (session, vfo, state) triple attached to a source.
    pub fn list_vfos_for_source(&self, source_id: &str) -> Vec<(String, u8, VfoState)> {
        let sessions = self.sessions.read();
        let mut result = Vec::new();
        for session in sessions.values() {
            if session.source_id.as_deref() != Some(source_id) {
                continue;
            }
            for (idx, vfo) in session.vfos.iter().enumerate() {
                result.push((session.id.clone(), idx as u8 + 1, vfo.clone()));
            }
        }
        result
    }

    /// Register a synthetic session for an automated observation.
    /// Internal sessions surface alongside user sessions but never
    /// receive UI events.
    pub fn register_internal_session(
        &self,
        observation_id: &str,
        source_id: &str,
        vfo: u8,
        metadata: SessionMetadata,
    ) -> Result<String, ConfigError> {
        if !(1..=VFO_COUNT).contains(&vfo) {
            return Err(ConfigError::InvalidVfoNumber { vfo });
        }
        let session_id = internal_session_id(observation_id);
        {
            let mut sessions = self.sessions.write();
            let mut metadata = metadata;
            if metadata.user_agent.is_none() {
                metadata.user_agent = Some(format!("ObservationScheduler/{observation_id}"));
            }
            if metadata.connected_at.is_none() {
                metadata.connected_at = Some(Utc::now());
            }
            sessions.insert(
                session_id.clone(),
                Session::new(session_id.clone(), metadata, true),
            );
        }
        self.emit(StateChange::SessionCreated {
            session_id: session_id.clone(),
        });
        self.attach_session_to_source(&session_id, source_id)
            .expect("internal session just inserted");
        info!(session = %session_id, observation = observation_id, "registered internal session");
        Ok(session_id)
    }

    pub fn cleanup_internal_session(&self, observation_id: &str) -> Result<(), StateError> {
        let session_id = internal_session_id(observation_id);
        if self.sessions.read().contains_key(&session_id) {
            self.remove_session(&session_id);
            Ok(())
        } else {
            Err(StateError::UnknownObservation {
                observation_id: observation_id.to_string(),
            })
        }
    }

    pub fn is_internal_session(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .get(session_id)
            .map(|session| session.internal)
            .unwrap_or(false)
    }

    /// A consistent snapshot of all sessions.
    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }
}

pub fn internal_session_id(observation_id: &str) -> String {
    format!("internal:{observation_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> (SessionTracker, Receiver<StateChange>) {
        SessionTracker::new()
    }

    #[test]
    fn test_single_selected_per_session() {
        let (tracker, _rx) = tracker();
        tracker.create_session("s1", SessionMetadata::default());
        tracker
            .configure_vfo(
                "s1",
                1,
                VfoPatch {
                    selected: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        tracker
            .configure_vfo(
                "s1",
                3,
                VfoPatch {
                    selected: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();

        let session = tracker.get_session("s1").unwrap();
        let selected: Vec<u8> = (1..=VFO_COUNT)
            .filter(|&v| session.vfo(v).unwrap().selected)
            .collect();
        assert_eq!(selected, vec![3]);
    }

    #[test]
    fn test_invalid_vfo_number_rejected() {
        let (tracker, _rx) = tracker();
        assert!(matches!(
            tracker.configure_vfo("s1", 5, VfoPatch::default()),
            Err(ConfigError::InvalidVfoNumber { vfo: 5 })
        ));
        assert!(matches!(
            tracker.configure_vfo("s1", 0, VfoPatch::default()),
            Err(ConfigError::InvalidVfoNumber { vfo: 0 })
        ));
    }

    #[test]
    fn test_morse_requires_ssb_mode() {
        let (tracker, _rx) = tracker();
        let result = tracker.configure_vfo(
            "s1",
            1,
            VfoPatch {
                active: Some(true),
                modulation: Some(Modulation::Fm),
                decoder: Some(DecoderKind::Morse),
                ..Default::default()
            },
        );
        assert!(matches!(
            result,
            Err(ConfigError::IncompatibleDecoder { .. })
        ));

        assert!(tracker
            .configure_vfo(
                "s1",
                1,
                VfoPatch {
                    active: Some(true),
                    modulation: Some(Modulation::Cw),
                    decoder: Some(DecoderKind::Morse),
                    ..Default::default()
                },
            )
            .is_ok());
    }

    #[test]
    fn test_vfo_change_emits_diff() {
        let (tracker, rx) = tracker();
        tracker.create_session("s1", SessionMetadata::default());
        let _ = rx.try_recv(); // SessionCreated

        tracker
            .configure_vfo(
                "s1",
                2,
                VfoPatch {
                    center_freq: Some(100_100_000),
                    active: Some(true),
                    modulation: Some(Modulation::Fm),
                    ..Default::default()
                },
            )
            .unwrap();

        match rx.try_recv().unwrap() {
            StateChange::VfoChanged {
                session_id,
                vfo,
                previous,
                current,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(vfo, 2);
                assert!(!previous.active);
                assert!(current.active);
                assert_eq!(current.center_freq, 100_100_000);
            }
            other => panic!("unexpected change {other:?}"),
        }
    }

    #[test]
    fn test_noop_patch_emits_nothing() {
        let (tracker, rx) = tracker();
        tracker.create_session("s1", SessionMetadata::default());
        let _ = rx.try_recv();
        tracker.configure_vfo("s1", 1, VfoPatch::default()).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_attach_detach_refcounting_view() {
        let (tracker, _rx) = tracker();
        tracker.create_session("a", SessionMetadata::default());
        tracker.create_session("b", SessionMetadata::default());
        tracker.attach_session_to_source("a", "sdr-0").unwrap();
        tracker.attach_session_to_source("b", "sdr-0").unwrap();
        assert_eq!(tracker.sessions_for_source("sdr-0").len(), 2);

        tracker.detach("a").unwrap();
        assert_eq!(tracker.sessions_for_source("sdr-0"), vec!["b".to_string()]);
    }

    #[test]
    fn test_reattach_emits_detach_from_previous() {
        let (tracker, rx) = tracker();
        tracker.create_session("a", SessionMetadata::default());
        tracker.attach_session_to_source("a", "sdr-0").unwrap();
        while rx.try_recv().is_ok() {}

        tracker.attach_session_to_source("a", "sdr-1").unwrap();
        let mut saw_detach = false;
        let mut saw_attach = false;
        while let Ok(change) = rx.try_recv() {
            match change {
                StateChange::Detached { source_id, .. } => {
                    assert_eq!(source_id, "sdr-0");
                    saw_detach = true;
                }
                StateChange::Attached { source_id, .. } => {
                    assert_eq!(source_id, "sdr-1");
                    saw_attach = true;
                }
                _ => {}
            }
        }
        assert!(saw_detach && saw_attach);
    }

    #[test]
    fn test_internal_session_lifecycle() {
        let (tracker, _rx) = tracker();
        let session_id = tracker
            .register_internal_session("obs-42", "sdr-0", 1, SessionMetadata::default())
            .unwrap();
        assert_eq!(session_id, "internal:obs-42");
        assert!(tracker.is_internal_session(&session_id));
        assert_eq!(tracker.sessions_for_source("sdr-0"), vec![session_id]);

        tracker.cleanup_internal_session("obs-42").unwrap();
        assert!(tracker.get_session("internal:obs-42").is_none());
        assert!(tracker.cleanup_internal_session("obs-42").is_err());
    }

    #[test]
    fn test_session_removal_reports_source() {
        let (tracker, rx) = tracker();
        tracker.create_session("a", SessionMetadata::default());
        tracker.attach_session_to_source("a", "sdr-0").unwrap();
        while rx.try_recv().is_ok() {}

        tracker.remove_session("a");
        match rx.try_recv().unwrap() {
            StateChange::SessionRemoved { source_id, .. } => {
                assert_eq!(source_id.as_deref(), Some("sdr-0"));
            }
            other => panic!("unexpected change {other:?}"),
        }
    }
}
