//! Events emitted by the pipeline. Transport to browsers is external;
//! the core publishes one logical payload per event on a bounded bus.

use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::block::{AudioFrame, SpectrumFrame};

/// Source lifecycle notifications (C1 status channel).
#[derive(Debug, Clone)]
pub enum SourceEvent {
    StreamingStarted {
        source_id: String,
    },
    Error {
        source_id: String,
        message: String,
    },
    Terminated {
        source_id: String,
    },
    /// Periodic worker statistics, ~1 Hz.
    Stats {
        source_id: String,
        stats: SourceStats,
    },
}

/// Counters kept by a source worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub samples_read: u64,
    pub blocks_out: u64,
    pub read_errors: u64,
    pub queue_drops: u64,
    pub errors: u64,
}

/// Decoder status values, distinct from packet output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderStatus {
    Idle,
    Listening,
    Decoding,
    Error,
    Closed,
}

/// Transcription worker status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Connecting,
    Transcribing,
    Closed,
}

/// Typed error tags surfaced to the UI by transcription workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    QuotaExceeded,
    InvalidApiKey,
    RateLimit,
    NetworkError,
    UnknownError,
}

/// A decoded and persisted packet, with its full sidecar metadata.
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub decoder_type: &'static str,
    pub session_id: String,
    pub vfo: u8,
    pub packet_number: u64,
    pub payload: Vec<u8>,
    pub timestamp: f64,
    pub binary_path: String,
    pub metadata_path: String,
    /// The sidecar JSON document, verbatim.
    pub metadata: Value,
}

/// Everything the core emits. One logical payload per event.
#[derive(Debug, Clone)]
pub enum Event {
    Spectrum(SpectrumFrame),
    Audio(AudioFrame),
    PacketDecoded(PacketRecord),
    DecoderStatus {
        session_id: String,
        vfo: u8,
        decoder_type: &'static str,
        status: DecoderStatus,
    },
    /// Rate-limited decoded-text stream (Morse).
    DecoderText {
        session_id: String,
        vfo: u8,
        text: String,
        character_count: u64,
        wpm: Option<u32>,
    },
    Transcription {
        session_id: String,
        vfo: u8,
        text: String,
        language: String,
        is_final: bool,
        provider: &'static str,
        confidence: Option<f32>,
    },
    WorkerStatus {
        session_id: String,
        vfo: u8,
        provider: &'static str,
        status: WorkerStatus,
    },
    WorkerError {
        session_id: String,
        vfo: u8,
        provider: &'static str,
        kind: WorkerErrorKind,
        message: String,
        details: String,
    },
    Source(SourceEvent),
}

/// Bounded event bus shared by every worker. Real-time streams
/// (spectrum, audio) are dropped on overflow; packets block briefly
/// because they are rare and must not be lost to jitter.
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<Event>,
}

pub const EVENT_BUS_CAPACITY: usize = 1024;
const PACKET_SEND_TIMEOUT: Duration = Duration::from_millis(250);

impl EventBus {
    pub fn new() -> (Self, Receiver<Event>) {
        let (tx, rx) = bounded(EVENT_BUS_CAPACITY);
        (Self { tx }, rx)
    }

    /// Non-blocking publish for real-time streams. Returns false when
    /// the event was dropped because the bus was full.
    pub fn publish(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Bounded blocking publish for rare, must-not-drop events.
    pub fn publish_packet(&self, record: PacketRecord) -> bool {
        self.tx
            .send_timeout(Event::PacketDecoded(record), PACKET_SEND_TIMEOUT)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_drops_when_full() {
        let (bus, rx) = EventBus::new();
        for _ in 0..EVENT_BUS_CAPACITY {
            assert!(bus.publish(Event::Source(SourceEvent::Terminated {
                source_id: "s".into(),
            })));
        }
        assert!(!bus.publish(Event::Source(SourceEvent::Terminated {
            source_id: "s".into(),
        })));
        drop(rx);
    }

    #[test]
    fn test_publish_after_receiver_drop_is_not_an_error() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        assert!(!bus.publish(Event::Source(SourceEvent::StreamingStarted {
            source_id: "s".into(),
        })));
    }
}
