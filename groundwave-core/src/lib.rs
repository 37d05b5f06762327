//! Groundwave core library
//!
//! The real-time IQ pipeline of a multi-user ground-station receiver:
//! sample sources (hardware wire clients and SigMF playback) feed a
//! per-source broadcast fabric, which fans blocks out to spectrum
//! processing, per-VFO demodulators, protocol decoders and
//! transcription workers. Session/VFO state is the single source of
//! truth; the lifecycle manager reconciles running workers against it.

pub mod block;
pub mod config;
pub mod decode;
pub mod demod;
pub mod errors;
pub mod events;
pub mod fabric;
pub mod manager;
pub mod runtime;
pub mod session;
pub mod sigmf;
pub mod signal_processing;
pub mod source;
pub mod spectrum;
pub mod transcribe;

pub use block::{AudioFrame, IqBlock, SpectrumFrame};
pub use config::{
    ConfigPatch, DecoderKind, Modulation, SourceConfig, SourceDescriptor, SourceKind, Window,
};
pub use errors::{GroundwaveError, Result};
pub use events::{Event, EventBus};
pub use runtime::Runtime;
pub use session::{SessionTracker, VfoPatch, VfoState};
