//! Per-source frame decoding: codec backends, the decode state machine, and
//! the orchestrator that owns the decode threads.

pub mod backend;
pub mod engine;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod orchestrator;

pub use backend::{DecodeBackend, DecodeError, ReferenceDecoder};
pub use engine::{DecodeEngine, DecodeTuning, EngineState};
pub use orchestrator::{Orchestrator, SourceEvent, SourceLocator, SourceRequest};
