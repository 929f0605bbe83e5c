//! PLAYHEAD - Real-time multi-track timeline preview engine
//!
//! Containers in, composited frames and mixed audio out. The `Engine` is the
//! embedder-facing surface; everything below it (demux, threaded decode,
//! caching, compositing, mixing) is public for tooling and tests.

// Decode pipeline (backends, state machine, orchestrator)
pub mod decode;

// Engine modules
pub mod audio;
pub mod cache;
pub mod cache_man;
pub mod capability;
pub mod cli;
pub mod clock;
pub mod compositor;
pub mod demux;
pub mod engine;
pub mod frame;
pub mod text;
pub mod timeline;

// Re-export commonly used types
pub use cache::{CacheSet, FrameCache};
pub use cache_man::CacheManager;
pub use compositor::{Compositor, CompositorLayer};
pub use decode::{DecodeEngine, Orchestrator, SourceEvent, SourceLocator, SourceRequest};
pub use engine::{Engine, EngineConfig, RenderOutput};
pub use frame::{Frame, FrameHandle};
pub use timeline::{ItemKind, TimelineItem, Transition, TransitionKind, Trim};
