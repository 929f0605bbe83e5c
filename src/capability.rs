//! Capability detection and the pipeline fallback ladder.
//!
//! **Why**: the engine's public contract never changes, but the machinery
//! behind it does: plenty of cores and a native codec backend get one decode
//! thread per source, constrained hosts share a single decode thread, and
//! when no codec backend exists at all the baseline tier still plays raw
//! streams. Detection runs once at startup and the chosen strategy is fixed
//! for the process lifetime; mid-session renegotiation is not worth the
//! state invalidation it would cause.
//!
//! **Used by**: Engine construction.

use once_cell::sync::Lazy;

use log::info;

use crate::decode::backend::ReferenceDecoder;
use crate::decode::orchestrator::{BackendFactory, OrchestratorConfig};
use crate::decode::DecodeTuning;
use std::sync::Arc;

/// What this host can do, probed once.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Native codec backend compiled in.
    pub hardware_decode: bool,
    /// Enough cores to give each source its own decode thread.
    pub parallel_contexts: bool,
    /// A GPU-backed output surface is plausibly available. Compositing stays
    /// on the CPU; embedders use this to pick their present path.
    pub gpu_surface: bool,
    pub cpu_count: usize,
}

static DETECTED: Lazy<Capabilities> = Lazy::new(|| {
    let cpu_count = num_cpus::get();
    let caps = Capabilities {
        hardware_decode: cfg!(feature = "ffmpeg"),
        parallel_contexts: cpu_count >= 4,
        gpu_surface: probe_gpu_surface(),
        cpu_count,
    };
    info!(
        "capabilities: hardware_decode={} parallel_contexts={} gpu_surface={} cpus={}",
        caps.hardware_decode, caps.parallel_contexts, caps.gpu_surface, caps.cpu_count
    );
    caps
});

/// Headless Linux hosts have no display server, so no surface to present to.
fn probe_gpu_surface() -> bool {
    if cfg!(target_os = "linux") {
        std::env::var_os("DISPLAY").is_some() || std::env::var_os("WAYLAND_DISPLAY").is_some()
    } else {
        true
    }
}

impl Capabilities {
    /// Probe the host. Cached; every call returns the same answer.
    pub fn detect() -> Capabilities {
        *DETECTED
    }
}

/// Decode tier selected from capabilities, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Parallel,
    SingleContext,
    Baseline,
}

/// How a tier shapes the decode pipeline.
pub trait PipelineStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    /// One decode thread per source, or one shared thread.
    fn dedicated_thread_per_source(&self) -> bool;
    fn make_backend_factory(&self) -> BackendFactory;

    fn orchestrator_config(&self, tuning: DecodeTuning) -> OrchestratorConfig {
        OrchestratorConfig {
            dedicated_threads: self.dedicated_thread_per_source(),
            backend_factory: self.make_backend_factory(),
            tuning,
        }
    }
}

struct Parallel;
struct SingleContext;
struct Baseline;

fn native_backend_factory() -> BackendFactory {
    #[cfg(feature = "ffmpeg")]
    {
        Arc::new(|| Box::new(crate::decode::ffmpeg::FfmpegDecoder::new()))
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        Arc::new(|| Box::new(ReferenceDecoder::new()))
    }
}

impl PipelineStrategy for Parallel {
    fn name(&self) -> &'static str {
        "parallel"
    }
    fn dedicated_thread_per_source(&self) -> bool {
        true
    }
    fn make_backend_factory(&self) -> BackendFactory {
        native_backend_factory()
    }
}

impl PipelineStrategy for SingleContext {
    fn name(&self) -> &'static str {
        "single-context"
    }
    fn dedicated_thread_per_source(&self) -> bool {
        false
    }
    fn make_backend_factory(&self) -> BackendFactory {
        native_backend_factory()
    }
}

impl PipelineStrategy for Baseline {
    fn name(&self) -> &'static str {
        "baseline"
    }
    fn dedicated_thread_per_source(&self) -> bool {
        false
    }
    fn make_backend_factory(&self) -> BackendFactory {
        Arc::new(|| Box::new(ReferenceDecoder::new()))
    }
}

/// Pick exactly one strategy for the given capabilities.
pub fn select_strategy(caps: Capabilities) -> Box<dyn PipelineStrategy> {
    let strategy: Box<dyn PipelineStrategy> = match tier_for(caps) {
        Tier::Parallel => Box::new(Parallel),
        Tier::SingleContext => Box::new(SingleContext),
        Tier::Baseline => Box::new(Baseline),
    };
    info!("pipeline strategy: {}", strategy.name());
    strategy
}

/// Explicit tier override, used when a higher tier failed outright.
pub fn strategy_for_tier(tier: Tier) -> Box<dyn PipelineStrategy> {
    match tier {
        Tier::Parallel => Box::new(Parallel),
        Tier::SingleContext => Box::new(SingleContext),
        Tier::Baseline => Box::new(Baseline),
    }
}

fn tier_for(caps: Capabilities) -> Tier {
    if caps.hardware_decode && caps.parallel_contexts {
        Tier::Parallel
    } else if caps.hardware_decode {
        Tier::SingleContext
    } else {
        Tier::Baseline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_is_stable() {
        let a = Capabilities::detect();
        let b = Capabilities::detect();
        assert_eq!(a.cpu_count, b.cpu_count);
        assert_eq!(a.hardware_decode, b.hardware_decode);
    }

    #[test]
    fn test_tier_ladder() {
        let full = Capabilities {
            hardware_decode: true,
            parallel_contexts: true,
            gpu_surface: true,
            cpu_count: 8,
        };
        assert_eq!(tier_for(full), Tier::Parallel);

        let constrained = Capabilities {
            hardware_decode: true,
            parallel_contexts: false,
            gpu_surface: false,
            cpu_count: 2,
        };
        assert_eq!(tier_for(constrained), Tier::SingleContext);

        let bare = Capabilities {
            hardware_decode: false,
            parallel_contexts: true,
            gpu_surface: true,
            cpu_count: 8,
        };
        assert_eq!(tier_for(bare), Tier::Baseline);
    }

    /// The decode tier is about codec and threading resources; surface
    /// availability must not move a host up or down the ladder.
    #[test]
    fn test_tier_ignores_surface_flag() {
        let mut caps = Capabilities {
            hardware_decode: false,
            parallel_contexts: true,
            gpu_surface: true,
            cpu_count: 8,
        };
        let with_surface = tier_for(caps);
        caps.gpu_surface = false;
        assert_eq!(tier_for(caps), with_surface);
    }

    #[test]
    fn test_strategy_threading_mode() {
        assert!(strategy_for_tier(Tier::Parallel).dedicated_thread_per_source());
        assert!(!strategy_for_tier(Tier::SingleContext).dedicated_thread_per_source());
        assert!(!strategy_for_tier(Tier::Baseline).dedicated_thread_per_source());
    }

    #[test]
    fn test_baseline_backend_decodes_raw() {
        use crate::demux::{probe, RvfWriter};
        let strategy = strategy_for_tier(Tier::Baseline);
        let mut backend = (strategy.make_backend_factory())();
        let mut w = RvfWriter::new(2, 2, 10.0);
        w.add_frame(&[7u8; 16], true).unwrap();
        let info = probe(&w.finish()).unwrap();
        backend.configure(&info).unwrap();
        let frame = backend.decode(&info.samples[0]).unwrap().unwrap();
        assert_eq!(frame.resolution(), (2, 2));
    }
}
