//! Per-source decode state machine.
//!
//! **Why**: each media source moves through a fixed lifecycle
//! (`Idle -> Loading -> Ready -> {Decoding, Seeking} -> Destroyed`, with
//! `Error` reachable from any non-terminal state), and all decode scheduling
//! decisions live here: whether a target time can be reached by decoding
//! forward from the last decoded sample, or needs a keyframe-anchored random
//! access with a backend reset.
//!
//! **Used by**: Orchestrator (one engine per source, driven on a decode
//! thread).

use log::{debug, info, warn};

use super::backend::{DecodeBackend, DecodeError};
use crate::demux::{self, DemuxError, MediaInfo};
use crate::frame::Frame;

/// Lifecycle of one decode engine. `Destroyed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Loading,
    Ready,
    Decoding,
    Seeking,
    Error,
    Destroyed,
}

impl EngineState {
    pub fn is_terminal(self) -> bool {
        self == EngineState::Destroyed
    }
}

/// Decode scheduling tunables. Defaults are the values that keep scrubbing
/// responsive without flooding the cache.
#[derive(Debug, Clone, Copy)]
pub struct DecodeTuning {
    /// How far past the target to decode ahead (microseconds).
    pub buffer_ahead_us: i64,
    /// Extra slack behind the buffering window before a backward target
    /// forces a keyframe re-anchor.
    pub backward_tolerance_us: i64,
    /// Hard cap on samples decoded per request.
    pub max_batch: usize,
}

impl Default for DecodeTuning {
    fn default() -> Self {
        Self {
            buffer_ahead_us: 2_000_000,
            backward_tolerance_us: 100_000,
            max_batch: 60,
        }
    }
}

/// Engine errors
#[derive(Debug)]
pub enum EngineError {
    /// Operation requires a loaded source
    NotLoaded,
    /// Engine already destroyed
    Destroyed,
    /// Stream has no keyframe to anchor decoding on
    NoKeyframeFound,
    Demux(DemuxError),
    Decode(DecodeError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotLoaded => write!(f, "no source loaded"),
            EngineError::Destroyed => write!(f, "engine destroyed"),
            EngineError::NoKeyframeFound => write!(f, "stream has no keyframe"),
            EngineError::Demux(e) => write!(f, "demux: {}", e),
            EngineError::Decode(e) => write!(f, "decode: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<DemuxError> for EngineError {
    fn from(e: DemuxError) -> Self {
        EngineError::Demux(e)
    }
}

impl From<DecodeError> for EngineError {
    fn from(e: DecodeError) -> Self {
        EngineError::Decode(e)
    }
}

/// One source's demuxed samples plus its stateful decoder.
pub struct DecodeEngine {
    state: EngineState,
    info: Option<MediaInfo>,
    backend: Box<dyn DecodeBackend>,
    tuning: DecodeTuning,
    /// Index and pts of the last sample fed to the backend, decode order.
    last_decoded: Option<(usize, i64)>,
}

impl DecodeEngine {
    pub fn new(backend: Box<dyn DecodeBackend>, tuning: DecodeTuning) -> Self {
        Self {
            state: EngineState::Idle,
            info: None,
            backend,
            tuning,
            last_decoded: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn info(&self) -> Option<&MediaInfo> {
        self.info.as_ref()
    }

    /// Demux the container, configure the backend and decode the first
    /// keyframe so a preview frame exists the moment the engine is `Ready`.
    pub fn load(&mut self, bytes: &[u8]) -> Result<(i64, Frame), EngineError> {
        self.check_alive()?;
        self.state = EngineState::Loading;

        let info = demux::probe(bytes).inspect_err(|_| self.state = EngineState::Error)?;
        self.backend.configure(&info).inspect_err(|_| {
            self.state = EngineState::Error;
        })?;
        info!(
            "loaded source: {}x{} {:.2}fps, {} samples, backend={}",
            info.width,
            info.height,
            info.frame_rate,
            info.samples.len(),
            self.backend.name()
        );

        let first_kf = info
            .keyframe_at_or_before(0)
            .ok_or(EngineError::NoKeyframeFound)
            .inspect_err(|_| self.state = EngineState::Error)?;
        let sample = &info.samples[first_kf];
        let preview = match self.backend.decode(sample) {
            Ok(Some(frame)) => frame,
            Ok(None) => Frame::solid(info.width as usize, info.height as usize, [0, 0, 0, 255]),
            Err(e) => {
                self.state = EngineState::Error;
                return Err(e.into());
            }
        };
        let pts = sample.pts_us;
        self.last_decoded = Some((first_kf, pts));
        self.info = Some(info);
        self.state = EngineState::Ready;
        Ok((pts, preview))
    }

    /// Decode so that `target_us` and the look-ahead window are covered.
    ///
    /// Each request decodes through `target + buffer_ahead`, so the decode
    /// frontier runs ahead of the playhead. A target at or behind the
    /// frontier, within the buffering window (plus backward tolerance), is
    /// already covered and decodes nothing. A target ahead of the frontier
    /// by at most `buffer_ahead` continues forward from the last decoded
    /// sample. Anything else is random access from the nearest keyframe at
    /// or before the target (first keyframe when none precedes it). Returns
    /// the newly decoded frames in pts order.
    pub fn decode_to(&mut self, target_us: i64) -> Result<Vec<(i64, Frame)>, EngineError> {
        self.check_alive()?;
        let info = self.info.as_ref().ok_or(EngineError::NotLoaded)?;

        let window_us = self.tuning.buffer_ahead_us + self.tuning.backward_tolerance_us;
        let start_idx = match self.last_decoded {
            // Frontier already past the target, and the target still inside
            // the buffering window behind it
            Some((_, last_pts))
                if target_us <= last_pts && target_us >= last_pts - window_us =>
            {
                self.state = EngineState::Ready;
                debug!(
                    "decode_to {}us: already covered (frontier={}us)",
                    target_us, last_pts
                );
                return Ok(Vec::new());
            }
            // Forward within the look-ahead: pick up after the frontier
            Some((idx, last_pts))
                if target_us > last_pts
                    && target_us <= last_pts + self.tuning.buffer_ahead_us =>
            {
                self.state = EngineState::Decoding;
                idx + 1
            }
            _ => {
                self.state = EngineState::Seeking;
                let anchor = info
                    .keyframe_at_or_before(target_us)
                    .ok_or(EngineError::NoKeyframeFound)
                    .inspect_err(|_| self.state = EngineState::Error)?;
                debug!(
                    "random access to {}us from keyframe idx={} pts={}us",
                    target_us, anchor, info.samples[anchor].pts_us
                );
                self.backend.reset();
                self.last_decoded = None;
                anchor
            }
        };

        let stop_pts = target_us.saturating_add(self.tuning.buffer_ahead_us);
        let mut out = Vec::new();
        let mut idx = start_idx;
        let info = match self.info.as_ref() {
            Some(info) => info,
            None => return Err(EngineError::NotLoaded),
        };
        while idx < info.samples.len() && out.len() < self.tuning.max_batch {
            let sample = &info.samples[idx];
            if sample.pts_us > stop_pts {
                break;
            }
            match self.backend.decode(sample) {
                Ok(Some(frame)) => out.push((sample.pts_us, frame)),
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    self.state = EngineState::Error;
                    return Err(e.into());
                }
                Err(e) => {
                    // Transient: skip this sample, keep the batch going
                    warn!("sample pts={}us skipped: {}", sample.pts_us, e);
                }
            }
            self.last_decoded = Some((idx, sample.pts_us));
            idx += 1;
        }

        self.state = EngineState::Ready;
        Ok(out)
    }

    /// Drop GOP context but keep the loaded source. The next `decode_to`
    /// re-anchors at a keyframe.
    pub fn reset(&mut self) -> Result<(), EngineError> {
        self.check_alive()?;
        self.backend.reset();
        self.last_decoded = None;
        if self.info.is_some() {
            self.state = EngineState::Ready;
        }
        Ok(())
    }

    /// Drop decoder context and samples. Terminal.
    pub fn destroy(&mut self) {
        self.backend.reset();
        self.info = None;
        self.last_decoded = None;
        self.state = EngineState::Destroyed;
    }

    fn check_alive(&self) -> Result<(), EngineError> {
        if self.state == EngineState::Destroyed {
            return Err(EngineError::Destroyed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::backend::ReferenceDecoder;
    use crate::demux::RvfWriter;

    /// 10 s stream at 5 fps with a keyframe every 2 s (GOP = 10 samples).
    fn ten_second_stream() -> Vec<u8> {
        let mut w = RvfWriter::new(4, 4, 5.0);
        for i in 0..50u32 {
            let shade = (i * 5) as u8;
            w.add_frame(&vec![shade; 4 * 4 * 4], i % 10 == 0).unwrap();
        }
        w.finish()
    }

    fn engine() -> DecodeEngine {
        DecodeEngine::new(Box::new(ReferenceDecoder::new()), DecodeTuning::default())
    }

    #[test]
    fn test_load_yields_preview() {
        let mut eng = engine();
        assert_eq!(eng.state(), EngineState::Idle);
        let (pts, preview) = eng.load(&ten_second_stream()).unwrap();
        assert_eq!(pts, 0);
        assert_eq!(preview.resolution(), (4, 4));
        assert_eq!(eng.state(), EngineState::Ready);
    }

    /// Random access to 7.3 s must anchor at the 6.0 s keyframe and decode
    /// through the look-ahead window (up to 9.3 s).
    #[test]
    fn test_seek_anchors_at_keyframe() {
        let mut eng = engine();
        eng.load(&ten_second_stream()).unwrap();

        let frames = eng.decode_to(7_300_000).unwrap();
        let first = frames.first().map(|(pts, _)| *pts).unwrap();
        let last = frames.last().map(|(pts, _)| *pts).unwrap();
        assert_eq!(first, 6_000_000);
        assert!(last >= 7_300_000);
        assert!(last <= 9_300_000);
        // All pts ascending
        assert!(frames.windows(2).all(|w| w[0].0 < w[1].0));
    }

    /// A later seek back to 1.0 s must redecode from the 0 s keyframe, not
    /// reuse decoder state from the 7.3 s position.
    #[test]
    fn test_backward_seek_redecodes_from_anchor() {
        let mut eng = engine();
        eng.load(&ten_second_stream()).unwrap();
        eng.decode_to(7_300_000).unwrap();

        let frames = eng.decode_to(1_000_000).unwrap();
        assert_eq!(frames.first().map(|(pts, _)| *pts), Some(0));
        // Shade of the frame at 1.0 s (sample 5) proves a clean GOP decode
        let at_1s = frames.iter().find(|(pts, _)| *pts == 1_000_000).unwrap();
        assert!(at_1s.1.pixels().iter().all(|&b| b == 25));
    }

    /// Decoding to the same target twice is idempotent: the second call has
    /// nothing new to produce.
    #[test]
    fn test_decode_to_idempotent() {
        let mut eng = engine();
        eng.load(&ten_second_stream()).unwrap();
        let first = eng.decode_to(3_000_000).unwrap();
        assert!(!first.is_empty());
        let second = eng.decode_to(3_000_000).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_continuous_advance_does_not_reanchor() {
        let mut eng = engine();
        eng.load(&ten_second_stream()).unwrap();
        eng.decode_to(1_000_000).unwrap();
        // 1.0 -> 1.4 s is inside the look-ahead, decode picks up after the
        // last decoded sample instead of re-anchoring at 0 s
        let frames = eng.decode_to(1_400_000).unwrap();
        if let Some((first_pts, _)) = frames.first() {
            assert!(*first_pts > 1_000_000);
        }
    }

    /// During playback the playhead trails the decode frontier by up to the
    /// buffering window; trailing targets must not trigger a re-anchor.
    #[test]
    fn test_trailing_target_stays_covered() {
        let mut eng = engine();
        eng.load(&ten_second_stream()).unwrap();
        // Frontier lands at 5.0 s (3.0 s target + 2 s look-ahead)
        eng.decode_to(3_000_000).unwrap();

        assert!(eng.decode_to(4_000_000).unwrap().is_empty());
        assert!(eng.decode_to(4_900_000).unwrap().is_empty());

        // Past the frontier: continues forward, no keyframe re-anchor
        let frames = eng.decode_to(5_500_000).unwrap();
        assert_eq!(frames.first().map(|(pts, _)| *pts), Some(5_200_000));
    }

    #[test]
    fn test_batch_cap() {
        let tuning = DecodeTuning {
            buffer_ahead_us: 100_000_000,
            ..Default::default()
        };
        let mut eng = DecodeEngine::new(Box::new(ReferenceDecoder::new()), tuning);
        eng.load(&ten_second_stream()).unwrap();
        let frames = eng.decode_to(9_900_000).unwrap();
        assert!(frames.len() <= 60);
    }

    #[test]
    fn test_destroy_is_terminal() {
        let mut eng = engine();
        eng.load(&ten_second_stream()).unwrap();
        eng.destroy();
        assert_eq!(eng.state(), EngineState::Destroyed);
        assert!(matches!(eng.decode_to(0), Err(EngineError::Destroyed)));
        assert!(matches!(
            eng.load(&ten_second_stream()),
            Err(EngineError::Destroyed)
        ));
    }
}
