//! Container demuxing: raw bytes in, ordered compressed samples out.
//!
//! **Why**: decode backends want one flat description of the primary video
//! track. The demuxer is a pure parse, it owns no threads and touches no
//! global state, so it can run on any decode thread (or in tests) without
//! ceremony.
//!
//! **Used by**: decode engines (`load`), the probe binary.
//!
//! Timestamps are normalized from the container's native timescale to
//! microseconds at parse time so nothing downstream ever sees a timescale.

mod mp4;
mod rvf;

pub use rvf::{RvfWriter, RVF_MAGIC};

use serde::Serialize;

/// Demux errors
#[derive(Debug)]
pub enum DemuxError {
    /// Container format not recognized or holds no decodable video track
    UnsupportedContainer(String),
    /// Recognized container with structurally invalid contents
    MalformedContainer(String),
}

impl std::fmt::Display for DemuxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DemuxError::UnsupportedContainer(msg) => {
                write!(f, "unsupported container: {}", msg)
            }
            DemuxError::MalformedContainer(msg) => {
                write!(f, "malformed container: {}", msg)
            }
        }
    }
}

impl std::error::Error for DemuxError {}

/// Codec of the primary video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    Hevc,
    /// The crate's raw reference format (full/XOR-delta RGBA payloads).
    Raw,
}

/// One encoded sample from the container, in decode order.
///
/// `payload` bytes are carried exactly as stored, the demuxer never
/// re-frames them.
#[derive(Debug, Clone)]
pub struct CompressedSample {
    pub pts_us: i64,
    pub duration_us: i64,
    pub keyframe: bool,
    pub payload: Vec<u8>,
}

/// Parsed description of the primary video track.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub duration_us: i64,
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub codec: Codec,
    /// Codec init data (avcC/hvcC for ISO BMFF, empty for raw).
    pub codec_config: Vec<u8>,
    /// Native timescale the timestamps were normalized from (units/second).
    pub timescale: u32,
    pub samples: Vec<CompressedSample>,
}

impl MediaInfo {
    /// Index of the nearest keyframe sample at or before `pts_us`.
    /// Falls back to the first keyframe when none precedes the target.
    pub fn keyframe_at_or_before(&self, pts_us: i64) -> Option<usize> {
        let mut best = None;
        let mut first = None;
        for (idx, s) in self.samples.iter().enumerate() {
            if s.keyframe {
                if first.is_none() {
                    first = Some(idx);
                }
                if s.pts_us <= pts_us {
                    best = Some(idx);
                } else {
                    break;
                }
            }
        }
        best.or(first)
    }

    /// Index of the sample whose interval contains `pts_us` (last sample for
    /// times past the end).
    pub fn sample_at(&self, pts_us: i64) -> Option<usize> {
        if self.samples.is_empty() {
            return None;
        }
        let mut idx = 0;
        for (i, s) in self.samples.iter().enumerate() {
            if s.pts_us <= pts_us {
                idx = i;
            } else {
                break;
            }
        }
        Some(idx)
    }
}

/// Parse a container from raw bytes. Dispatches on magic.
pub fn probe(bytes: &[u8]) -> Result<MediaInfo, DemuxError> {
    if bytes.len() >= 4 && &bytes[0..4] == RVF_MAGIC {
        return rvf::parse(bytes);
    }
    // ISO BMFF starts with a box whose type sits at offset 4
    if bytes.len() >= 8 && matches!(&bytes[4..8], b"ftyp" | b"moov" | b"mdat" | b"wide" | b"free") {
        return mp4::parse(bytes);
    }
    Err(DemuxError::UnsupportedContainer(
        "no known container magic".into(),
    ))
}
