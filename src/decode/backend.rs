//! Codec seam: the `DecodeBackend` trait and the built-in reference decoder.
//!
//! **Why**: engines drive decoding purely through this trait, so the same
//! state machine serves the pure-Rust reference decoder and the optional
//! FFmpeg backend. Backends are stateful (GOP context lives inside) and
//! single-threaded; the orchestrator gives each engine its own instance.

use log::trace;

use crate::demux::{Codec, CompressedSample, MediaInfo};
use crate::frame::Frame;

/// Decode errors
#[derive(Debug)]
pub enum DecodeError {
    /// No backend can handle this codec; fatal for the source
    CodecUnsupported(String),
    /// One sample failed to decode; the source stays usable
    DecodeFailed(String),
}

impl DecodeError {
    /// Fatal errors kill the source; transient ones skip the sample.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeError::CodecUnsupported(_))
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::CodecUnsupported(msg) => write!(f, "codec unsupported: {}", msg),
            DecodeError::DecodeFailed(msg) => write!(f, "decode failed: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A stateful decoder for one source.
///
/// `decode` may return `Ok(None)` when the codec buffers the sample without
/// emitting a picture yet (B-frame delay). `reset` drops all GOP context; the
/// next sample fed in must be a keyframe.
pub trait DecodeBackend: Send {
    fn configure(&mut self, info: &MediaInfo) -> Result<(), DecodeError>;
    fn decode(&mut self, sample: &CompressedSample) -> Result<Option<Frame>, DecodeError>;
    fn reset(&mut self);
    fn name(&self) -> &'static str;
}

/// Pure-Rust decoder for raw streams.
///
/// Keyframe payloads are whole RGBA frames; delta payloads are XORed against
/// the previously decoded frame, so feeding a delta without its keyframe is a
/// hard error rather than a silently wrong picture.
pub struct ReferenceDecoder {
    width: u32,
    height: u32,
    prev: Option<Vec<u8>>,
}

impl ReferenceDecoder {
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            prev: None,
        }
    }
}

impl Default for ReferenceDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeBackend for ReferenceDecoder {
    fn configure(&mut self, info: &MediaInfo) -> Result<(), DecodeError> {
        if info.codec != Codec::Raw {
            return Err(DecodeError::CodecUnsupported(format!(
                "reference decoder handles raw streams only, got {:?}",
                info.codec
            )));
        }
        self.width = info.width;
        self.height = info.height;
        self.prev = None;
        Ok(())
    }

    fn decode(&mut self, sample: &CompressedSample) -> Result<Option<Frame>, DecodeError> {
        // Widened before multiplying, large dimensions overflow u32
        let expected = self.width as u64 * self.height as u64 * 4;
        if sample.payload.len() as u64 != expected {
            return Err(DecodeError::DecodeFailed(format!(
                "payload {} bytes, frame needs {}",
                sample.payload.len(),
                expected
            )));
        }

        let pixels = if sample.keyframe {
            sample.payload.clone()
        } else {
            let prev = self.prev.as_ref().ok_or_else(|| {
                DecodeError::DecodeFailed("delta sample without a decoded keyframe".to_string())
            })?;
            sample
                .payload
                .iter()
                .zip(prev.iter())
                .map(|(d, p)| d ^ p)
                .collect()
        };

        trace!(
            "reference decode pts={}us keyframe={}",
            sample.pts_us, sample.keyframe
        );
        self.prev = Some(pixels.clone());
        let frame = Frame::from_rgba8(pixels, self.width as usize, self.height as usize)
            .map_err(|e| DecodeError::DecodeFailed(e.to_string()))?;
        Ok(Some(frame))
    }

    fn reset(&mut self) {
        self.prev = None;
    }

    fn name(&self) -> &'static str {
        "reference"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{probe, RvfWriter};

    fn two_frame_stream() -> MediaInfo {
        let mut w = RvfWriter::new(2, 2, 10.0);
        w.add_frame(&[100u8; 16], true).unwrap();
        w.add_frame(&[150u8; 16], false).unwrap();
        probe(&w.finish()).unwrap()
    }

    #[test]
    fn test_keyframe_then_delta() {
        let info = two_frame_stream();
        let mut dec = ReferenceDecoder::new();
        dec.configure(&info).unwrap();

        let kf = dec.decode(&info.samples[0]).unwrap().unwrap();
        assert!(kf.pixels().iter().all(|&b| b == 100));
        let delta = dec.decode(&info.samples[1]).unwrap().unwrap();
        assert!(delta.pixels().iter().all(|&b| b == 150));
    }

    #[test]
    fn test_delta_without_keyframe_fails() {
        let info = two_frame_stream();
        let mut dec = ReferenceDecoder::new();
        dec.configure(&info).unwrap();
        let err = dec.decode(&info.samples[1]).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_reset_drops_gop_context() {
        let info = two_frame_stream();
        let mut dec = ReferenceDecoder::new();
        dec.configure(&info).unwrap();
        dec.decode(&info.samples[0]).unwrap();
        dec.reset();
        assert!(dec.decode(&info.samples[1]).is_err());
    }

    /// 65535x65535 configured dimensions must produce a decode error for a
    /// short payload, not an arithmetic panic.
    #[test]
    fn test_oversized_dimensions_fail_cleanly() {
        let mut info = two_frame_stream();
        info.width = 65_535;
        info.height = 65_535;
        let mut dec = ReferenceDecoder::new();
        dec.configure(&info).unwrap();
        let err = dec.decode(&info.samples[0]).unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_wrong_codec_is_fatal() {
        let mut info = two_frame_stream();
        info.codec = crate::demux::Codec::H264;
        let mut dec = ReferenceDecoder::new();
        let err = dec.configure(&info).unwrap_err();
        assert!(err.is_fatal());
    }
}
