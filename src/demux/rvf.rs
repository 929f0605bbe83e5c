//! RVF, the crate's raw video format.
//!
//! The baseline decode tier has no codec library, so it consumes this trivial
//! container: keyframe samples carry a whole RGBA8 frame, delta samples carry
//! the byte-wise XOR against the previous frame. Deltas are genuinely
//! undecodable without their keyframe, which makes GOP-dependent behavior
//! (keyframe-anchored seeking, decode order) observable without any external
//! codec. The writer exists for fixtures and the probe tool.
//!
//! Layout, little-endian:
//! `"RVF1" u16 width u16 height u32 fps_milli u32 sample_count` followed by
//! `sample_count` records of `u64 pts_us u32 duration_us u8 keyframe
//! u32 payload_len payload`.

use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use super::{Codec, CompressedSample, DemuxError, MediaInfo};

pub const RVF_MAGIC: &[u8; 4] = b"RVF1";

fn malformed(what: &str) -> DemuxError {
    DemuxError::MalformedContainer(what.to_string())
}

pub(super) fn parse(bytes: &[u8]) -> Result<MediaInfo, DemuxError> {
    let mut cur = Cursor::new(bytes);
    let mut magic = [0u8; 4];
    cur.read_exact(&mut magic)
        .map_err(|_| malformed("truncated header"))?;
    if &magic != RVF_MAGIC {
        return Err(DemuxError::UnsupportedContainer("bad magic".into()));
    }

    let width = cur
        .read_u16::<LittleEndian>()
        .map_err(|_| malformed("truncated header"))? as u32;
    let height = cur
        .read_u16::<LittleEndian>()
        .map_err(|_| malformed("truncated header"))? as u32;
    let fps_milli = cur
        .read_u32::<LittleEndian>()
        .map_err(|_| malformed("truncated header"))?;
    let sample_count = cur
        .read_u32::<LittleEndian>()
        .map_err(|_| malformed("truncated header"))?;
    if width == 0 || height == 0 {
        return Err(malformed("zero frame dimensions"));
    }

    // Widened before multiplying; 65535x65535x4 does not fit in u32
    let frame_bytes = width as u64 * height as u64 * 4;
    if frame_bytes > bytes.len() as u64 {
        return Err(malformed("frame size exceeds the container"));
    }
    let mut samples = Vec::with_capacity(sample_count as usize);
    let mut last_end = 0i64;
    for _ in 0..sample_count {
        let pts_us = cur
            .read_u64::<LittleEndian>()
            .map_err(|_| malformed("truncated sample header"))? as i64;
        let duration_us = cur
            .read_u32::<LittleEndian>()
            .map_err(|_| malformed("truncated sample header"))? as i64;
        let keyframe = cur
            .read_u8()
            .map_err(|_| malformed("truncated sample header"))?
            != 0;
        let payload_len = cur
            .read_u32::<LittleEndian>()
            .map_err(|_| malformed("truncated sample header"))? as usize;
        if payload_len as u64 != frame_bytes {
            return Err(malformed("payload length does not match frame size"));
        }
        let mut payload = vec![0u8; payload_len];
        cur.read_exact(&mut payload)
            .map_err(|_| malformed("truncated sample payload"))?;
        last_end = last_end.max(pts_us + duration_us);
        samples.push(CompressedSample {
            pts_us,
            duration_us,
            keyframe,
            payload,
        });
    }

    if samples.first().map(|s| !s.keyframe).unwrap_or(true) {
        return Err(malformed("stream must open with a keyframe"));
    }

    debug!(
        "rvf: {}x{} @{}mfps, {} samples",
        width,
        height,
        fps_milli,
        samples.len()
    );

    Ok(MediaInfo {
        duration_us: last_end,
        width,
        height,
        frame_rate: fps_milli as f64 / 1000.0,
        codec: Codec::Raw,
        codec_config: Vec::new(),
        timescale: 1_000_000,
        samples,
    })
}

/// Builds RVF streams frame by frame. XOR deltas are computed against the
/// previously added frame, so frames must be added in presentation order.
pub struct RvfWriter {
    width: u32,
    height: u32,
    fps_milli: u32,
    prev: Option<Vec<u8>>,
    records: Vec<u8>,
    count: u32,
}

impl RvfWriter {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps_milli: (fps * 1000.0).round() as u32,
            prev: None,
            records: Vec::new(),
            count: 0,
        }
    }

    fn frame_duration_us(&self) -> u32 {
        (1_000_000_000u64 / self.fps_milli.max(1) as u64) as u32
    }

    /// Append one RGBA8 frame. The first frame must be a keyframe.
    pub fn add_frame(&mut self, pixels: &[u8], keyframe: bool) -> Result<(), DemuxError> {
        let expected = self.width as u64 * self.height as u64 * 4;
        if pixels.len() as u64 != expected {
            return Err(malformed("frame buffer does not match writer dimensions"));
        }
        let keyframe = keyframe || self.prev.is_none();

        let payload: Vec<u8> = if keyframe {
            pixels.to_vec()
        } else {
            let prev = self.prev.as_ref().ok_or_else(|| malformed("delta before keyframe"))?;
            pixels.iter().zip(prev.iter()).map(|(a, b)| a ^ b).collect()
        };

        let pts_us = self.count as u64 * self.frame_duration_us() as u64;
        self.records.write_u64::<LittleEndian>(pts_us).ok();
        self.records
            .write_u32::<LittleEndian>(self.frame_duration_us())
            .ok();
        self.records.write_u8(keyframe as u8).ok();
        self.records
            .write_u32::<LittleEndian>(payload.len() as u32)
            .ok();
        self.records.write_all(&payload).ok();

        self.prev = Some(pixels.to_vec());
        self.count += 1;
        Ok(())
    }

    pub fn finish(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.records.len());
        out.extend_from_slice(RVF_MAGIC);
        out.write_u16::<LittleEndian>(self.width as u16).ok();
        out.write_u16::<LittleEndian>(self.height as u16).ok();
        out.write_u32::<LittleEndian>(self.fps_milli).ok();
        out.write_u32::<LittleEndian>(self.count).ok();
        out.extend_from_slice(&self.records);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::super::probe;
    use super::*;

    fn solid(width: u32, height: u32, value: u8) -> Vec<u8> {
        vec![value; (width * height * 4) as usize]
    }

    #[test]
    fn test_write_then_parse() {
        let mut w = RvfWriter::new(4, 4, 25.0);
        w.add_frame(&solid(4, 4, 10), true).unwrap();
        w.add_frame(&solid(4, 4, 20), false).unwrap();
        w.add_frame(&solid(4, 4, 30), true).unwrap();
        let bytes = w.finish();

        let info = probe(&bytes).unwrap();
        assert_eq!(info.codec, Codec::Raw);
        assert_eq!((info.width, info.height), (4, 4));
        assert_eq!(info.samples.len(), 3);
        assert_eq!(info.samples[1].pts_us, 40_000);
        assert!(!info.samples[1].keyframe);
        // Delta payload is the XOR of the two frames
        assert!(info.samples[1].payload.iter().all(|&b| b == 10 ^ 20));
        assert_eq!(info.duration_us, 120_000);
    }

    #[test]
    fn test_first_frame_forced_to_keyframe() {
        let mut w = RvfWriter::new(2, 2, 10.0);
        w.add_frame(&solid(2, 2, 1), false).unwrap();
        let info = probe(&w.finish()).unwrap();
        assert!(info.samples[0].keyframe);
    }

    #[test]
    fn test_truncated_stream() {
        let mut w = RvfWriter::new(2, 2, 10.0);
        w.add_frame(&solid(2, 2, 1), true).unwrap();
        let bytes = w.finish();
        let err = probe(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, DemuxError::MalformedContainer(_)));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut w = RvfWriter::new(2, 2, 10.0);
        assert!(w.add_frame(&[0u8; 7], true).is_err());
    }

    /// A hostile header claiming 65535x65535 must come back as a malformed
    /// container, not an arithmetic panic.
    #[test]
    fn test_oversized_dimensions_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(RVF_MAGIC);
        bytes.write_u16::<LittleEndian>(u16::MAX).ok();
        bytes.write_u16::<LittleEndian>(u16::MAX).ok();
        bytes.write_u32::<LittleEndian>(25_000).ok();
        bytes.write_u32::<LittleEndian>(1).ok();
        bytes.write_u64::<LittleEndian>(0).ok();
        bytes.write_u32::<LittleEndian>(40_000).ok();
        bytes.write_u8(1).ok();
        bytes.write_u32::<LittleEndian>(16).ok();
        bytes.extend_from_slice(&[0u8; 16]);

        let err = probe(&bytes).unwrap_err();
        assert!(matches!(err, DemuxError::MalformedContainer(_)));
    }
}
