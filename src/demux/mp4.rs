//! ISO BMFF (MP4/MOV) parser for the primary video track.
//!
//! Walks the box tree with a `Cursor` over the input bytes, collects the
//! `stbl` sample tables and flattens them into pts-ordered `CompressedSample`s
//! with timestamps normalized to microseconds. Fragmented files (moof) are
//! not handled.

use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{BigEndian, ReadBytesExt};

use super::{Codec, CompressedSample, DemuxError, MediaInfo};

// Box fourccs we dispatch on
const MOOV: [u8; 4] = *b"moov";
const MVHD: [u8; 4] = *b"mvhd";
const TRAK: [u8; 4] = *b"trak";
const MDIA: [u8; 4] = *b"mdia";
const MDHD: [u8; 4] = *b"mdhd";
const HDLR: [u8; 4] = *b"hdlr";
const MINF: [u8; 4] = *b"minf";
const STBL: [u8; 4] = *b"stbl";
const STSD: [u8; 4] = *b"stsd";
const STTS: [u8; 4] = *b"stts";
const CTTS: [u8; 4] = *b"ctts";
const STSS: [u8; 4] = *b"stss";
const STSC: [u8; 4] = *b"stsc";
const STSZ: [u8; 4] = *b"stsz";
const STCO: [u8; 4] = *b"stco";
const CO64: [u8; 4] = *b"co64";

type Result<T> = std::result::Result<T, DemuxError>;

fn malformed(what: &str) -> DemuxError {
    DemuxError::MalformedContainer(what.to_string())
}

fn read_err(_: std::io::Error) -> DemuxError {
    malformed("truncated box data")
}

/// Raw sample tables of one track, exactly as stored.
#[derive(Debug, Default)]
struct SampleTable {
    // (sample_count, sample_delta) runs
    time_to_sample: Vec<(u32, u32)>,
    // (sample_count, composition_offset) runs
    composition_offsets: Vec<(u32, i32)>,
    // 1-based sample numbers that are sync samples
    keyframes: Vec<u32>,
    // (first_chunk, samples_per_chunk)
    sample_to_chunk: Vec<(u32, u32)>,
    sample_sizes: Vec<u32>,
    chunk_offsets: Vec<u64>,
}

#[derive(Debug, Default)]
struct VideoTrack {
    is_video: bool,
    timescale: u32,
    duration: u64,
    width: u32,
    height: u32,
    codec: Option<Codec>,
    codec_config: Vec<u8>,
    table: SampleTable,
}

/// Parse an ISO BMFF stream and flatten its first video track.
pub(super) fn parse(bytes: &[u8]) -> Result<MediaInfo> {
    let mut cur = Cursor::new(bytes);
    let len = bytes.len() as u64;

    let mut track: Option<VideoTrack> = None;
    let mut movie_timescale = 1000u32;

    while cur.position() < len {
        let (body_end, kind) = read_box_header(&mut cur, len)?;
        match kind {
            MOOV => {
                parse_moov(&mut cur, body_end, &mut movie_timescale, &mut track)?;
            }
            _ => cur.seek(SeekFrom::Start(body_end)).map(|_| ()).map_err(read_err)?,
        }
    }

    let track = track.ok_or_else(|| {
        DemuxError::UnsupportedContainer("no video track in movie".to_string())
    })?;
    let codec = track.codec.ok_or_else(|| {
        DemuxError::UnsupportedContainer("video track has no recognized codec".to_string())
    })?;
    if track.timescale == 0 {
        return Err(malformed("zero track timescale"));
    }

    let samples = flatten_samples(bytes, &track)?;
    if samples.is_empty() {
        return Err(malformed("video track has no samples"));
    }

    let duration_us = scale_to_us(track.duration as i64, track.timescale);
    let frame_rate = if duration_us > 0 {
        samples.len() as f64 * 1_000_000.0 / duration_us as f64
    } else {
        0.0
    };

    Ok(MediaInfo {
        duration_us,
        width: track.width,
        height: track.height,
        frame_rate,
        codec,
        codec_config: track.codec_config,
        timescale: track.timescale,
        samples,
    })
}

fn scale_to_us(value: i64, timescale: u32) -> i64 {
    value * 1_000_000 / timescale as i64
}

/// Read one box header, returning (body_end, fourcc). Handles the 64-bit
/// largesize form and size 0 (box runs to `limit`).
fn read_box_header(cur: &mut Cursor<&[u8]>, limit: u64) -> Result<(u64, [u8; 4])> {
    let start = cur.position();
    let size32 = cur.read_u32::<BigEndian>().map_err(read_err)?;
    let mut kind = [0u8; 4];
    cur.read_exact(&mut kind).map_err(read_err)?;
    let body_end = match size32 {
        0 => limit,
        1 => {
            let size = cur.read_u64::<BigEndian>().map_err(read_err)?;
            if size < 16 {
                return Err(malformed("box smaller than its header"));
            }
            start
                .checked_add(size)
                .ok_or_else(|| malformed("box size overflow"))?
        }
        n if n < 8 => return Err(malformed("box smaller than its header")),
        n => start + n as u64,
    };
    if body_end > limit || body_end < cur.position() {
        return Err(malformed("box extends past its parent"));
    }
    Ok((body_end, kind))
}

fn parse_moov(
    cur: &mut Cursor<&[u8]>,
    end: u64,
    movie_timescale: &mut u32,
    track: &mut Option<VideoTrack>,
) -> Result<()> {
    while cur.position() < end {
        let (body_end, kind) = read_box_header(cur, end)?;
        match kind {
            MVHD => {
                let version = cur.read_u8().map_err(read_err)?;
                skip(cur, 3)?;
                if version == 1 {
                    skip(cur, 16)?;
                    *movie_timescale = cur.read_u32::<BigEndian>().map_err(read_err)?;
                } else {
                    skip(cur, 8)?;
                    *movie_timescale = cur.read_u32::<BigEndian>().map_err(read_err)?;
                }
                cur.seek(SeekFrom::Start(body_end)).map_err(read_err)?;
            }
            TRAK => {
                let parsed = parse_trak(cur, body_end)?;
                // First video track wins
                if parsed.is_video && track.is_none() {
                    *track = Some(parsed);
                }
            }
            _ => {
                cur.seek(SeekFrom::Start(body_end)).map_err(read_err)?;
            }
        }
    }
    Ok(())
}

fn parse_trak(cur: &mut Cursor<&[u8]>, end: u64) -> Result<VideoTrack> {
    let mut track = VideoTrack::default();
    while cur.position() < end {
        let (body_end, kind) = read_box_header(cur, end)?;
        if kind == MDIA {
            parse_mdia(cur, body_end, &mut track)?;
        } else {
            cur.seek(SeekFrom::Start(body_end)).map_err(read_err)?;
        }
    }
    Ok(track)
}

fn parse_mdia(cur: &mut Cursor<&[u8]>, end: u64, track: &mut VideoTrack) -> Result<()> {
    while cur.position() < end {
        let (body_end, kind) = read_box_header(cur, end)?;
        match kind {
            MDHD => {
                let version = cur.read_u8().map_err(read_err)?;
                skip(cur, 3)?;
                if version == 1 {
                    skip(cur, 16)?;
                    track.timescale = cur.read_u32::<BigEndian>().map_err(read_err)?;
                    track.duration = cur.read_u64::<BigEndian>().map_err(read_err)?;
                } else {
                    skip(cur, 8)?;
                    track.timescale = cur.read_u32::<BigEndian>().map_err(read_err)?;
                    track.duration = cur.read_u32::<BigEndian>().map_err(read_err)? as u64;
                }
            }
            HDLR => {
                skip(cur, 8)?; // version/flags + pre_defined
                let mut handler = [0u8; 4];
                cur.read_exact(&mut handler).map_err(read_err)?;
                track.is_video = &handler == b"vide";
            }
            MINF => {
                parse_minf(cur, body_end, track)?;
            }
            _ => {}
        }
        cur.seek(SeekFrom::Start(body_end)).map_err(read_err)?;
    }
    Ok(())
}

fn parse_minf(cur: &mut Cursor<&[u8]>, end: u64, track: &mut VideoTrack) -> Result<()> {
    while cur.position() < end {
        let (body_end, kind) = read_box_header(cur, end)?;
        if kind == STBL {
            parse_stbl(cur, body_end, track)?;
        }
        cur.seek(SeekFrom::Start(body_end)).map_err(read_err)?;
    }
    Ok(())
}

fn parse_stbl(cur: &mut Cursor<&[u8]>, end: u64, track: &mut VideoTrack) -> Result<()> {
    while cur.position() < end {
        let (body_end, kind) = read_box_header(cur, end)?;
        match kind {
            STSD => parse_stsd(cur, body_end, track)?,
            STTS => {
                skip(cur, 4)?;
                let count = cur.read_u32::<BigEndian>().map_err(read_err)?;
                for _ in 0..count {
                    let n = cur.read_u32::<BigEndian>().map_err(read_err)?;
                    let delta = cur.read_u32::<BigEndian>().map_err(read_err)?;
                    track.table.time_to_sample.push((n, delta));
                }
            }
            CTTS => {
                skip(cur, 4)?;
                let count = cur.read_u32::<BigEndian>().map_err(read_err)?;
                for _ in 0..count {
                    let n = cur.read_u32::<BigEndian>().map_err(read_err)?;
                    let offset = cur.read_i32::<BigEndian>().map_err(read_err)?;
                    track.table.composition_offsets.push((n, offset));
                }
            }
            STSS => {
                skip(cur, 4)?;
                let count = cur.read_u32::<BigEndian>().map_err(read_err)?;
                for _ in 0..count {
                    track
                        .table
                        .keyframes
                        .push(cur.read_u32::<BigEndian>().map_err(read_err)?);
                }
            }
            STSC => {
                skip(cur, 4)?;
                let count = cur.read_u32::<BigEndian>().map_err(read_err)?;
                for _ in 0..count {
                    let first_chunk = cur.read_u32::<BigEndian>().map_err(read_err)?;
                    let per_chunk = cur.read_u32::<BigEndian>().map_err(read_err)?;
                    skip(cur, 4)?; // sample description index
                    track.table.sample_to_chunk.push((first_chunk, per_chunk));
                }
            }
            STSZ => {
                skip(cur, 4)?;
                let uniform = cur.read_u32::<BigEndian>().map_err(read_err)?;
                let count = cur.read_u32::<BigEndian>().map_err(read_err)?;
                if uniform == 0 {
                    for _ in 0..count {
                        track
                            .table
                            .sample_sizes
                            .push(cur.read_u32::<BigEndian>().map_err(read_err)?);
                    }
                } else {
                    track.table.sample_sizes = vec![uniform; count as usize];
                }
            }
            STCO => {
                skip(cur, 4)?;
                let count = cur.read_u32::<BigEndian>().map_err(read_err)?;
                for _ in 0..count {
                    track
                        .table
                        .chunk_offsets
                        .push(cur.read_u32::<BigEndian>().map_err(read_err)? as u64);
                }
            }
            CO64 => {
                skip(cur, 4)?;
                let count = cur.read_u32::<BigEndian>().map_err(read_err)?;
                for _ in 0..count {
                    track
                        .table
                        .chunk_offsets
                        .push(cur.read_u64::<BigEndian>().map_err(read_err)?);
                }
            }
            _ => {}
        }
        cur.seek(SeekFrom::Start(body_end)).map_err(read_err)?;
    }
    Ok(())
}

fn parse_stsd(cur: &mut Cursor<&[u8]>, end: u64, track: &mut VideoTrack) -> Result<()> {
    skip(cur, 4)?; // version + flags
    let entry_count = cur.read_u32::<BigEndian>().map_err(read_err)?;
    if entry_count == 0 {
        return Ok(());
    }
    let (entry_end, fourcc) = read_box_header(cur, end)?;

    track.codec = match &fourcc {
        b"avc1" | b"avc3" => Some(Codec::H264),
        b"hvc1" | b"hev1" => Some(Codec::Hevc),
        _ => None,
    };

    // VisualSampleEntry layout: 6 reserved + 2 dref index, then 16 bytes of
    // pre_defined/reserved before width/height.
    skip(cur, 8)?;
    skip(cur, 16)?;
    track.width = cur.read_u16::<BigEndian>().map_err(read_err)? as u32;
    track.height = cur.read_u16::<BigEndian>().map_err(read_err)? as u32;
    skip(cur, 50)?; // remainder of the visual sample entry

    // avcC / hvcC holds the decoder init data
    while cur.position() + 8 <= entry_end {
        let (cfg_end, cfg_kind) = read_box_header(cur, entry_end)?;
        if &cfg_kind == b"avcC" || &cfg_kind == b"hvcC" {
            let len = (cfg_end - cur.position()) as usize;
            let mut data = vec![0u8; len];
            cur.read_exact(&mut data).map_err(read_err)?;
            track.codec_config = data;
        }
        cur.seek(SeekFrom::Start(cfg_end)).map_err(read_err)?;
    }
    cur.seek(SeekFrom::Start(entry_end)).map_err(read_err)?;
    Ok(())
}

fn skip(cur: &mut Cursor<&[u8]>, n: u64) -> Result<()> {
    cur.seek(SeekFrom::Current(n as i64)).map_err(read_err)?;
    Ok(())
}

/// Expand the stbl tables into pts-ordered samples with payload bytes.
fn flatten_samples(bytes: &[u8], track: &VideoTrack) -> Result<Vec<CompressedSample>> {
    let table = &track.table;
    let count = table.sample_sizes.len();

    // Per-sample decode deltas from the stts runs
    let mut deltas = Vec::with_capacity(count);
    for &(n, delta) in &table.time_to_sample {
        for _ in 0..n {
            deltas.push(delta as i64);
        }
    }
    if deltas.len() < count {
        let fill = deltas.last().copied().unwrap_or(0);
        deltas.resize(count, fill);
    }

    // Composition offsets from the ctts runs (zero when absent)
    let mut cts_offsets = vec![0i64; count];
    let mut at = 0usize;
    for &(n, offset) in &table.composition_offsets {
        for _ in 0..n {
            if at >= count {
                break;
            }
            cts_offsets[at] = offset as i64;
            at += 1;
        }
    }

    // Byte offsets via the chunk map
    let offsets = sample_offsets(table)?;
    if offsets.len() != count {
        return Err(malformed("chunk map does not cover every sample"));
    }

    let mut samples = Vec::with_capacity(count);
    let mut dts = 0i64;
    for idx in 0..count {
        let size = table.sample_sizes[idx] as usize;
        let start = offsets[idx] as usize;
        let end = start
            .checked_add(size)
            .ok_or_else(|| malformed("sample offset overflow"))?;
        if end > bytes.len() {
            return Err(malformed("sample data past end of input"));
        }
        let keyframe = if table.keyframes.is_empty() {
            true // no sync table means every sample is sync
        } else {
            table.keyframes.binary_search(&(idx as u32 + 1)).is_ok()
        };
        samples.push(CompressedSample {
            pts_us: scale_to_us(dts + cts_offsets[idx], track.timescale),
            duration_us: scale_to_us(deltas[idx], track.timescale),
            keyframe,
            payload: bytes[start..end].to_vec(),
        });
        dts += deltas[idx];
    }

    // Presentation order for the consumer; B-frame reordering is the decode
    // backend's problem, sample order here is what the cache keys on.
    samples.sort_by_key(|s| s.pts_us);
    Ok(samples)
}

fn sample_offsets(table: &SampleTable) -> Result<Vec<u64>> {
    let stsc = &table.sample_to_chunk;
    let stco = &table.chunk_offsets;
    let stsz = &table.sample_sizes;
    if stsc.is_empty() || stco.is_empty() {
        return Err(malformed("missing chunk tables"));
    }

    let mut offsets = Vec::with_capacity(stsz.len());
    let mut sample = 0usize;
    for i in 0..stsc.len() {
        let first_chunk = (stsc[i].0.max(1) - 1) as usize;
        let per_chunk = stsc[i].1 as usize;
        let next_first = if i + 1 < stsc.len() {
            (stsc[i + 1].0.max(1) - 1) as usize
        } else {
            stco.len()
        };
        for chunk in first_chunk..next_first.min(stco.len()) {
            let mut offset = stco[chunk];
            for _ in 0..per_chunk {
                if sample >= stsz.len() {
                    return Ok(offsets);
                }
                offsets.push(offset);
                offset += stsz[sample] as u64;
                sample += 1;
            }
        }
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::super::probe;
    use super::*;
    use byteorder::{BigEndian, WriteBytesExt};
    use std::io::Write;

    fn boxed(kind: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<BigEndian>(8 + body.len() as u32).unwrap();
        out.write_all(kind).unwrap();
        out.write_all(body).unwrap();
        out
    }

    /// Builds a minimal one-track movie: 4 samples, timescale 1000,
    /// keyframes at samples 1 and 3, payloads packed into one chunk.
    fn tiny_mp4() -> Vec<u8> {
        let payloads: [&[u8]; 4] = [b"AAAA", b"BB", b"CCCC", b"D"];

        let mut mdat_body = Vec::new();
        for p in payloads {
            mdat_body.extend_from_slice(p);
        }

        let mut stts = vec![0u8; 4];
        stts.write_u32::<BigEndian>(1).unwrap();
        stts.write_u32::<BigEndian>(4).unwrap(); // sample count
        stts.write_u32::<BigEndian>(40).unwrap(); // 40 units @ ts=1000 = 40 ms

        let mut stss = vec![0u8; 4];
        stss.write_u32::<BigEndian>(2).unwrap();
        stss.write_u32::<BigEndian>(1).unwrap();
        stss.write_u32::<BigEndian>(3).unwrap();

        let mut stsc = vec![0u8; 4];
        stsc.write_u32::<BigEndian>(1).unwrap();
        stsc.write_u32::<BigEndian>(1).unwrap(); // first chunk
        stsc.write_u32::<BigEndian>(4).unwrap(); // samples per chunk
        stsc.write_u32::<BigEndian>(1).unwrap();

        let mut stsz = vec![0u8; 4];
        stsz.write_u32::<BigEndian>(0).unwrap(); // non-uniform
        stsz.write_u32::<BigEndian>(4).unwrap();
        for p in payloads {
            stsz.write_u32::<BigEndian>(p.len() as u32).unwrap();
        }

        // stsd: avc1 visual sample entry with width/height and empty avcC
        let avcc = boxed(b"avcC", &[1, 100, 0, 31]);
        let mut visual = Vec::new();
        visual.extend_from_slice(&[0u8; 8]); // reserved + dref
        visual.extend_from_slice(&[0u8; 16]);
        visual.write_u16::<BigEndian>(64).unwrap();
        visual.write_u16::<BigEndian>(48).unwrap();
        visual.extend_from_slice(&[0u8; 50]);
        visual.extend_from_slice(&avcc);
        let avc1 = boxed(b"avc1", &visual);
        let mut stsd = vec![0u8; 4];
        stsd.write_u32::<BigEndian>(1).unwrap();
        stsd.extend_from_slice(&avc1);

        let mut mdhd = vec![0u8; 4]; // version 0
        mdhd.extend_from_slice(&[0u8; 8]);
        mdhd.write_u32::<BigEndian>(1000).unwrap(); // timescale
        mdhd.write_u32::<BigEndian>(160).unwrap(); // duration
        mdhd.extend_from_slice(&[0u8; 4]);

        let mut hdlr = vec![0u8; 8];
        hdlr.extend_from_slice(b"vide");
        hdlr.extend_from_slice(&[0u8; 12]);

        let ftyp = boxed(b"ftyp", b"isom\0\0\0\0isom");
        let mdat = boxed(b"mdat", &mdat_body);

        // stco needs the absolute chunk offset, so lay out ftyp + mdat first
        let chunk_offset = ftyp.len() as u32 + 8;
        let mut stco = vec![0u8; 4];
        stco.write_u32::<BigEndian>(1).unwrap();
        stco.write_u32::<BigEndian>(chunk_offset).unwrap();

        let stbl = boxed(
            b"stbl",
            &[
                boxed(b"stsd", &stsd),
                boxed(b"stts", &stts),
                boxed(b"stss", &stss),
                boxed(b"stsc", &stsc),
                boxed(b"stsz", &stsz),
                boxed(b"stco", &stco),
            ]
            .concat(),
        );
        let minf = boxed(b"minf", &stbl);
        let mdia = boxed(
            b"mdia",
            &[boxed(b"mdhd", &mdhd), boxed(b"hdlr", &hdlr), minf].concat(),
        );
        let trak = boxed(b"trak", &mdia);

        let mut mvhd = vec![0u8; 4];
        mvhd.extend_from_slice(&[0u8; 8]);
        mvhd.write_u32::<BigEndian>(1000).unwrap();
        mvhd.write_u32::<BigEndian>(160).unwrap();
        let moov = boxed(b"moov", &[boxed(b"mvhd", &mvhd), trak].concat());

        [ftyp, mdat, moov].concat()
    }

    #[test]
    fn test_parse_tiny_movie() {
        let info = probe(&tiny_mp4()).unwrap();
        assert_eq!(info.codec, Codec::H264);
        assert_eq!((info.width, info.height), (64, 48));
        assert_eq!(info.timescale, 1000);
        assert_eq!(info.duration_us, 160_000);
        assert_eq!(info.samples.len(), 4);
        assert_eq!(info.codec_config, vec![1, 100, 0, 31]);
    }

    #[test]
    fn test_sample_timing_and_keyframes() {
        let info = probe(&tiny_mp4()).unwrap();
        let pts: Vec<i64> = info.samples.iter().map(|s| s.pts_us).collect();
        assert_eq!(pts, vec![0, 40_000, 80_000, 120_000]);
        let kf: Vec<bool> = info.samples.iter().map(|s| s.keyframe).collect();
        assert_eq!(kf, vec![true, false, true, false]);
        assert_eq!(info.samples[0].payload, b"AAAA");
        assert_eq!(info.samples[3].payload, b"D");
    }

    #[test]
    fn test_truncated_movie_is_malformed() {
        let full = tiny_mp4();
        let cut = &full[..full.len() - 12];
        let err = probe(cut).unwrap_err();
        assert!(matches!(err, DemuxError::MalformedContainer(_)));
    }
}
