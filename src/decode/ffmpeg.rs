//! FFmpeg-backed decoder for H.264/HEVC, enabled by the `ffmpeg` feature.
//!
//! Packets come from our own demuxer, so only the codec layer of FFmpeg is
//! used: a decoder context initialized from the track's avcC/hvcC extradata
//! plus a scaler to RGBA.

use std::sync::Once;

use log::{trace, warn};
use playa_ffmpeg as ffmpeg;

use super::backend::{DecodeBackend, DecodeError};
use crate::demux::{Codec, CompressedSample, MediaInfo};
use crate::frame::Frame;

static FFMPEG_LOG_INIT: Once = Once::new();

fn init_ffmpeg_logging() {
    FFMPEG_LOG_INIT.call_once(|| {
        unsafe {
            // Silence all FFmpeg output including stderr
            ffmpeg::ffi::av_log_set_level(ffmpeg::ffi::AV_LOG_QUIET);
        }
    });
}

pub struct FfmpegDecoder {
    decoder: Option<ffmpeg::codec::decoder::Video>,
    scaler: Option<ffmpeg::software::scaling::Context>,
    width: u32,
    height: u32,
}

impl FfmpegDecoder {
    pub fn new() -> Self {
        init_ffmpeg_logging();
        Self {
            decoder: None,
            scaler: None,
            width: 0,
            height: 0,
        }
    }

    fn codec_id(codec: Codec) -> Result<ffmpeg::codec::Id, DecodeError> {
        match codec {
            Codec::H264 => Ok(ffmpeg::codec::Id::H264),
            Codec::Hevc => Ok(ffmpeg::codec::Id::HEVC),
            Codec::Raw => Err(DecodeError::CodecUnsupported(
                "raw streams use the reference decoder".to_string(),
            )),
        }
    }

    fn load(msg: impl std::fmt::Display) -> DecodeError {
        DecodeError::CodecUnsupported(format!("{}", msg))
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeBackend for FfmpegDecoder {
    fn configure(&mut self, info: &MediaInfo) -> Result<(), DecodeError> {
        let codec_id = Self::codec_id(info.codec)?;
        let codec = ffmpeg::codec::decoder::find(codec_id)
            .ok_or_else(|| Self::load(format!("no decoder for {:?}", codec_id)))?;
        let mut ctx = ffmpeg::codec::context::Context::new_with_codec(codec);

        // Extradata (avcC/hvcC) and frame threading, set through the raw
        // context as the safe wrapper exposes neither.
        unsafe {
            let raw = ctx.as_mut_ptr();
            if !info.codec_config.is_empty() {
                let size = info.codec_config.len();
                let buf = ffmpeg::ffi::av_mallocz(
                    size + ffmpeg::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize,
                ) as *mut u8;
                if buf.is_null() {
                    return Err(Self::load("extradata allocation failed"));
                }
                std::ptr::copy_nonoverlapping(info.codec_config.as_ptr(), buf, size);
                (*raw).extradata = buf;
                (*raw).extradata_size = size as i32;
            }
            (*raw).thread_type = ffmpeg::ffi::FF_THREAD_FRAME;
            (*raw).thread_count = 0; // auto-detect
        }

        let decoder = ctx
            .decoder()
            .video()
            .map_err(|e| Self::load(format!("decoder open failed: {}", e)))?;
        self.width = info.width;
        self.height = info.height;
        self.decoder = Some(decoder);
        self.scaler = None; // built lazily once the pixel format is known
        Ok(())
    }

    fn decode(&mut self, sample: &CompressedSample) -> Result<Option<Frame>, DecodeError> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| DecodeError::DecodeFailed("decoder not configured".to_string()))?;

        let mut packet = ffmpeg::codec::packet::Packet::copy(&sample.payload);
        packet.set_pts(Some(sample.pts_us));
        if sample.keyframe {
            packet.set_flags(ffmpeg::codec::packet::Flags::KEY);
        }
        decoder
            .send_packet(&packet)
            .map_err(|e| DecodeError::DecodeFailed(format!("send_packet: {}", e)))?;

        let mut decoded = ffmpeg::util::frame::video::Video::empty();
        if decoder.receive_frame(&mut decoded).is_err() {
            // Codec delay; picture will surface with a later sample
            trace!("ffmpeg buffered sample pts={}us", sample.pts_us);
            return Ok(None);
        }

        let width = self.width;
        let height = self.height;
        if self.scaler.is_none() {
            self.scaler = Some(
                ffmpeg::software::scaling::Context::get(
                    decoded.format(),
                    decoded.width(),
                    decoded.height(),
                    ffmpeg::format::Pixel::RGBA,
                    width,
                    height,
                    ffmpeg::software::scaling::Flags::BILINEAR,
                )
                .map_err(|e| DecodeError::DecodeFailed(format!("scaler: {}", e)))?,
            );
        }
        let scaler = match self.scaler.as_mut() {
            Some(s) => s,
            None => return Err(DecodeError::DecodeFailed("scaler missing".to_string())),
        };

        let mut rgba = ffmpeg::util::frame::video::Video::empty();
        scaler
            .run(&decoded, &mut rgba)
            .map_err(|e| DecodeError::DecodeFailed(format!("scale: {}", e)))?;

        // Strides may exceed row width; copy row by row
        let data = rgba.data(0);
        let stride = rgba.stride(0);
        let row_bytes = (width * 4) as usize;
        let mut output = vec![0u8; row_bytes * height as usize];
        for y in 0..height as usize {
            let src = y * stride;
            let dst = y * row_bytes;
            output[dst..dst + row_bytes].copy_from_slice(&data[src..src + row_bytes]);
        }

        let frame = Frame::from_rgba8(output, width as usize, height as usize)
            .map_err(|e| DecodeError::DecodeFailed(e.to_string()))?;
        Ok(Some(frame))
    }

    fn reset(&mut self) {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.flush();
        } else {
            warn!("reset on unconfigured ffmpeg decoder");
        }
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}
