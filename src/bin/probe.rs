//! Standalone media probe: prints a JSON report for a container file and
//! optionally extracts decoded frames as PNGs.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use serde_json::json;

use playhead::capability::{select_strategy, Capabilities};
use playhead::cli::Args;
use playhead::decode::{DecodeEngine, DecodeTuning};
use playhead::demux::probe;

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    let bytes = fs::read(&args.file_path)
        .with_context(|| format!("failed to read {}", args.file_path.display()))?;
    let info = probe(&bytes)
        .with_context(|| format!("failed to parse {}", args.file_path.display()))?;

    let keyframes = info.samples.iter().filter(|s| s.keyframe).count();
    let report = json!({
        "file": args.file_path.display().to_string(),
        "codec": info.codec,
        "width": info.width,
        "height": info.height,
        "frameRate": info.frame_rate,
        "durationSeconds": info.duration_us as f64 / 1_000_000.0,
        "sampleCount": info.samples.len(),
        "keyframeCount": keyframes,
        "timescale": info.timescale,
    });
    if args.pretty {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", serde_json::to_string(&report)?);
    }

    if let Some(count) = args.frames {
        extract_frames(&args, &bytes, count, info.frame_rate)?;
    }
    Ok(())
}

/// Decode `count` frames starting at the seek point and write PNGs.
fn extract_frames(args: &Args, bytes: &[u8], count: usize, frame_rate: f64) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let out_dir = args.out_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let strategy = select_strategy(Capabilities::detect());
    info!("decoding with {} backend", strategy.name());

    let tuning = DecodeTuning {
        max_batch: count,
        ..Default::default()
    };
    let mut engine = DecodeEngine::new((strategy.make_backend_factory())(), tuning);
    let (first_pts, first_frame) = engine.load(bytes)?;

    let start = args.seek.unwrap_or(0.0).max(0.0);
    let start_us = (start * 1_000_000.0).round() as i64;
    let frame_us = if frame_rate > 0.0 {
        (1_000_000.0 / frame_rate).round() as i64
    } else {
        bail!("stream reports a zero frame rate");
    };
    let target_us = start_us + (count as i64 - 1) * frame_us;

    let mut frames = engine.decode_to(target_us)?;
    // Decoding continues after the preview frame, so put it back when the
    // requested range starts at or before it
    if start_us <= first_pts
        && frames.first().map(|(pts, _)| *pts > first_pts).unwrap_or(true)
    {
        frames.insert(0, (first_pts, first_frame));
    }
    frames.retain(|(pts, _)| *pts >= start_us - frame_us / 2);
    frames.truncate(count);

    for (i, (pts, frame)) in frames.iter().enumerate() {
        let (w, h) = frame.resolution();
        let img = image::RgbaImage::from_raw(w as u32, h as u32, frame.pixels().to_vec())
            .context("frame buffer does not match its resolution")?;
        let path = out_dir.join(format!("frame_{:05}_{}us.png", i, pts));
        img.save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!("wrote {}", path.display());
    }
    println!("extracted {} frames to {}", frames.len(), out_dir.display());
    Ok(())
}
