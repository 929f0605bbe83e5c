use clap::Parser;
use std::path::PathBuf;

// Decode backend info (compile-time)
#[cfg(feature = "ffmpeg")]
const DECODE_BACKEND: &str = "playa-ffmpeg 8.0 (static)";
#[cfg(not(feature = "ffmpeg"))]
const DECODE_BACKEND: &str = "reference (pure Rust, raw streams)";

// Build version with backend info
const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Decode: ", DECODE_BACKEND, "\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Media probe and frame extraction tool
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Media file to inspect (MP4 or raw video stream)
    #[arg(value_name = "FILE")]
    pub file_path: PathBuf,

    /// Decode the first N frames and write them as PNGs
    #[arg(short = 'n', long = "frames", value_name = "N")]
    pub frames: Option<usize>,

    /// Output directory for extracted frames (default: current dir)
    #[arg(short = 'o', long = "out", value_name = "DIR")]
    pub out_dir: Option<PathBuf>,

    /// Seek to this time (seconds) before extracting frames
    #[arg(short = 's', long = "seek", value_name = "SECONDS")]
    pub seek: Option<f64>,

    /// Pretty-print the JSON report
    #[arg(long = "pretty")]
    pub pretty: bool,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}
