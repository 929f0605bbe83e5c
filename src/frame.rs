//! Decoded frame buffers and the move-only cross-thread frame handle.
//!
//! **Why**: decoded frames are shared by the cache and the compositor (cheap
//! `Arc` clones of an immutable buffer), but the hand-off from a decode thread
//! to its consumer must transfer ownership exactly once. `FrameHandle` is that
//! transfer: it is not `Clone`, and the pixels can only be reached by
//! consuming it.
//!
//! **Used by**: decode backends (producing), orchestrator (transferring),
//! frame cache and compositor (sharing).

use std::sync::Arc;

/// Frame buffer errors
#[derive(Debug)]
pub enum FrameError {
    /// Pixel buffer length does not match width * height * 4
    BufferMismatch { expected: usize, got: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::BufferMismatch { expected, got } => {
                write!(f, "RGBA buffer mismatch: expected {} bytes, got {}", expected, got)
            }
        }
    }
}

impl std::error::Error for FrameError {}

#[derive(Debug)]
struct FrameData {
    pixels: Vec<u8>, // RGBA8, row-major, no padding
    width: usize,
    height: usize,
}

/// Immutable RGBA8 image buffer.
///
/// Cloning a `Frame` clones the `Arc`, never the pixels. Once constructed the
/// buffer is never written again, so shared access needs no lock.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Arc<FrameData>,
}

impl Frame {
    /// Create a frame filled with a single color.
    pub fn solid(width: usize, height: usize, rgba: [u8; 4]) -> Self {
        let mut pixels = vec![0u8; width * height * 4];
        for px in pixels.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba);
        }
        Self {
            data: Arc::new(FrameData { pixels, width, height }),
        }
    }

    /// Wrap an RGBA8 buffer. Fails if the length doesn't match the dimensions.
    pub fn from_rgba8(pixels: Vec<u8>, width: usize, height: usize) -> Result<Self, FrameError> {
        let expected = width * height * 4;
        if pixels.len() != expected {
            return Err(FrameError::BufferMismatch {
                expected,
                got: pixels.len(),
            });
        }
        Ok(Self {
            data: Arc::new(FrameData { pixels, width, height }),
        })
    }

    pub fn width(&self) -> usize {
        self.data.width
    }

    pub fn height(&self) -> usize {
        self.data.height
    }

    /// Get resolution as tuple
    pub fn resolution(&self) -> (usize, usize) {
        (self.data.width, self.data.height)
    }

    /// Borrow the RGBA8 pixel data.
    pub fn pixels(&self) -> &[u8] {
        &self.data.pixels
    }

    /// Memory size in bytes
    pub fn mem(&self) -> usize {
        self.data.pixels.len()
    }
}

/// Owned, move-only handle to one decoded frame.
///
/// Produced on a decode thread and sent across the orchestrator boundary.
/// Deliberately not `Clone`: a frame event either hands the pixels over or is
/// dropped, there is no third option.
#[derive(Debug)]
pub struct FrameHandle {
    pts_us: i64,
    frame: Frame,
}

impl FrameHandle {
    pub fn new(pts_us: i64, frame: Frame) -> Self {
        Self { pts_us, frame }
    }

    /// Presentation timestamp in microseconds.
    pub fn pts_us(&self) -> i64 {
        self.pts_us
    }

    pub fn resolution(&self) -> (usize, usize) {
        self.frame.resolution()
    }

    /// Consume the handle, taking ownership of the frame.
    pub fn into_frame(self) -> (i64, Frame) {
        (self.pts_us, self.frame)
    }
}
