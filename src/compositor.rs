//! CPU compositor - blends resolved layers into one output frame.
//!
//! **Why**: one fixed-size canvas per tick, layers drawn bottom-up in
//! ascending z order with straight-alpha src-over blending. A layer whose
//! frame could not be resolved (decode still in flight, errored source) is
//! skipped; the tick never waits for pixels.
//!
//! Rows are independent, so blending parallelizes across the canvas with
//! rayon.

use log::trace;
use rayon::prelude::*;

use crate::frame::Frame;
use crate::timeline::TransitionKind;

/// One layer snapshot handed to the compositor.
///
/// `frame: None` means the layer is unresolved this tick. `opacity` and
/// transition progress are pre-clamped to [0, 1] by the timeline accessors.
#[derive(Debug, Clone)]
pub struct CompositorLayer {
    pub frame: Option<Frame>,
    /// Top-left placement on the canvas, pixels. May be negative.
    pub position: (i32, i32),
    pub z_index: i32,
    pub opacity: f32,
    pub transition: Option<(TransitionKind, f32)>,
}

pub struct Compositor {
    width: usize,
    height: usize,
}

impl Compositor {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn resolution(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Blend `layers` onto an opaque black canvas, lowest z first.
    pub fn composite(&self, layers: &[CompositorLayer]) -> Frame {
        let mut order: Vec<&CompositorLayer> =
            layers.iter().filter(|l| l.frame.is_some()).collect();
        // Stable: equal z keeps item order
        order.sort_by_key(|l| l.z_index);
        trace!("compositing {} of {} layers", order.len(), layers.len());

        let row_bytes = self.width * 4;
        let mut canvas = vec![0u8; row_bytes * self.height];
        for px in canvas.chunks_exact_mut(4) {
            px[3] = 255;
        }

        let width = self.width;
        canvas
            .par_chunks_exact_mut(row_bytes)
            .enumerate()
            .for_each(|(y, row)| {
                for layer in &order {
                    blend_layer_row(row, y as i32, width, layer);
                }
            });

        // Length is width*height*4 by construction
        Frame::from_rgba8(canvas, self.width, self.height)
            .unwrap_or_else(|_| Frame::solid(self.width, self.height, [0, 0, 0, 255]))
    }
}

/// Blend the part of `layer` that intersects canvas row `y`.
fn blend_layer_row(row: &mut [u8], y: i32, canvas_width: usize, layer: &CompositorLayer) {
    let frame = match &layer.frame {
        Some(f) => f,
        None => return,
    };
    let (ox, oy) = layer.position;
    let fy = y - oy;
    if fy < 0 || fy >= frame.height() as i32 {
        return;
    }
    let fy = fy as usize;
    let fw = frame.width();
    let src_row = &frame.pixels()[fy * fw * 4..(fy + 1) * fw * 4];

    // Transition shaping: crossfade scales opacity, wipes mask columns
    let mut opacity = layer.opacity.clamp(0.0, 1.0);
    let mut wipe: Option<(bool, usize)> = None;
    if let Some((kind, progress)) = layer.transition {
        let progress = progress.clamp(0.0, 1.0);
        match kind {
            TransitionKind::Crossfade => opacity *= progress,
            TransitionKind::WipeRight => {
                // Revealed from the left edge rightward
                wipe = Some((true, (progress * fw as f32) as usize));
            }
            TransitionKind::WipeLeft => {
                // Revealed from the right edge leftward
                wipe = Some((false, fw - (progress * fw as f32) as usize));
            }
        }
    }
    if opacity <= 0.0 {
        return;
    }

    for fx in 0..fw {
        if let Some((from_left, edge)) = wipe {
            let visible = if from_left { fx < edge } else { fx >= edge };
            if !visible {
                continue;
            }
        }
        let cx = ox + fx as i32;
        if cx < 0 || cx >= canvas_width as i32 {
            continue;
        }
        let src = &src_row[fx * 4..fx * 4 + 4];
        let dst = &mut row[cx as usize * 4..cx as usize * 4 + 4];

        let src_a = (src[3] as f32 / 255.0) * opacity;
        if src_a <= 0.0 {
            continue;
        }
        let dst_a = dst[3] as f32 / 255.0;
        let out_a = src_a + dst_a * (1.0 - src_a);
        if out_a <= 0.0 {
            continue;
        }
        for c in 0..3 {
            let s = src[c] as f32 / 255.0;
            let d = dst[c] as f32 / 255.0;
            let out = (s * src_a + d * dst_a * (1.0 - src_a)) / out_a;
            dst[c] = (out * 255.0).round() as u8;
        }
        dst[3] = (out_a * 255.0).round() as u8;
    }
}
