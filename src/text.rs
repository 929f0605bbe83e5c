//! Text rasterization - turns text items into RGBA frames.
//!
//! Uses cosmic-text for proper shaping, Unicode and multi-line layout. The
//! font system is expensive to build, so one global instance is shared by
//! every rasterization call. Text items are static, so the engine rasterizes
//! each one once and caches the frame.

use cosmic_text::{
    Attrs as TextAttrs, Buffer, Color, Family, FontSystem, Metrics, Shaping, SwashCache,
};
use std::sync::Mutex;

use crate::frame::Frame;

// Global font system (expensive to create, reuse across all text items)
lazy_static::lazy_static! {
    static ref FONT_SYSTEM: Mutex<FontSystem> = Mutex::new(FontSystem::new());
    static ref SWASH_CACHE: Mutex<SwashCache> = Mutex::new(SwashCache::new());
}

/// Text alignment options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextAlign {
    Left,
    Center,
    Right,
}

impl TextAlign {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "center" => TextAlign::Center,
            "right" => TextAlign::Right,
            _ => TextAlign::Left,
        }
    }
}

/// Rasterization parameters. Defaults match what the editor sends when a
/// text item carries no styling.
#[derive(Clone, Debug)]
pub struct TextStyle {
    pub font_family: String,
    pub font_size: f32,
    /// RGBA, 0-1
    pub color: [f32; 4],
    pub alignment: TextAlign,
    /// Multiplier on the font size
    pub line_height: f32,
    /// RGBA, 0-1 (transparent by default)
    pub bg_color: [f32; 4],
    /// 0 = auto-size to the text
    pub width: usize,
    pub height: usize,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font_family: "sans-serif".to_string(),
            font_size: 48.0,
            color: [1.0, 1.0, 1.0, 1.0],
            alignment: TextAlign::Left,
            line_height: 1.2,
            bg_color: [0.0, 0.0, 0.0, 0.0],
            width: 0,
            height: 0,
        }
    }
}

/// Render text to an RGBA frame.
pub fn rasterize(text: &str, style: &TextStyle) -> Frame {
    let mut font_system = FONT_SYSTEM.lock().unwrap_or_else(|e| e.into_inner());
    let mut swash_cache = SWASH_CACHE.lock().unwrap_or_else(|e| e.into_inner());

    let line_height = style.font_size * style.line_height;
    let metrics = Metrics::new(style.font_size, line_height);
    let mut buffer = Buffer::new(&mut font_system, metrics);

    let layout_width = if style.width > 0 {
        style.width as f32
    } else {
        // Auto-width: layout wide, trim to glyph bounds below
        4096.0
    };
    buffer.set_size(&mut font_system, Some(layout_width), None);

    let family = match style.font_family.to_lowercase().as_str() {
        "serif" => Family::Serif,
        "monospace" | "mono" => Family::Monospace,
        "cursive" => Family::Cursive,
        "fantasy" => Family::Fantasy,
        "sans-serif" | "sans" => Family::SansSerif,
        _ => Family::Name(&style.font_family),
    };
    let text_attrs = TextAttrs::new().family(family);
    // Alignment is applied at draw time against the measured glyph bounds
    buffer.set_text(&mut font_system, text, &text_attrs, Shaping::Advanced, None);
    buffer.shape_until_scroll(&mut font_system, false);

    // Actual glyph bounds
    let (text_width, text_height) = {
        let mut max_x = 0.0f32;
        let mut max_y = 0.0f32;
        for run in buffer.layout_runs() {
            for glyph in run.glyphs.iter() {
                max_x = max_x.max(glyph.x + glyph.w);
            }
            max_y = max_y.max(run.line_y + line_height);
        }
        (max_x.ceil() as usize, max_y.ceil() as usize)
    };

    let width = if style.width > 0 {
        style.width
    } else {
        text_width.max(1)
    };
    let height = if style.height > 0 {
        style.height
    } else {
        text_height.max(1)
    };

    let mut pixels = vec![0u8; width * height * 4];
    let bg = [
        (style.bg_color[0] * 255.0) as u8,
        (style.bg_color[1] * 255.0) as u8,
        (style.bg_color[2] * 255.0) as u8,
        (style.bg_color[3] * 255.0) as u8,
    ];
    for chunk in pixels.chunks_exact_mut(4) {
        chunk.copy_from_slice(&bg);
    }

    let text_color = Color::rgba(
        (style.color[0] * 255.0) as u8,
        (style.color[1] * 255.0) as u8,
        (style.color[2] * 255.0) as u8,
        (style.color[3] * 255.0) as u8,
    );
    let alignment = style.alignment;

    buffer.draw(&mut font_system, &mut swash_cache, text_color, |x, y, w, h, color| {
        let align_offset = match alignment {
            TextAlign::Left => 0.0,
            TextAlign::Center => (width as f32 - text_width as f32) / 2.0,
            TextAlign::Right => width as f32 - text_width as f32,
        };

        let px = (x as f32 + align_offset) as i32;
        let py = y;
        if px < 0 || py < 0 || px >= width as i32 || py >= height as i32 {
            return;
        }
        let px = px as usize;
        let py = py as usize;

        for dy in 0..h as usize {
            for dx in 0..w as usize {
                let dest_x = px + dx;
                let dest_y = py + dy;
                if dest_x >= width || dest_y >= height {
                    continue;
                }
                let idx = (dest_y * width + dest_x) * 4;

                let src_a = color.a() as f32 / 255.0;
                let dst_a = pixels[idx + 3] as f32 / 255.0;
                let out_a = src_a + dst_a * (1.0 - src_a);
                if out_a > 0.0 {
                    let blend = |src: u8, dst: u8| -> u8 {
                        let s = src as f32 / 255.0;
                        let d = dst as f32 / 255.0;
                        let out = (s * src_a + d * dst_a * (1.0 - src_a)) / out_a;
                        (out * 255.0) as u8
                    };
                    pixels[idx] = blend(color.r(), pixels[idx]);
                    pixels[idx + 1] = blend(color.g(), pixels[idx + 1]);
                    pixels[idx + 2] = blend(color.b(), pixels[idx + 2]);
                    pixels[idx + 3] = (out_a * 255.0) as u8;
                }
            }
        }
    });

    // Dimensions were derived from the same pixels vec, length always matches
    Frame::from_rgba8(pixels, width, height)
        .unwrap_or_else(|_| Frame::solid(width.max(1), height.max(1), [0, 0, 0, 0]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_parsing() {
        assert_eq!(TextAlign::from_str("left"), TextAlign::Left);
        assert_eq!(TextAlign::from_str("CENTER"), TextAlign::Center);
        assert_eq!(TextAlign::from_str("right"), TextAlign::Right);
        assert_eq!(TextAlign::from_str("bogus"), TextAlign::Left);
    }

    #[test]
    fn test_fixed_dimensions_respected() {
        let style = TextStyle {
            width: 100,
            height: 40,
            ..Default::default()
        };
        let frame = rasterize("Hi", &style);
        assert_eq!(frame.resolution(), (100, 40));
    }

    #[test]
    fn test_empty_text_yields_nonzero_frame() {
        let frame = rasterize("", &TextStyle::default());
        let (w, h) = frame.resolution();
        assert!(w >= 1 && h >= 1);
    }

    #[test]
    fn test_background_fill() {
        let style = TextStyle {
            width: 8,
            height: 8,
            bg_color: [0.0, 0.0, 1.0, 1.0],
            ..Default::default()
        };
        let frame = rasterize("", &style);
        assert_eq!(&frame.pixels()[0..4], &[0, 0, 255, 255]);
    }
}
