//! Caption rendering: font selection, word wrapping and shadowed drawing.

use std::path::Path;

use ab_glyph::{point, Font, FontVec, PxScale, ScaleFont};
use image::{Rgba, RgbaImage};

const BITMAP_COLS: u32 = 5;
const BITMAP_ROWS: u32 = 7;
const BITMAP_ADVANCE: u32 = BITMAP_COLS + 1;
const BITMAP_LINE: u32 = BITMAP_ROWS + 2;
/// Nominal em size of the bitmap font in font units.
const BITMAP_EM: f32 = 8.0;

/// Where glyph shapes come from. A configured TrueType font when it loads,
/// otherwise the built-in 5x7 bitmap face (upper case only).
pub enum GlyphSource {
    Bitmap,
    TrueType(FontVec),
}

impl std::fmt::Debug for GlyphSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GlyphSource::Bitmap => f.write_str("GlyphSource::Bitmap"),
            GlyphSource::TrueType(_) => f.write_str("GlyphSource::TrueType"),
        }
    }
}

impl GlyphSource {
    pub fn load(font_path: Option<&Path>) -> Self {
        let Some(path) = font_path else {
            return GlyphSource::Bitmap;
        };
        let loaded = std::fs::read(path)
            .map_err(anyhow::Error::new)
            .and_then(|bytes| FontVec::try_from_vec(bytes).map_err(anyhow::Error::new));
        match loaded {
            Ok(font) => GlyphSource::TrueType(font),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "caption font unavailable; using the built-in bitmap font"
                );
                GlyphSource::Bitmap
            }
        }
    }

    fn prepare(&self, text: &str) -> String {
        match self {
            GlyphSource::Bitmap => text.to_uppercase(),
            GlyphSource::TrueType(_) => text.to_string(),
        }
    }

    fn bitmap_scale(px: f32) -> u32 {
        ((px / BITMAP_EM).round() as u32).max(1)
    }

    pub fn line_height(&self, px: f32) -> u32 {
        match self {
            GlyphSource::Bitmap => BITMAP_LINE * Self::bitmap_scale(px),
            GlyphSource::TrueType(font) => {
                let scaled = font.as_scaled(PxScale::from(px));
                (scaled.height() + scaled.line_gap()).ceil().max(1.0) as u32
            }
        }
    }

    pub fn text_width(&self, text: &str, px: f32) -> u32 {
        match self {
            GlyphSource::Bitmap => {
                let chars = text.chars().count() as u32;
                // no trailing spacing column after the last glyph
                (chars * BITMAP_ADVANCE).saturating_sub(1) * Self::bitmap_scale(px)
            }
            GlyphSource::TrueType(font) => {
                let scaled = font.as_scaled(PxScale::from(px));
                let mut width = 0.0f32;
                let mut previous = None;
                for ch in text.chars() {
                    let id = scaled.glyph_id(ch);
                    if let Some(prev) = previous {
                        width += scaled.kern(prev, id);
                    }
                    width += scaled.h_advance(id);
                    previous = Some(id);
                }
                width.ceil() as u32
            }
        }
    }

    fn draw_line(
        &self,
        canvas: &mut RgbaImage,
        text: &str,
        x: i64,
        y: i64,
        px: f32,
        color: Rgba<u8>,
    ) {
        match self {
            GlyphSource::Bitmap => {
                let scale = i64::from(Self::bitmap_scale(px));
                let mut caret = x;
                for ch in text.chars() {
                    let rows = bitmap_glyph(ch);
                    for (row, bits) in rows.iter().enumerate() {
                        for col in 0..BITMAP_COLS {
                            if bits & (1 << (BITMAP_COLS - 1 - col)) == 0 {
                                continue;
                            }
                            let left = caret + i64::from(col) * scale;
                            let top = y + row as i64 * scale;
                            fill_block(canvas, left, top, scale, color);
                        }
                    }
                    caret += i64::from(BITMAP_ADVANCE) * scale;
                }
            }
            GlyphSource::TrueType(font) => {
                let scale = PxScale::from(px);
                let scaled = font.as_scaled(scale);
                let baseline = y as f32 + scaled.ascent();
                let mut caret = x as f32;
                let mut previous = None;
                for ch in text.chars() {
                    let id = scaled.glyph_id(ch);
                    if let Some(prev) = previous {
                        caret += scaled.kern(prev, id);
                    }
                    let glyph = id.with_scale_and_position(scale, point(caret, baseline));
                    caret += scaled.h_advance(id);
                    previous = Some(id);
                    let Some(outlined) = font.outline_glyph(glyph) else {
                        continue;
                    };
                    let bounds = outlined.px_bounds();
                    outlined.draw(|gx, gy, coverage| {
                        let px_x = bounds.min.x as i64 + i64::from(gx);
                        let px_y = bounds.min.y as i64 + i64::from(gy);
                        blend_pixel(canvas, px_x, px_y, color, coverage);
                    });
                }
            }
        }
    }
}

fn fill_block(canvas: &mut RgbaImage, left: i64, top: i64, size: i64, color: Rgba<u8>) {
    for dy in 0..size {
        for dx in 0..size {
            blend_pixel(canvas, left + dx, top + dy, color, 1.0);
        }
    }
}

fn blend_pixel(canvas: &mut RgbaImage, x: i64, y: i64, color: Rgba<u8>, coverage: f32) {
    if x < 0 || y < 0 || x >= i64::from(canvas.width()) || y >= i64::from(canvas.height()) {
        return;
    }
    let coverage = coverage.clamp(0.0, 1.0);
    if coverage <= 0.0 {
        return;
    }
    let pixel = canvas.get_pixel_mut(x as u32, y as u32);
    for channel in 0..3 {
        let src = f32::from(color[channel]);
        let dst = f32::from(pixel[channel]);
        pixel[channel] = (src * coverage + dst * (1.0 - coverage)).round() as u8;
    }
    pixel[3] = pixel[3].max((f32::from(color[3]) * coverage).round() as u8);
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionStyle {
    /// Font size as a fraction of canvas width.
    pub size_fraction: f32,
    pub min_px: f32,
    /// Upper bound on font size as a fraction of canvas height.
    pub max_px_fraction: f32,
    /// Upper bound on the whole wrapped block as a fraction of canvas height.
    pub max_block_fraction: f32,
    pub wrap_fraction: f32,
    pub fill: Rgba<u8>,
    pub shadow: Rgba<u8>,
}

impl Default for CaptionStyle {
    fn default() -> Self {
        Self {
            size_fraction: 0.08,
            min_px: 12.0,
            max_px_fraction: 0.2,
            max_block_fraction: 0.3,
            wrap_fraction: 0.9,
            fill: Rgba([255, 255, 255, 255]),
            shadow: Rgba([0, 0, 0, 255]),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptionLayout {
    pub font_px: f32,
    pub lines: Vec<String>,
    pub line_height: u32,
    pub shadow_offset: u32,
    pub top: u32,
    pub block_height: u32,
}

/// Picks a font size and line breaks for `text` on a `width` x `height`
/// canvas. Returns `None` for blank captions.
pub fn layout_caption(
    glyphs: &GlyphSource,
    text: &str,
    width: u32,
    height: u32,
    style: &CaptionStyle,
) -> Option<CaptionLayout> {
    let text = glyphs.prepare(text.trim());
    if text.is_empty() || width == 0 || height == 0 {
        return None;
    }
    let max_px = (height as f32 * style.max_px_fraction).max(style.min_px);
    let mut px = (width as f32 * style.size_fraction).clamp(style.min_px, max_px);
    let wrap_width = ((width as f32 * style.wrap_fraction) as u32).max(1);
    let block_limit = height as f32 * style.max_block_fraction;

    loop {
        let lines = wrap_words(glyphs, &text, wrap_width, px);
        let line_height = glyphs.line_height(px);
        let block_height = line_height * lines.len() as u32;
        if block_height as f32 <= block_limit || px <= style.min_px {
            let margin = line_height / 2;
            let top = height.saturating_sub(block_height + margin);
            return Some(CaptionLayout {
                font_px: px,
                lines,
                line_height,
                shadow_offset: ((px / 20.0) as u32).max(1),
                top,
                block_height,
            });
        }
        px = (px * 0.9).max(style.min_px);
    }
}

/// Draws the caption bottom-centred: shadow first, offset right and down,
/// then the main text on top.
pub fn render_caption(
    canvas: &mut RgbaImage,
    glyphs: &GlyphSource,
    text: &str,
    style: &CaptionStyle,
) -> Option<CaptionLayout> {
    let (width, height) = canvas.dimensions();
    let layout = layout_caption(glyphs, text, width, height, style)?;
    let offset = i64::from(layout.shadow_offset);
    for (idx, line) in layout.lines.iter().enumerate() {
        let line_width = glyphs.text_width(line, layout.font_px);
        let x = i64::from(width.saturating_sub(line_width) / 2);
        let y = i64::from(layout.top) + idx as i64 * i64::from(layout.line_height);
        glyphs.draw_line(canvas, line, x + offset, y + offset, layout.font_px, style.shadow);
        glyphs.draw_line(canvas, line, x, y, layout.font_px, style.fill);
    }
    Some(layout)
}

fn wrap_words(glyphs: &GlyphSource, text: &str, max_width: u32, px: f32) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let candidate = if current.is_empty() {
            word.to_string()
        } else {
            format!("{current} {word}")
        };
        if current.is_empty() || glyphs.text_width(&candidate, px) <= max_width {
            current = candidate;
        } else {
            lines.push(std::mem::take(&mut current));
            current = word.to_string();
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

#[rustfmt::skip]
fn bitmap_glyph(ch: char) -> [u8; 7] {
    match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ' ' => [0; 7],
        '!' => [0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00000, 0b00100],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100],
        ',' => [0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b00100, 0b01000],
        '\'' | '’' => [0b01100, 0b00100, 0b01000, 0b00000, 0b00000, 0b00000, 0b00000],
        '"' | '“' | '”' => [0b01010, 0b01010, 0b01010, 0b00000, 0b00000, 0b00000, 0b00000],
        '-' | '–' | '—' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        ';' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b00100, 0b01000],
        '(' => [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010],
        ')' => [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000],
        '/' => [0b00000, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b00000],
        '&' => [0b01100, 0b10010, 0b10100, 0b01000, 0b10101, 0b10010, 0b01101],
        '#' => [0b01010, 0b01010, 0b11111, 0b01010, 0b11111, 0b01010, 0b01010],
        '%' => [0b11000, 0b11001, 0b00010, 0b00100, 0b01000, 0b10011, 0b00011],
        '+' => [0b00000, 0b00100, 0b00100, 0b11111, 0b00100, 0b00100, 0b00000],
        '=' => [0b00000, 0b00000, 0b11111, 0b00000, 0b11111, 0b00000, 0b00000],
        '*' => [0b00000, 0b00100, 0b10101, 0b01110, 0b10101, 0b00100, 0b00000],
        '_' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111],
        '@' => [0b01110, 0b10001, 0b00001, 0b01101, 0b10101, 0b10101, 0b01110],
        '$' => [0b00100, 0b01111, 0b10100, 0b01110, 0b00101, 0b11110, 0b00100],
        _ => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b00000, 0b00100],
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};

    use super::*;

    const GRAY: Rgba<u8> = Rgba([128, 128, 128, 255]);

    fn bbox(canvas: &RgbaImage, color: Rgba<u8>) -> Option<(u32, u32, u32, u32)> {
        let mut found: Option<(u32, u32, u32, u32)> = None;
        for (x, y, pixel) in canvas.enumerate_pixels() {
            if *pixel != color {
                continue;
            }
            found = Some(match found {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
        found
    }

    #[test]
    fn caption_has_offset_shadow() {
        let mut canvas = RgbaImage::from_pixel(400, 300, GRAY);
        let style = CaptionStyle::default();
        let layout = render_caption(&mut canvas, &GlyphSource::Bitmap, "cat meme", &style)
            .unwrap_or_else(|| panic!("caption should render"));

        let white = bbox(&canvas, style.fill).unwrap_or_else(|| panic!("no text pixels"));
        let black = bbox(&canvas, style.shadow).unwrap_or_else(|| panic!("no shadow pixels"));
        assert!(layout.shadow_offset >= 1);
        assert_eq!(black.2, white.2 + layout.shadow_offset);
        assert_eq!(black.3, white.3 + layout.shadow_offset);
        assert_eq!(layout.lines, vec!["CAT MEME".to_string()]);
    }

    #[test]
    fn caption_is_bottom_anchored_and_centred() {
        let mut canvas = RgbaImage::from_pixel(400, 300, GRAY);
        let style = CaptionStyle::default();
        render_caption(&mut canvas, &GlyphSource::Bitmap, "hi", &style);
        let (x0, _, x1, y1) =
            bbox(&canvas, style.fill).unwrap_or_else(|| panic!("no text pixels"));
        assert!(y1 > 200, "caption should sit in the lower third, got y1={y1}");
        let left_gap = x0 as i64;
        let right_gap = 399 - x1 as i64;
        assert!((left_gap - right_gap).abs() <= 8);
    }

    #[test]
    fn font_size_tracks_width_with_height_cap() {
        let glyphs = GlyphSource::Bitmap;
        let style = CaptionStyle::default();
        let wide = layout_caption(&glyphs, "ok", 1000, 1000, &style)
            .unwrap_or_else(|| panic!("layout"));
        assert!((wide.font_px - 80.0).abs() < f32::EPSILON);

        let letterbox = layout_caption(&glyphs, "ok", 1000, 100, &style)
            .unwrap_or_else(|| panic!("layout"));
        assert!(letterbox.font_px <= 20.0);
    }

    #[test]
    fn long_caption_wraps_and_shrinks_to_fit() {
        let glyphs = GlyphSource::Bitmap;
        let style = CaptionStyle::default();
        let text = "when you finally fix the bug and three new ones appear \
                    out of nowhere just to say hello";
        let layout = layout_caption(&glyphs, text, 400, 400, &style)
            .unwrap_or_else(|| panic!("layout"));
        assert!(layout.lines.len() > 1);
        assert!(layout.block_height as f32 <= 400.0 * style.max_block_fraction);
        for line in &layout.lines {
            assert!(glyphs.text_width(line, layout.font_px) <= 360 || !line.contains(' '));
        }
    }

    #[test]
    fn blank_caption_draws_nothing() {
        let mut canvas = RgbaImage::from_pixel(50, 50, GRAY);
        let layout = render_caption(
            &mut canvas,
            &GlyphSource::Bitmap,
            "   ",
            &CaptionStyle::default(),
        );
        assert!(layout.is_none());
        assert!(canvas.pixels().all(|pixel| *pixel == GRAY));
    }

    #[test]
    fn missing_font_falls_back_to_bitmap() {
        let glyphs = GlyphSource::load(Some(Path::new("/nonexistent/font.ttf")));
        assert!(matches!(glyphs, GlyphSource::Bitmap));
    }
}
