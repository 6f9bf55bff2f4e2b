//! Compositor: decode, arrange, normalize, optional background removal,
//! enhancement and caption.

use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgba, RgbaImage};
use memeforge_contracts::events::{EventKind, EventWriter};
use memeforge_contracts::plan::{CompositionPlan, LayoutKind, ResolutionBounds};
use serde_json::json;

use crate::background::BackgroundRemover;
use crate::cache::CachedImage;
use crate::error::CompositionError;
use crate::map_object;
use crate::text::{render_caption, CaptionStyle, GlyphSource};

/// Panels more elongated than this are centre-cropped before scaling.
pub const MAX_PANEL_ASPECT: f32 = 3.0;
const GRID_MAX_COLUMNS: u32 = 3;
const CONTRAST_BOOST: f32 = 8.0;
const SHARPEN_SIGMA: f32 = 1.0;
const SHARPEN_THRESHOLD: i32 = 2;
const CANVAS_BACKGROUND: Rgba<u8> = Rgba([0, 0, 0, 255]);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrangement {
    pub cols: u32,
    pub rows: u32,
}

impl Arrangement {
    pub fn resolve(layout: LayoutKind, panels: usize) -> Self {
        let n = panels.max(1) as u32;
        if n == 1 {
            return Self { cols: 1, rows: 1 };
        }
        match layout {
            LayoutKind::Vertical => Self { cols: 1, rows: n },
            LayoutKind::Grid => {
                let cols = n.min(GRID_MAX_COLUMNS);
                Self {
                    cols,
                    rows: n.div_ceil(cols),
                }
            }
            LayoutKind::Horizontal | LayoutKind::Single => Self { cols: n, rows: 1 },
        }
    }

    fn slot(&self, idx: usize) -> (u32, u32) {
        let idx = idx as u32;
        (idx % self.cols, idx / self.cols)
    }

    /// Column width and per-row height cap for the given bounds.
    pub fn cell(&self, bounds: ResolutionBounds) -> (u32, u32) {
        (
            (bounds.max_width / self.cols).max(1),
            (bounds.max_height / self.rows).max(1),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ComposedMeme {
    pub image: RgbaImage,
    pub arrangement: Arrangement,
    /// Normalized size of every panel, in placement order.
    pub panel_sizes: Vec<(u32, u32)>,
    pub warnings: Vec<String>,
}

impl ComposedMeme {
    pub fn panels(&self) -> usize {
        self.panel_sizes.len()
    }
}

pub struct Compositor {
    remover: Box<dyn BackgroundRemover>,
    glyphs: GlyphSource,
    caption_style: CaptionStyle,
    events: EventWriter,
}

impl Compositor {
    pub fn new(
        remover: Box<dyn BackgroundRemover>,
        glyphs: GlyphSource,
        events: EventWriter,
    ) -> Self {
        Self {
            remover,
            glyphs,
            caption_style: CaptionStyle::default(),
            events,
        }
    }

    pub fn compose(
        &self,
        images: &[CachedImage],
        plan: &CompositionPlan,
    ) -> Result<ComposedMeme, CompositionError> {
        let mut warnings = Vec::new();
        let mut decoded = Vec::new();
        for image in images {
            match image::load_from_memory(&image.bytes) {
                Ok(dynamic) => decoded.push(dynamic.to_rgba8()),
                Err(err) => {
                    tracing::warn!(
                        url = %image.source_url,
                        error = %err,
                        "undecodable image dropped"
                    );
                    warnings.push(format!(
                        "Dropped {}: not a decodable image.",
                        image.source_url
                    ));
                }
            }
        }
        if decoded.is_empty() {
            return Err(CompositionError::NoPanels {
                attempted: images.len(),
            });
        }

        let arrangement = Arrangement::resolve(plan.layout(), decoded.len());
        let (cell_width, cell_height) = arrangement.cell(plan.resolution());
        let mut panels: Vec<RgbaImage> = decoded
            .into_iter()
            .map(|panel| normalize_panel(panel, cell_width, cell_height))
            .collect();

        if plan.background_removal() {
            for (idx, panel) in panels.iter_mut().enumerate() {
                match self.remover.remove(panel) {
                    Ok(cleared) => *panel = cleared,
                    Err(err) => {
                        let detail = format!("{err:#}");
                        tracing::warn!(
                            panel = idx,
                            remover = self.remover.name(),
                            error = %detail,
                            "background removal failed"
                        );
                        self.events.emit_quiet(
                            EventKind::BackgroundRemovalFailed,
                            map_object(json!({
                                "panel": idx,
                                "remover": self.remover.name(),
                                "error": detail,
                            })),
                        );
                        warnings.push(format!(
                            "Background removal failed for panel {}; kept the original.",
                            idx + 1
                        ));
                    }
                }
            }
        }

        let panel_sizes: Vec<(u32, u32)> = panels.iter().map(RgbaImage::dimensions).collect();
        let canvas = if panels.len() == 1 {
            panels.remove(0)
        } else {
            place_panels(&panels, arrangement, cell_width)
        };

        let mut canvas = enhance(&canvas);
        render_caption(&mut canvas, &self.glyphs, plan.caption(), &self.caption_style);
        tracing::debug!(
            width = canvas.width(),
            height = canvas.height(),
            panels = panel_sizes.len(),
            "meme composed"
        );

        Ok(ComposedMeme {
            image: canvas,
            arrangement,
            panel_sizes,
            warnings,
        })
    }
}

/// Crops to at most 3:1 either way, then scales down to fit the cell.
/// Never upscales; a panel already within bounds comes back untouched.
pub fn normalize_panel(panel: RgbaImage, max_width: u32, max_height: u32) -> RgbaImage {
    fit_within(crop_to_aspect(panel, MAX_PANEL_ASPECT), max_width, max_height)
}

fn crop_to_aspect(panel: RgbaImage, max_ratio: f32) -> RgbaImage {
    let (width, height) = panel.dimensions();
    if width as f32 > height as f32 * max_ratio {
        let keep = ((height as f32 * max_ratio).round() as u32).clamp(1, width);
        return imageops::crop_imm(&panel, (width - keep) / 2, 0, keep, height).to_image();
    }
    if height as f32 > width as f32 * max_ratio {
        let keep = ((width as f32 * max_ratio).round() as u32).clamp(1, height);
        return imageops::crop_imm(&panel, 0, (height - keep) / 2, width, keep).to_image();
    }
    panel
}

fn fit_within(panel: RgbaImage, max_width: u32, max_height: u32) -> RgbaImage {
    let (width, height) = panel.dimensions();
    if width <= max_width && height <= max_height {
        return panel;
    }
    let scale =
        (f64::from(max_width) / f64::from(width)).min(f64::from(max_height) / f64::from(height));
    let target_width = ((f64::from(width) * scale).round() as u32).clamp(1, max_width);
    let target_height = ((f64::from(height) * scale).round() as u32).clamp(1, max_height);
    imageops::resize(&panel, target_width, target_height, FilterType::Lanczos3)
}

/// Columns are exactly `cell_width` wide, rows as tall as their tallest
/// panel. Each panel is centred in its slot over the opaque background.
fn place_panels(panels: &[RgbaImage], arrangement: Arrangement, cell_width: u32) -> RgbaImage {
    let mut row_heights = vec![0u32; arrangement.rows as usize];
    for (idx, panel) in panels.iter().enumerate() {
        let (_, row) = arrangement.slot(idx);
        let slot = &mut row_heights[row as usize];
        *slot = (*slot).max(panel.height());
    }
    let width = arrangement.cols * cell_width;
    let height: u32 = row_heights.iter().sum();
    let mut canvas = RgbaImage::from_pixel(width, height.max(1), CANVAS_BACKGROUND);

    for (idx, panel) in panels.iter().enumerate() {
        let (col, row) = arrangement.slot(idx);
        let row_top: u32 = row_heights[..row as usize].iter().sum();
        let row_height = row_heights[row as usize];
        let x = col * cell_width + (cell_width.saturating_sub(panel.width())) / 2;
        let y = row_top + (row_height.saturating_sub(panel.height())) / 2;
        imageops::overlay(&mut canvas, panel, i64::from(x), i64::from(y));
    }
    canvas
}

/// Mild contrast boost and unsharp mask on colour; alpha is preserved.
fn enhance(canvas: &RgbaImage) -> RgbaImage {
    let contrasted = imageops::contrast(canvas, CONTRAST_BOOST);
    let mut sharpened = imageops::unsharpen(&contrasted, SHARPEN_SIGMA, SHARPEN_THRESHOLD);
    for (out, original) in sharpened.pixels_mut().zip(canvas.pixels()) {
        out[3] = original[3];
    }
    sharpened
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, CompositionError> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| CompositionError::Encode(anyhow::Error::new(err)))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use anyhow::bail;

    use super::*;
    use crate::background::BorderFloodRemover;

    const GRAY: Rgba<u8> = Rgba([128, 128, 128, 255]);

    struct FailingRemover;

    impl BackgroundRemover for FailingRemover {
        fn name(&self) -> &str {
            "failing"
        }

        fn remove(&self, _panel: &RgbaImage) -> anyhow::Result<RgbaImage> {
            bail!("model unavailable")
        }
    }

    fn compositor(remover: Box<dyn BackgroundRemover>) -> Compositor {
        Compositor::new(remover, GlyphSource::Bitmap, EventWriter::disabled())
    }

    fn cached_png(
        name: &str,
        width: u32,
        height: u32,
        color: Rgba<u8>,
    ) -> anyhow::Result<CachedImage> {
        let image = RgbaImage::from_pixel(width, height, color);
        Ok(CachedImage {
            source_url: format!("https://img/{name}.png"),
            cache_path: PathBuf::from(format!("{name}.img")),
            bytes: encode_png(&image)?,
            content_type: Some("image/png".to_string()),
            fetched_at: String::new(),
        })
    }

    fn plan(
        caption: &str,
        panels: usize,
        layout: LayoutKind,
        background_removal: bool,
    ) -> anyhow::Result<CompositionPlan> {
        let queries: Vec<String> = (0..panels).map(|idx| format!("query {idx}")).collect();
        CompositionPlan::new(
            caption,
            queries,
            layout,
            ResolutionBounds::default(),
            background_removal,
        )
    }

    #[test]
    fn arrangement_matches_layout() {
        let cases = [
            (LayoutKind::Grid, 1, (1, 1)),
            (LayoutKind::Vertical, 3, (1, 3)),
            (LayoutKind::Horizontal, 2, (2, 1)),
            (LayoutKind::Single, 3, (3, 1)),
            (LayoutKind::Grid, 3, (3, 1)),
        ];
        for (layout, panels, (cols, rows)) in cases {
            assert_eq!(
                Arrangement::resolve(layout, panels),
                Arrangement { cols, rows },
                "{layout:?} with {panels} panels"
            );
        }
    }

    #[test]
    fn canvas_dimensions_follow_layout_shape() -> anyhow::Result<()> {
        let compositor = compositor(Box::new(BorderFloodRemover::default()));
        for layout in LayoutKind::ALL {
            for n in 1..=3usize {
                let images = (0..n)
                    .map(|idx| cached_png(&format!("p{idx}"), 400, 300, GRAY))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                let meme = compositor.compose(&images, &plan("", n, layout, false)?)?;
                let arrangement = Arrangement::resolve(layout, n);
                assert_eq!(meme.arrangement, arrangement);
                assert_eq!(meme.panels(), n);

                let (width, height) = meme.image.dimensions();
                if n == 1 {
                    assert_eq!((width, height), (400, 300), "{layout} n=1");
                    continue;
                }
                let (cell_width, cell_height) = arrangement.cell(ResolutionBounds::default());
                assert_eq!(width, arrangement.cols * cell_width, "{layout} n={n}");
                let mut row_heights = vec![0u32; arrangement.rows as usize];
                for (idx, (panel_width, panel_height)) in meme.panel_sizes.iter().enumerate() {
                    assert!(*panel_width <= cell_width && *panel_height <= cell_height);
                    let row = idx / arrangement.cols as usize;
                    row_heights[row] = row_heights[row].max(*panel_height);
                }
                assert_eq!(height, row_heights.iter().sum::<u32>(), "{layout} n={n}");
            }
        }
        Ok(())
    }

    #[test]
    fn two_panels_side_by_side_keep_native_size() -> anyhow::Result<()> {
        let images = vec![cached_png("a", 400, 300, GRAY)?, cached_png("b", 400, 200, GRAY)?];
        let meme = compositor(Box::new(FailingRemover))
            .compose(&images, &plan("", 2, LayoutKind::Horizontal, false)?)?;
        assert_eq!(meme.image.dimensions(), (800, 300));
        assert_eq!(meme.panel_sizes, vec![(400, 300), (400, 200)]);
        // shorter panel is centred vertically over the background
        assert_eq!(*meme.image.get_pixel(600, 10), CANVAS_BACKGROUND);
        Ok(())
    }

    #[test]
    fn grid_of_three_uses_equal_columns_and_tallest_row() -> anyhow::Result<()> {
        let images = vec![
            cached_png("a", 600, 400, GRAY)?,
            cached_png("b", 300, 600, GRAY)?,
            cached_png("c", 200, 200, GRAY)?,
        ];
        let meme = compositor(Box::new(FailingRemover))
            .compose(&images, &plan("", 3, LayoutKind::Grid, false)?)?;
        let cell_width = 800 / 3;
        assert_eq!(meme.image.width(), 3 * cell_width);
        let tallest = meme.panel_sizes.iter().map(|(_, h)| *h).max().unwrap_or_default();
        assert_eq!(meme.image.height(), tallest);
        assert_eq!(meme.panel_sizes[2], (200, 200));
        Ok(())
    }

    #[test]
    fn panel_within_bounds_passes_through_unchanged() {
        let panel = RgbaImage::from_fn(320, 240, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 7, 255])
        });
        let normalized = normalize_panel(panel.clone(), 800, 800);
        assert_eq!(normalized, panel);
    }

    #[test]
    fn normalization_never_upscales_and_crops_extremes() {
        let tiny = normalize_panel(RgbaImage::from_pixel(50, 40, GRAY), 800, 800);
        assert_eq!(tiny.dimensions(), (50, 40));

        let banner = normalize_panel(RgbaImage::from_pixel(1000, 100, GRAY), 800, 800);
        assert_eq!(banner.dimensions(), (300, 100));

        let tower = normalize_panel(RgbaImage::from_pixel(200, 1600, GRAY), 800, 800);
        assert_eq!(tower.dimensions(), (200, 600));

        let large = normalize_panel(RgbaImage::from_pixel(1600, 1200, GRAY), 800, 800);
        assert_eq!(large.dimensions(), (800, 600));
    }

    #[test]
    fn cat_meme_is_single_panel_with_shadowed_caption() -> anyhow::Result<()> {
        let images = vec![cached_png("cat", 640, 480, GRAY)?];
        let meme = compositor(Box::new(BorderFloodRemover::default()))
            .compose(&images, &plan("CAT MEME", 1, LayoutKind::Single, false)?)?;
        assert_eq!(meme.image.dimensions(), (640, 480));

        let white = Rgba([255, 255, 255, 255]);
        let black = Rgba([0, 0, 0, 255]);
        let lowest = |color: Rgba<u8>| {
            meme.image
                .enumerate_pixels()
                .filter(|(_, _, pixel)| **pixel == color)
                .map(|(x, y, _)| (x, y))
                .fold(None, |acc: Option<(u32, u32)>, (x, y)| {
                    Some(acc.map_or((x, y), |(mx, my)| (mx.max(x), my.max(y))))
                })
        };
        let text = lowest(white).unwrap_or_else(|| panic!("caption missing"));
        let shadow = lowest(black).unwrap_or_else(|| panic!("shadow missing"));
        assert!(shadow.0 > text.0 && shadow.1 > text.1);
        assert!(text.1 > 480 / 2, "caption should sit at the bottom");
        Ok(())
    }

    #[test]
    fn failed_background_removal_keeps_opaque_original() -> anyhow::Result<()> {
        let images = vec![cached_png("photo", 300, 300, Rgba([40, 90, 160, 255]))?];
        let meme = compositor(Box::new(FailingRemover))
            .compose(&images, &plan("", 1, LayoutKind::Single, true)?)?;
        assert!(meme.image.pixels().all(|pixel| pixel[3] == 255));
        assert!(meme
            .warnings
            .iter()
            .any(|warning| warning.contains("Background removal failed")));
        Ok(())
    }

    #[test]
    fn background_removal_clears_flat_backdrop() -> anyhow::Result<()> {
        let subject = RgbaImage::from_fn(300, 300, |x, y| {
            if (100..200).contains(&x) && (100..200).contains(&y) {
                Rgba([200, 30, 30, 255])
            } else {
                Rgba([250, 250, 250, 255])
            }
        });
        let image = CachedImage {
            source_url: "https://img/subject.png".to_string(),
            cache_path: PathBuf::from("subject.img"),
            bytes: encode_png(&subject)?,
            content_type: None,
            fetched_at: String::new(),
        };
        let meme = compositor(Box::new(BorderFloodRemover::default()))
            .compose(&[image], &plan("", 1, LayoutKind::Single, true)?)?;
        assert_eq!(meme.image.get_pixel(5, 5)[3], 0);
        assert_eq!(meme.image.get_pixel(150, 150)[3], 255);
        assert!(meme.warnings.is_empty());
        Ok(())
    }

    #[test]
    fn undecodable_images_are_dropped() -> anyhow::Result<()> {
        let mut broken = cached_png("broken", 10, 10, GRAY)?;
        broken.bytes = b"<html>not an image</html>".to_vec();
        let good = cached_png("good", 300, 200, GRAY)?;

        let meme = compositor(Box::new(FailingRemover))
            .compose(&[broken.clone(), good], &plan("", 2, LayoutKind::Horizontal, false)?)?;
        assert_eq!(meme.panels(), 1);
        assert_eq!(meme.image.dimensions(), (300, 200));
        assert_eq!(meme.warnings.len(), 1);

        let result = compositor(Box::new(FailingRemover))
            .compose(&[broken], &plan("", 1, LayoutKind::Single, false)?);
        assert!(matches!(result, Err(CompositionError::NoPanels { attempted: 1 })));
        Ok(())
    }
}
