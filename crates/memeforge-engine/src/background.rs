use std::collections::VecDeque;

use anyhow::{bail, Result};
use image::RgbaImage;

pub trait BackgroundRemover: Send + Sync {
    fn name(&self) -> &str;
    /// Returns a copy of `panel` with background pixels made transparent.
    fn remove(&self, panel: &RgbaImage) -> Result<RgbaImage>;
}

/// Clears the region connected to the image border whose colour stays close
/// to the average border colour. Works for studio shots and flat backdrops;
/// refuses to touch busy photos where it would clear nothing or nearly
/// everything.
#[derive(Debug, Clone)]
pub struct BorderFloodRemover {
    pub tolerance: u32,
    pub max_cleared_fraction: f64,
}

impl Default for BorderFloodRemover {
    fn default() -> Self {
        Self {
            tolerance: 48,
            max_cleared_fraction: 0.95,
        }
    }
}

impl BorderFloodRemover {
    fn border_mean(panel: &RgbaImage) -> [u32; 3] {
        let (width, height) = panel.dimensions();
        let mut sum = [0u64; 3];
        let mut count = 0u64;
        for (x, y, pixel) in panel.enumerate_pixels() {
            if x == 0 || y == 0 || x + 1 == width || y + 1 == height {
                for channel in 0..3 {
                    sum[channel] += u64::from(pixel[channel]);
                }
                count += 1;
            }
        }
        let count = count.max(1);
        [
            (sum[0] / count) as u32,
            (sum[1] / count) as u32,
            (sum[2] / count) as u32,
        ]
    }

    fn close_to(&self, pixel: &image::Rgba<u8>, reference: [u32; 3]) -> bool {
        let distance_sq: u32 = (0..3)
            .map(|channel| {
                let diff = u32::from(pixel[channel]).abs_diff(reference[channel]);
                diff * diff
            })
            .sum();
        distance_sq <= self.tolerance * self.tolerance
    }
}

impl BackgroundRemover for BorderFloodRemover {
    fn name(&self) -> &str {
        "border-flood"
    }

    fn remove(&self, panel: &RgbaImage) -> Result<RgbaImage> {
        let (width, height) = panel.dimensions();
        if width < 3 || height < 3 {
            bail!("panel too small for background removal ({width}x{height})");
        }
        let reference = Self::border_mean(panel);
        let mut visited = vec![false; (width as usize) * (height as usize)];
        let index = |x: u32, y: u32| (y as usize) * (width as usize) + x as usize;
        let mut queue: VecDeque<(u32, u32)> = VecDeque::new();

        let border = (0..width)
            .flat_map(|x| [(x, 0), (x, height - 1)])
            .chain((0..height).flat_map(|y| [(0, y), (width - 1, y)]));
        for (x, y) in border {
            let idx = index(x, y);
            if !visited[idx] && self.close_to(panel.get_pixel(x, y), reference) {
                visited[idx] = true;
                queue.push_back((x, y));
            }
        }

        let mut output = panel.clone();
        let mut cleared = 0usize;
        while let Some((x, y)) = queue.pop_front() {
            output.get_pixel_mut(x, y)[3] = 0;
            cleared += 1;
            let neighbours = [
                (x.wrapping_sub(1), y),
                (x + 1, y),
                (x, y.wrapping_sub(1)),
                (x, y + 1),
            ];
            for (nx, ny) in neighbours {
                if nx >= width || ny >= height {
                    continue;
                }
                let idx = index(nx, ny);
                if visited[idx] || !self.close_to(panel.get_pixel(nx, ny), reference) {
                    continue;
                }
                visited[idx] = true;
                queue.push_back((nx, ny));
            }
        }

        let total = (width as usize) * (height as usize);
        if cleared == 0 {
            bail!("no uniform background found");
        }
        if cleared as f64 / total as f64 > self.max_cleared_fraction {
            bail!(
                "background removal would clear {cleared} of {total} pixels; keeping the original"
            );
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgba, RgbaImage};

    use super::{BackgroundRemover, BorderFloodRemover};

    fn subject_on_backdrop() -> RgbaImage {
        RgbaImage::from_fn(40, 40, |x, y| {
            if (10..30).contains(&x) && (10..30).contains(&y) {
                Rgba([200, 30, 30, 255])
            } else {
                Rgba([250, 250, 250, 255])
            }
        })
    }

    #[test]
    fn clears_flat_backdrop_and_keeps_subject() -> anyhow::Result<()> {
        let output = BorderFloodRemover::default().remove(&subject_on_backdrop())?;
        assert_eq!(output.get_pixel(0, 0)[3], 0);
        assert_eq!(output.get_pixel(5, 35)[3], 0);
        assert_eq!(*output.get_pixel(20, 20), Rgba([200, 30, 30, 255]));
        Ok(())
    }

    #[test]
    fn uniform_image_is_refused() {
        let flat = RgbaImage::from_pixel(20, 20, Rgba([10, 10, 10, 255]));
        assert!(BorderFloodRemover::default().remove(&flat).is_err());
    }

    #[test]
    fn noisy_border_is_refused() {
        let noisy = RgbaImage::from_fn(20, 20, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        });
        assert!(BorderFloodRemover::default().remove(&noisy).is_err());
    }
}
