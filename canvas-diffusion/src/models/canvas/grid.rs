//! Rasterization of a canvas into a per-pixel region map.

use image::RgbImage;

use super::{Canvas, Rgb, CANVAS_GRID};
use crate::{Error, Result};

/// Color of pixels no region assigns a color to.
pub const NEUTRAL_COLOR: Rgb = [37, 37, 37];

/// Painter's-algorithm composite of a canvas at a fixed pixel size.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionGrid {
    width: usize,
    height: usize,
    region_count: usize,
    indices: Vec<u32>,
    colors: Vec<Rgb>,
    coverage: Vec<u32>,
}

/// Paints the canvas regions in ascending `z_order` onto a `grid_width` ×
/// `grid_height` pixel grid.
///
/// A pixel belongs to a region when its centre, mapped onto the canvas grid,
/// lies inside the region's bounds. Each painted region overwrites the pixel's
/// region index and, when it has a fixed color, its color; `coverage` counts
/// how many regions touched the pixel. Pixels no region touches stay with the
/// background, region 0.
pub fn render_to_grid(canvas: &Canvas, grid_width: usize, grid_height: usize) -> RegionGrid {
    let pixels = grid_width * grid_height;
    let mut grid = RegionGrid {
        width: grid_width,
        height: grid_height,
        region_count: canvas.regions().len(),
        indices: vec![0; pixels],
        colors: vec![NEUTRAL_COLOR; pixels],
        coverage: vec![0; pixels],
    };

    let mut order: Vec<usize> = (0..canvas.regions().len()).collect();
    order.sort_by_key(|&i| canvas.regions()[i].z_order);

    let scale_x = CANVAS_GRID as f64 / grid_width as f64;
    let scale_y = CANVAS_GRID as f64 / grid_height as f64;
    for index in order {
        let region = &canvas.regions()[index];
        let b = region.bounds;
        // Bounds are separable: find the covered columns and rows once.
        let columns: Vec<usize> = (0..grid_width)
            .filter(|&x| b.contains((x as f64 + 0.5) * scale_x, b.y0 as f64))
            .collect();
        for y in 0..grid_height {
            if !b.contains(b.x0 as f64, (y as f64 + 0.5) * scale_y) {
                continue;
            }
            for &x in &columns {
                let p = y * grid_width + x;
                grid.indices[p] = index as u32;
                grid.coverage[p] += 1;
                if let Some(color) = region.fixed_color {
                    grid.colors[p] = color;
                }
            }
        }
    }
    grid
}

impl RegionGrid {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn region_count(&self) -> usize {
        self.region_count
    }

    /// Region indices in row-major order.
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn region_at(&self, x: usize, y: usize) -> u32 {
        self.indices[y * self.width + x]
    }

    pub fn color_at(&self, x: usize, y: usize) -> Rgb {
        self.colors[y * self.width + x]
    }

    /// Number of regions whose bounds contain the pixel.
    pub fn coverage_at(&self, x: usize, y: usize) -> u32 {
        self.coverage[y * self.width + x]
    }

    /// Binary mask of the pixels owned by `region`.
    pub fn mask(&self, region: usize) -> Vec<f32> {
        self.indices
            .iter()
            .map(|&i| if i as usize == region { 1.0 } else { 0.0 })
            .collect()
    }

    /// Per-region ownership fractions, average-pooled by `factor`.
    ///
    /// Returns one `(height / factor) * (width / factor)` mask per region.
    /// At every pooled pixel the masks sum to one.
    pub fn downsample_masks(&self, factor: usize) -> Result<Vec<Vec<f32>>> {
        if factor == 0 || self.width % factor != 0 || self.height % factor != 0 {
            return Err(Error::invalid(
                "downsample factor",
                format!("{factor} does not divide {}x{}", self.width, self.height),
            ));
        }
        let (w, h) = (self.width / factor, self.height / factor);
        let cell = (factor * factor) as f32;
        let mut counts = vec![vec![0u32; w * h]; self.region_count];
        for y in 0..self.height {
            for x in 0..self.width {
                let region = self.indices[y * self.width + x] as usize;
                counts[region][(y / factor) * w + x / factor] += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|c| c.into_iter().map(|n| n as f32 / cell).collect())
            .collect())
    }

    /// The composited region colors.
    pub fn color_image(&self) -> RgbImage {
        let raw: Vec<u8> = self.colors.iter().flatten().copied().collect();
        RgbImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let p = (y as usize * self.width + x as usize) * 3;
            image::Rgb([raw[p], raw[p + 1], raw[p + 2]])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::canvas::GridRect;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_canvas(rng: &mut StdRng) -> Result<Canvas> {
        let mut builder = Canvas::builder().background("bg", None);
        for i in 0..rng.random_range(0..6) {
            let x0 = rng.random_range(0..89);
            let y0 = rng.random_range(0..89);
            let x1 = rng.random_range(x0 + 1..=CANVAS_GRID);
            let y1 = rng.random_range(y0 + 1..=CANVAS_GRID);
            builder = builder.region(GridRect::new(x0, y0, x1, y1)?, format!("r{i}"), None);
        }
        builder.build()
    }

    #[test]
    fn topmost_region_owns_each_pixel() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let canvas = random_canvas(&mut rng)?;
            let (w, h) = (rng.random_range(1..64), rng.random_range(1..64));
            let grid = render_to_grid(&canvas, w, h);
            for y in 0..h {
                for x in 0..w {
                    let gx = (x as f64 + 0.5) * CANVAS_GRID as f64 / w as f64;
                    let gy = (y as f64 + 0.5) * CANVAS_GRID as f64 / h as f64;
                    let containing: Vec<&crate::models::canvas::Region> = canvas
                        .regions()
                        .iter()
                        .filter(|r| r.bounds.contains(gx, gy))
                        .collect();
                    let top = containing.iter().max_by_key(|r| r.z_order).unwrap();
                    assert_eq!(grid.region_at(x, y), top.z_order);
                    assert_eq!(grid.coverage_at(x, y), containing.len() as u32);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn colors_follow_paint_order() -> Result<()> {
        let canvas = Canvas::builder()
            .background("field", Some([0, 128, 0]))
            .region(GridRect::new(0, 0, 45, 90)?, "shadow", None)
            .region(GridRect::new(30, 0, 60, 90)?, "barn", Some([255, 0, 0]))
            .build()?;
        let grid = render_to_grid(&canvas, 9, 1);
        let owners: Vec<u32> = (0..9).map(|x| grid.region_at(x, 0)).collect();
        assert_eq!(owners, vec![1, 1, 1, 2, 2, 2, 0, 0, 0]);
        // The shadow has no color of its own.
        assert_eq!(grid.color_at(0, 0), [0, 128, 0]);
        assert_eq!(grid.color_at(4, 0), [255, 0, 0]);
        let image = grid.color_image();
        assert_eq!(image.dimensions(), (9, 1));
        assert_eq!(image.get_pixel(4, 0).0, [255, 0, 0]);
        Ok(())
    }

    #[test]
    fn pooled_masks_partition_the_latent() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            let canvas = random_canvas(&mut rng)?;
            let grid = render_to_grid(&canvas, 64, 48);
            let masks = grid.downsample_masks(8)?;
            assert_eq!(masks.len(), canvas.regions().len());
            for p in 0..(8 * 6) {
                let total: f32 = masks.iter().map(|m| m[p]).sum();
                assert!((total - 1.0).abs() < 1e-6);
            }
        }
        assert!(render_to_grid(&Canvas::builder().build()?, 60, 64)
            .downsample_masks(8)
            .is_err());
        Ok(())
    }

    #[test]
    fn binary_mask_matches_indices() -> Result<()> {
        let canvas = Canvas::builder()
            .region(GridRect::new(45, 45, 90, 90)?, "corner", None)
            .build()?;
        let grid = render_to_grid(&canvas, 2, 2);
        assert_eq!(grid.mask(1), vec![0.0, 0.0, 0.0, 1.0]);
        assert_eq!(grid.mask(0), vec![1.0, 1.0, 1.0, 0.0]);
        Ok(())
    }
}
