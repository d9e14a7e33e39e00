use std::path::Path;

use anyhow::{bail, Result};
use glam::Vec3;
use image::DynamicImage;
use serde::Deserialize;

use crate::mesh::load_dynamic_image;

/// Row count of the gradient strip built from color stops.
pub const GRADIENT_ROWS: u32 = 2048;

const BIN_GRID_COLS: u32 = 8;
const BIN_GRID_ROWS: u32 = 4;
const MAX_BINS: usize = 16;

/// Environment source in the scene descriptor: a file path, or a list of
/// color stops interpolated into a vertical gradient.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentSpec {
    Path(String),
    Stops(Vec<[f32; 3]>),
}

/// RGBA32F radiance map plus the bright-region bins handed to the tracer as
/// a uniform array.
pub struct Environment {
    pub pixels: Vec<[f32; 4]>,
    pub width: u32,
    pub height: u32,
    pub bins: Vec<[u32; 4]>,
}

impl Environment {
    pub fn from_spec(spec: Option<&EnvironmentSpec>, root: &Path) -> Result<Self> {
        match spec {
            None => Ok(Self::gradient(&[[0.5, 0.5, 0.5]])),
            Some(EnvironmentSpec::Stops(stops)) => {
                if stops.is_empty() {
                    bail!("environment gradient needs at least one color stop");
                }
                Ok(Self::gradient(stops))
            }
            Some(EnvironmentSpec::Path(path)) => {
                Self::from_image(&load_dynamic_image(&root.join(path))?)
            }
        }
    }

    /// A 1-wide strip whose rows are partitioned evenly across the stop
    /// intervals and linearly interpolated within each.
    pub fn gradient(stops: &[[f32; 3]]) -> Self {
        let mut pixels = Vec::with_capacity(GRADIENT_ROWS as usize);
        if stops.len() < 2 {
            let c = stops.first().copied().unwrap_or([0.5; 3]);
            pixels.resize(GRADIENT_ROWS as usize, [c[0], c[1], c[2], 1.0]);
        } else {
            let intervals = (stops.len() - 1) as f32;
            for row in 0..GRADIENT_ROWS {
                let position = row as f32 * intervals / GRADIENT_ROWS as f32;
                let segment = (position as usize).min(stops.len() - 2);
                let t = position - segment as f32;
                let a = Vec3::from_array(stops[segment]);
                let b = Vec3::from_array(stops[segment + 1]);
                let c = a.lerp(b, t);
                pixels.push([c.x, c.y, c.z, 1.0]);
            }
        }
        Self {
            pixels,
            width: 1,
            height: GRADIENT_ROWS,
            bins: vec![[0, 0, 1, GRADIENT_ROWS]],
        }
    }

    pub fn from_image(image: &DynamicImage) -> Result<Self> {
        let rgb = image.to_rgb32f();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            bail!("environment image is empty");
        }
        let pixels: Vec<[f32; 4]> = rgb
            .pixels()
            .map(|p| [p.0[0], p.0[1], p.0[2], 1.0])
            .collect();
        let bins = radiance_bins(&pixels, width, height);
        Ok(Self {
            pixels,
            width,
            height,
            bins,
        })
    }
}

fn luminance(texel: &[f32; 4]) -> f32 {
    0.2126 * texel[0] + 0.7152 * texel[1] + 0.0722 * texel[2]
}

/// Reduces the map to a coarse grid and keeps the cells brighter than the
/// mean, brightest first. The whole image is the fallback bin so the shader
/// always has at least one region to sample.
fn radiance_bins(pixels: &[[f32; 4]], width: u32, height: u32) -> Vec<[u32; 4]> {
    let cols = BIN_GRID_COLS.min(width);
    let rows = BIN_GRID_ROWS.min(height);
    let mut cells = vec![0.0f32; (cols * rows) as usize];
    for y in 0..height {
        let row = (y * rows / height).min(rows - 1);
        for x in 0..width {
            let col = (x * cols / width).min(cols - 1);
            cells[(row * cols + col) as usize] += luminance(&pixels[(y * width + x) as usize]);
        }
    }

    let mean = cells.iter().sum::<f32>() / cells.len() as f32;
    let mut bright: Vec<(f32, [u32; 4])> = cells
        .iter()
        .enumerate()
        .filter(|&(_, &lum)| lum > mean)
        .map(|(index, &lum)| {
            let col = index as u32 % cols;
            let row = index as u32 / cols;
            let x0 = col * width / cols;
            let x1 = (col + 1) * width / cols;
            let y0 = row * height / rows;
            let y1 = (row + 1) * height / rows;
            (lum, [x0, y0, x1 - x0, y1 - y0])
        })
        .collect();
    bright.sort_by(|a, b| b.0.total_cmp(&a.0));
    bright.truncate(MAX_BINS);

    if bright.is_empty() {
        return vec![[0, 0, width, height]];
    }
    bright.into_iter().map(|(_, rect)| rect).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_interpolates_between_stops() {
        let env = Environment::gradient(&[[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]]);
        assert_eq!(env.width, 1);
        assert_eq!(env.height, GRADIENT_ROWS);
        assert_eq!(env.pixels.len(), GRADIENT_ROWS as usize);
        assert_eq!(env.pixels[0][0], 0.0);
        let last = env.pixels[GRADIENT_ROWS as usize - 1][0];
        assert!(last > 0.99);
        let mid = env.pixels[GRADIENT_ROWS as usize / 2][0];
        assert!((mid - 0.5).abs() < 0.01);
    }

    #[test]
    fn single_stop_is_constant() {
        let env = Environment::gradient(&[[0.25, 0.5, 0.75]]);
        assert!(env
            .pixels
            .iter()
            .all(|p| *p == [0.25, 0.5, 0.75, 1.0]));
        assert_eq!(env.bins, vec![[0, 0, 1, GRADIENT_ROWS]]);
    }

    #[test]
    fn three_stops_partition_rows_evenly() {
        let env = Environment::gradient(&[[0.0; 3], [1.0; 3], [0.0; 3]]);
        // The middle stop peaks at the halfway row.
        let mid = env.pixels[GRADIENT_ROWS as usize / 2][0];
        assert!(mid > 0.99);
    }

    #[test]
    fn bright_region_dominates_the_bins() {
        // Dark image with a bright top-left quadrant.
        let width = 64;
        let height = 32;
        let mut pixels = vec![[0.01, 0.01, 0.01, 1.0]; (width * height) as usize];
        for y in 0..8 {
            for x in 0..8 {
                pixels[(y * width + x) as usize] = [50.0, 50.0, 50.0, 1.0];
            }
        }
        let bins = radiance_bins(&pixels, width, height);
        assert!(!bins.is_empty());
        let first = bins[0];
        assert_eq!(first[0], 0);
        assert_eq!(first[1], 0);
    }

    #[test]
    fn uniform_image_falls_back_to_one_full_bin() {
        let pixels = vec![[1.0, 1.0, 1.0, 1.0]; 64];
        let bins = radiance_bins(&pixels, 8, 8);
        assert_eq!(bins, vec![[0, 0, 8, 8]]);
    }
}
