use std::collections::HashMap;
use std::num::NonZeroU32;

use anyhow::{bail, Context, Result};
use fast_image_resize as fr;
use glam::Vec3;
use image::{DynamicImage, Rgba, RgbaImage};

/// Collects material images and flat colors into the slices of a square
/// RGBA8 texture array. Every caller gets back the integer index of its
/// slice; identical solid colors share one.
pub struct AtlasBuilder {
    resolution: u32,
    layers: Vec<RgbaImage>,
    solid_cache: HashMap<[u8; 4], i32>,
}

impl AtlasBuilder {
    pub fn new(resolution: u32) -> Self {
        assert!(resolution > 0, "atlas resolution must be positive");
        Self {
            resolution,
            layers: Vec::new(),
            solid_cache: HashMap::new(),
        }
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn add_image(&mut self, image: &DynamicImage, swizzle: Option<&str>) -> Result<i32> {
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        let src = fr::Image::from_vec_u8(
            NonZeroU32::new(width).context("zero-width texture")?,
            NonZeroU32::new(height).context("zero-height texture")?,
            rgba.into_raw(),
            fr::PixelType::U8x4,
        )?;

        let side = NonZeroU32::new(self.resolution).expect("checked in new");
        let mut dst = fr::Image::new(side, side, fr::PixelType::U8x4);
        let mut resizer = fr::Resizer::new(fr::ResizeAlg::Convolution(fr::FilterType::Lanczos3));
        resizer.resize(&src.view(), &mut dst.view_mut())?;

        let mut layer = RgbaImage::from_raw(self.resolution, self.resolution, dst.into_vec())
            .expect("resized layer has the requested dimensions");
        if let Some(spec) = swizzle {
            swizzle_channels(&mut layer, spec)?;
        }
        self.layers.push(layer);
        Ok(self.layers.len() as i32 - 1)
    }

    pub fn add_color(&mut self, color: Vec3) -> i32 {
        let texel = [to_u8(color.x), to_u8(color.y), to_u8(color.z), 255];
        if let Some(&index) = self.solid_cache.get(&texel) {
            return index;
        }
        let layer = RgbaImage::from_pixel(self.resolution, self.resolution, Rgba(texel));
        self.layers.push(layer);
        let index = self.layers.len() as i32 - 1;
        self.solid_cache.insert(texel, index);
        index
    }

    pub fn into_layers(self) -> Vec<RgbaImage> {
        self.layers
    }
}

fn to_u8(channel: f32) -> u8 {
    (channel.clamp(0.0, 1.0) * 255.0 + 0.5) as u8
}

/// Remaps channels in place, e.g. "bgr" moves blue into red's slot. Unnamed
/// trailing channels keep their values.
fn swizzle_channels(image: &mut RgbaImage, spec: &str) -> Result<()> {
    let mut mapping = Vec::with_capacity(spec.len());
    for c in spec.chars() {
        mapping.push(match c {
            'r' => 0,
            'g' => 1,
            'b' => 2,
            'a' => 3,
            other => bail!("invalid swizzle channel '{other}' in \"{spec}\""),
        });
    }
    if mapping.len() > 4 {
        bail!("swizzle \"{spec}\" names more than four channels");
    }
    for pixel in image.pixels_mut() {
        let source = pixel.0;
        for (slot, &from) in mapping.iter().enumerate() {
            pixel.0[slot] = source[from];
        }
    }
    Ok(())
}
