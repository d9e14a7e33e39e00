use std::path::Path;

use anyhow::{Context, Result};
use glam::Vec3;
use image::DynamicImage;

use crate::atlas::AtlasBuilder;
use crate::mesh::{load_dynamic_image, GroupMaterial};
use crate::scene::{Overrides, TexRef};

pub const DEFAULT_IOR: f32 = 1.4;
pub const DEFAULT_DIELECTRIC: f32 = -1.0;

const FALLBACK_DIFFUSE: Vec3 = Vec3::new(0.5, 0.5, 0.5);
const FALLBACK_ROUGHNESS: Vec3 = Vec3::new(0.0, 0.3, 0.0);
const FALLBACK_EMISSION: Vec3 = Vec3::ZERO;
const FALLBACK_NORMAL: Vec3 = Vec3::new(0.5, 0.5, 1.0);

/// Resolved shading inputs for one triangle group: four atlas slice indices
/// plus the scalar surface parameters that ride along in the material buffer.
#[derive(Debug, Clone)]
pub struct Material {
    pub diffuse: i32,
    pub roughness: i32,
    pub normal: i32,
    pub emission: i32,
    pub emittance: Vec3,
    pub ior: f32,
    pub dielectric: f32,
}

/// Builds a material for one group. Precedence per slot: the mesh material's
/// own texture, then its color, then the prop override (path or color), then
/// the fallback constant.
pub fn resolve(
    group: &GroupMaterial,
    overrides: &Overrides,
    root: &Path,
    atlas: &mut AtlasBuilder,
) -> Result<Material> {
    let swizzle = overrides.mr_swizzle.as_deref();

    let diffuse = if let Some(texture) = &group.diffuse_texture {
        atlas.add_image(&srgb_to_linear(texture), None)?
    } else if let Some(color) = group.diffuse_color {
        atlas.add_color(color)
    } else {
        match overrides.diffuse.as_ref().or(overrides.reflectance.as_ref()) {
            Some(TexRef::Path(path)) => {
                atlas.add_image(&srgb_to_linear(&load_override(root, path)?), None)?
            }
            Some(TexRef::Color(color)) => atlas.add_color(Vec3::from_array(*color)),
            None => atlas.add_color(FALLBACK_DIFFUSE),
        }
    };

    let roughness = if let Some(texture) = &group.roughness_texture {
        atlas.add_image(texture, swizzle)?
    } else if let Some(color) = group.roughness_color {
        atlas.add_color(color)
    } else {
        match overrides.metallic_roughness.as_ref() {
            Some(TexRef::Path(path)) => atlas.add_image(&load_override(root, path)?, swizzle)?,
            Some(TexRef::Color(color)) => atlas.add_color(Vec3::from_array(*color)),
            None => atlas.add_color(FALLBACK_ROUGHNESS),
        }
    };

    let emission = if let Some(texture) = &group.emissive_texture {
        atlas.add_image(texture, None)?
    } else if let Some(color) = group.emissive_color {
        atlas.add_color(color)
    } else {
        match overrides.emission.as_deref() {
            Some(path) => atlas.add_image(&load_override(root, path)?, None)?,
            None => atlas.add_color(FALLBACK_EMISSION),
        }
    };

    let normal = if let Some(texture) = &group.normal_texture {
        atlas.add_image(texture, None)?
    } else {
        match overrides.normal.as_deref() {
            Some(path) => atlas.add_image(&load_override(root, path)?, None)?,
            None => atlas.add_color(FALLBACK_NORMAL),
        }
    };

    Ok(Material {
        diffuse,
        roughness,
        normal,
        emission,
        emittance: overrides.emittance_vec(),
        ior: group.ior.or(overrides.ior).unwrap_or(DEFAULT_IOR),
        dielectric: overrides.dielectric.unwrap_or(DEFAULT_DIELECTRIC),
    })
}

fn load_override(root: &Path, path: &str) -> Result<DynamicImage> {
    load_dynamic_image(&root.join(path))
        .with_context(|| format!("loading override texture {path}"))
}

/// Albedo maps arrive gamma encoded but the atlas holds linear data.
fn srgb_to_linear(image: &DynamicImage) -> DynamicImage {
    let mut rgba = image.to_rgba8();
    for pixel in rgba.pixels_mut() {
        for channel in &mut pixel.0[..3] {
            *channel = ((*channel as f32 / 255.0).powf(2.2) * 255.0) as u8;
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_overrides() -> Overrides {
        Overrides::default()
    }

    #[test]
    fn fallbacks_fill_every_slot() {
        let mut atlas = AtlasBuilder::new(2);
        let material = resolve(
            &GroupMaterial::default(),
            &empty_overrides(),
            Path::new("."),
            &mut atlas,
        )
        .unwrap();

        assert_eq!(material.diffuse, 0);
        assert_eq!(material.roughness, 1);
        assert_eq!(material.emission, 2);
        assert_eq!(material.normal, 3);
        assert_eq!(material.emittance, Vec3::ZERO);
        assert_eq!(material.ior, DEFAULT_IOR);
        assert_eq!(material.dielectric, DEFAULT_DIELECTRIC);
    }

    #[test]
    fn mesh_colors_outrank_overrides() {
        let mut atlas = AtlasBuilder::new(2);
        let group = GroupMaterial {
            diffuse_color: Some(Vec3::new(0.9, 0.1, 0.1)),
            ..Default::default()
        };
        let overrides = Overrides {
            diffuse: Some(TexRef::Color([0.0, 1.0, 0.0])),
            ..Default::default()
        };
        let with_group = resolve(&group, &overrides, Path::new("."), &mut atlas).unwrap();
        let without_group = resolve(
            &GroupMaterial::default(),
            &overrides,
            Path::new("."),
            &mut atlas,
        )
        .unwrap();
        assert_ne!(with_group.diffuse, without_group.diffuse);
    }

    #[test]
    fn reflectance_substitutes_for_a_missing_diffuse_override() {
        let mut atlas = AtlasBuilder::new(2);
        let overrides = Overrides {
            reflectance: Some(TexRef::Color([0.25, 0.25, 0.75])),
            ..Default::default()
        };
        let material = resolve(
            &GroupMaterial::default(),
            &overrides,
            Path::new("."),
            &mut atlas,
        )
        .unwrap();
        let direct = atlas.add_color(Vec3::new(0.25, 0.25, 0.75));
        assert_eq!(material.diffuse, direct);
    }

    #[test]
    fn prop_scalars_fall_through_material_first() {
        let mut atlas = AtlasBuilder::new(2);
        let group = GroupMaterial {
            ior: Some(1.9),
            ..Default::default()
        };
        let overrides = Overrides {
            ior: Some(1.1),
            dielectric: Some(1.0),
            emittance: Some([2.0, 2.0, 2.0]),
            ..Default::default()
        };
        let material = resolve(&group, &overrides, Path::new("."), &mut atlas).unwrap();
        assert_eq!(material.ior, 1.9);
        assert_eq!(material.dielectric, 1.0);
        assert_eq!(material.emittance, Vec3::splat(2.0));
    }
}
