use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use glam::Vec3;
use image::RgbaImage;
use log::{info, warn};
use serde::Deserialize;

use crate::aabb::Aabb;
use crate::atlas::AtlasBuilder;
use crate::bvh::{Bvh, BvhBuilder};
use crate::environment::{Environment, EnvironmentSpec};
use crate::material::{self, Material};
use crate::mesh;
use crate::pack::{self, PackedBuffer};
use crate::triangle::Triangle;

/// Texture reference in a prop override: a path loads an image, an inline
/// color becomes a solid atlas slice.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TexRef {
    Path(String),
    Color([f32; 3]),
}

/// Per-prop material overrides. `worldTransforms` uses the same shape as
/// scene-wide defaults; a prop's own fields win field by field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Overrides {
    pub emittance: Option<[f32; 3]>,
    pub reflectance: Option<TexRef>,
    pub diffuse: Option<TexRef>,
    #[serde(rename = "metallicRoughness")]
    pub metallic_roughness: Option<TexRef>,
    pub normal: Option<String>,
    pub emission: Option<String>,
    pub ior: Option<f32>,
    pub dielectric: Option<f32>,
    #[serde(rename = "mrSwizzle")]
    pub mr_swizzle: Option<String>,
}

impl Overrides {
    pub fn merged(&self, world: Option<&Overrides>) -> Overrides {
        let Some(world) = world else {
            return self.clone();
        };
        Overrides {
            emittance: self.emittance.or(world.emittance),
            reflectance: self
                .reflectance
                .clone()
                .or_else(|| world.reflectance.clone()),
            diffuse: self.diffuse.clone().or_else(|| world.diffuse.clone()),
            metallic_roughness: self
                .metallic_roughness
                .clone()
                .or_else(|| world.metallic_roughness.clone()),
            normal: self.normal.clone().or_else(|| world.normal.clone()),
            emission: self.emission.clone().or_else(|| world.emission.clone()),
            ior: self.ior.or(world.ior),
            dielectric: self.dielectric.or(world.dielectric),
            mr_swizzle: self
                .mr_swizzle
                .clone()
                .or_else(|| world.mr_swizzle.clone()),
        }
    }

    pub fn emittance_vec(&self) -> Vec3 {
        Vec3::from_array(self.emittance.unwrap_or_default())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Prop {
    pub path: String,
    #[serde(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SceneDescriptor {
    #[serde(default)]
    pub props: Vec<Prop>,
    #[serde(default)]
    pub static_props: Vec<Prop>,
    #[serde(default)]
    pub animated_props: Vec<Prop>,
    pub environment: Option<EnvironmentSpec>,
    #[serde(rename = "cameraPos", default = "default_camera_pos")]
    pub camera_pos: [f32; 3],
    #[serde(rename = "cameraDir", default = "default_camera_dir")]
    pub camera_dir: [f32; 3],
    #[serde(rename = "fovScale", default = "one")]
    pub fov_scale: f32,
    #[serde(rename = "environmentTheta", default)]
    pub environment_theta: f32,
    #[serde(default = "one")]
    pub exposure: f32,
    #[serde(default = "default_samples")]
    pub samples: u32,
    pub normalize: Option<f32>,
    #[serde(rename = "worldTransforms", default)]
    pub world_transforms: Option<Overrides>,
    #[serde(rename = "atlasRes", default = "default_atlas_res")]
    pub atlas_res: u32,
}

fn default_camera_pos() -> [f32; 3] {
    [0.0, 0.0, -2.0]
}

fn default_camera_dir() -> [f32; 3] {
    [0.0, 0.0, 1.0]
}

fn one() -> f32 {
    1.0
}

fn default_samples() -> u32 {
    512
}

fn default_atlas_res() -> u32 {
    1024
}

/// Run mode tags from the launch parameters, underscore-joined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunMode {
    pub test: bool,
    pub nee: bool,
    pub alpha: bool,
}

impl RunMode {
    pub fn parse(tags: &str) -> Self {
        let mut mode = Self::default();
        for tag in tags.split('_') {
            match tag {
                "" => {}
                "test" => mode.test = true,
                "nee" => mode.nee = true,
                "alpha" => mode.alpha = true,
                other => warn!("ignoring unrecognized mode tag \"{other}\""),
            }
        }
        mode
    }
}

pub struct SceneBuffers {
    pub bvh: PackedBuffer,
    pub triangles: PackedBuffer,
    pub normals: PackedBuffer,
    pub uvs: PackedBuffer,
    pub materials: PackedBuffer,
    pub lights: PackedBuffer,
}

pub struct CompiledScene {
    pub triangles: Vec<Triangle>,
    pub materials: Vec<Material>,
    pub bvh: Bvh,
    pub buffers: SceneBuffers,
    /// Inclusive `(first, last)` light-triangle ordinals per emissive group;
    /// `(-1, -1)` when the scene has no lights.
    pub light_ranges: Vec<[i32; 2]>,
    pub atlas_layers: Vec<RgbaImage>,
    pub atlas_res: u32,
    pub environment: Environment,
    pub defines: Vec<(String, String)>,
    pub bounds: Aabb,
    pub camera_pos: Vec3,
    pub camera_dir: Vec3,
    pub fov_scale: f32,
    pub environment_theta: f32,
    pub exposure: f32,
    pub samples: u32,
}

pub fn load_descriptor(path: &Path) -> Result<SceneDescriptor> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading scene descriptor {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parsing scene descriptor {}", path.display()))
}

/// Runs the whole compile pipeline: prop merge, mesh loading, material
/// resolution, optional normalization, BVH construction and buffer packing.
pub fn compile(
    descriptor: &SceneDescriptor,
    root: &Path,
    mode: RunMode,
    leaf_size: usize,
) -> Result<CompiledScene> {
    let started = Instant::now();

    let props: Vec<&Prop> = descriptor
        .props
        .iter()
        .chain(&descriptor.static_props)
        .chain(&descriptor.animated_props)
        .collect();
    if props.is_empty() {
        bail!("scene descriptor lists no props");
    }

    let mut atlas = AtlasBuilder::new(descriptor.atlas_res);
    let mut triangles: Vec<Triangle> = Vec::new();
    let mut materials: Vec<Material> = Vec::new();
    let mut light_groups: Vec<(usize, usize)> = Vec::new();
    let mut bounds = Aabb::EMPTY;

    for prop in props {
        let overrides = prop.overrides.merged(descriptor.world_transforms.as_ref());
        let groups = mesh::load(&root.join(&prop.path))?;
        for group in groups {
            let material_index = materials.len() as u32;
            let material = material::resolve(&group.material, &overrides, root, &mut atlas)?;
            let emissive = material.emittance.dot(Vec3::ONE) > 0.0;
            materials.push(material);

            let start = triangles.len();
            for mut triangle in group.triangles {
                triangle.material = material_index;
                bounds.grow_aabb(triangle.bounds());
                triangles.push(triangle);
            }
            if emissive {
                light_groups.push((start, triangles.len() - start));
            }
        }
    }

    if let Some(half_extent) = descriptor.normalize {
        bounds = normalize_triangles(&mut triangles, &bounds, half_extent);
    }

    let bvh = BvhBuilder::new(&triangles)
        .leaf_size(leaf_size)
        .build()?;
    let flat = bvh.flatten();
    info!(
        "compiled {} triangles into {} BVH nodes (depth {}) in {:.2?}",
        triangles.len(),
        bvh.node_count,
        bvh.depth,
        started.elapsed()
    );

    let light_ids: Vec<u32> = light_groups
        .iter()
        .flat_map(|&(start, len)| (start..start + len).map(|i| i as u32))
        .collect();
    let light_ranges = light_ranges(&light_groups);

    let environment = Environment::from_spec(descriptor.environment.as_ref(), root)?;

    let buffers = SceneBuffers {
        bvh: pack::pack_bvh(&flat.nodes),
        triangles: pack::pack_triangles(&triangles, &flat.triangle_order),
        normals: pack::pack_normals(&triangles, &flat.triangle_order),
        uvs: pack::pack_uvs(&triangles, &flat.triangle_order),
        materials: pack::pack_materials(&triangles, &flat.triangle_order, &materials),
        lights: pack::pack_lights(&triangles, &light_ids),
    };

    let defines = shader_defines(environment.bins.len(), light_ranges.len(), leaf_size, mode);

    Ok(CompiledScene {
        triangles,
        materials,
        bvh,
        buffers,
        light_ranges,
        atlas_res: atlas.resolution(),
        atlas_layers: atlas.into_layers(),
        environment,
        defines,
        bounds,
        camera_pos: Vec3::from_array(descriptor.camera_pos),
        camera_dir: Vec3::from_array(descriptor.camera_dir).normalize_or_zero(),
        fov_scale: descriptor.fov_scale,
        environment_theta: descriptor.environment_theta,
        exposure: descriptor.exposure,
        samples: descriptor.samples,
    })
}

/// Rescales all positions so the longest scene extent becomes
/// `2 * half_extent` with the centroid at the origin. Returns the new bounds.
pub fn normalize_triangles(
    triangles: &mut [Triangle],
    bounds: &Aabb,
    half_extent: f32,
) -> Aabb {
    let longest = bounds.longest_extent();
    if longest <= 0.0 {
        return *bounds;
    }
    let center = bounds.centroid();
    let scale = 2.0 * half_extent / longest;
    let mut rescaled = Aabb::EMPTY;
    for triangle in triangles.iter_mut() {
        triangle.rescale(center, scale);
        rescaled.grow_aabb(triangle.bounds());
    }
    rescaled
}

/// Inclusive ordinal ranges into the light buffer, one per emissive group.
pub fn light_ranges(groups: &[(usize, usize)]) -> Vec<[i32; 2]> {
    let mut ranges = Vec::with_capacity(groups.len().max(1));
    let mut base = 0i32;
    for &(_, len) in groups {
        ranges.push([base, base + len as i32 - 1]);
        base += len as i32;
    }
    if ranges.is_empty() {
        ranges.push([-1, -1]);
    }
    ranges
}

/// Preprocessor directives injected into the fragment shaders.
pub fn shader_defines(
    env_bins: usize,
    num_light_ranges: usize,
    leaf_size: usize,
    mode: RunMode,
) -> Vec<(String, String)> {
    let mut defines = vec![
        ("ENV_BINS".to_string(), env_bins.max(1).to_string()),
        (
            "NUM_LIGHT_RANGES".to_string(),
            num_light_ranges.max(1).to_string(),
        ),
        ("LEAF_SIZE".to_string(), leaf_size.to_string()),
    ];
    if mode.nee {
        defines.push(("USE_EXPLICIT".to_string(), "1".to_string()));
    }
    if mode.alpha {
        defines.push(("USE_ALPHA".to_string(), "1".to_string()));
    }
    defines
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn descriptor_parses_with_defaults() {
        let descriptor: SceneDescriptor = serde_json::from_str(
            r#"{
                "props": [{ "path": "assets/bunny.obj", "emittance": [0, 0, 0] }],
                "static_props": [{ "path": "assets/plane.obj", "diffuse": [0.8, 0.8, 0.8] }],
                "environment": [[1.0, 0.9, 0.8], [0.1, 0.2, 0.3]],
                "cameraPos": [0, 1, -3],
                "samples": 64,
                "normalize": 1.0
            }"#,
        )
        .unwrap();

        assert_eq!(descriptor.props.len(), 1);
        assert_eq!(descriptor.static_props.len(), 1);
        assert_eq!(descriptor.animated_props.len(), 0);
        assert_eq!(descriptor.camera_pos, [0.0, 1.0, -3.0]);
        assert_eq!(descriptor.camera_dir, [0.0, 0.0, 1.0]);
        assert_eq!(descriptor.fov_scale, 1.0);
        assert_eq!(descriptor.samples, 64);
        assert_eq!(descriptor.normalize, Some(1.0));
        assert_eq!(descriptor.atlas_res, 1024);
        assert!(matches!(
            descriptor.static_props[0].overrides.diffuse,
            Some(TexRef::Color(_))
        ));
        assert!(matches!(
            descriptor.environment,
            Some(EnvironmentSpec::Stops(ref stops)) if stops.len() == 2
        ));
    }

    #[test]
    fn malformed_descriptor_is_an_error() {
        let result: Result<SceneDescriptor, _> = serde_json::from_str("{ \"props\": 3 }");
        assert!(result.is_err());
    }

    #[test]
    fn world_transforms_fill_missing_fields_only() {
        let world = Overrides {
            ior: Some(1.6),
            emittance: Some([1.0, 1.0, 1.0]),
            ..Default::default()
        };
        let prop = Overrides {
            ior: Some(1.2),
            ..Default::default()
        };
        let merged = prop.merged(Some(&world));
        assert_eq!(merged.ior, Some(1.2));
        assert_eq!(merged.emittance, Some([1.0, 1.0, 1.0]));
    }

    #[test]
    fn normalization_maps_scene_into_the_target_cube() {
        let mut triangles = vec![
            Triangle::from_verts(
                Vec3::new(-10.0, -10.0, -10.0),
                Vec3::new(10.0, -10.0, -10.0),
                Vec3::new(-10.0, 10.0, -10.0),
            ),
            Triangle::from_verts(
                Vec3::new(10.0, 10.0, 10.0),
                Vec3::new(-10.0, 10.0, 10.0),
                Vec3::new(10.0, -10.0, 10.0),
            ),
        ];
        let mut bounds = Aabb::EMPTY;
        for t in &triangles {
            bounds.grow_aabb(t.bounds());
        }

        let rescaled = normalize_triangles(&mut triangles, &bounds, 1.0);
        assert!(rescaled.centroid().abs_diff_eq(Vec3::ZERO, 1e-6));
        for triangle in &triangles {
            for v in &triangle.verts {
                assert!(v.abs().max_element() <= 1.0 + 1e-6);
            }
        }
    }

    #[test]
    fn light_ranges_accumulate_group_bases() {
        assert_eq!(
            light_ranges(&[(0, 3), (3, 2), (5, 4)]),
            vec![[0, 2], [3, 4], [5, 8]]
        );
        assert_eq!(light_ranges(&[]), vec![[-1, -1]]);
    }

    #[test]
    fn defines_reflect_the_run_mode() {
        let defines = shader_defines(4, 2, 4, RunMode::parse("nee_alpha"));
        assert!(defines.contains(&("ENV_BINS".to_string(), "4".to_string())));
        assert!(defines.contains(&("NUM_LIGHT_RANGES".to_string(), "2".to_string())));
        assert!(defines.contains(&("LEAF_SIZE".to_string(), "4".to_string())));
        assert!(defines.iter().any(|(k, _)| k == "USE_EXPLICIT"));
        assert!(defines.iter().any(|(k, _)| k == "USE_ALPHA"));

        let plain = shader_defines(1, 1, 4, RunMode::parse(""));
        assert!(!plain.iter().any(|(k, _)| k == "USE_EXPLICIT"));
    }

    #[test]
    fn mode_tags_parse_underscore_joined() {
        assert_eq!(
            RunMode::parse("test_nee"),
            RunMode {
                test: true,
                nee: true,
                alpha: false
            }
        );
        assert_eq!(RunMode::parse(""), RunMode::default());
    }
}
