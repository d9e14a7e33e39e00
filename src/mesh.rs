use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use glam::{Mat4, Quat, Vec2, Vec3, Vec4, Vec4Swizzles};
use image::DynamicImage;
use log::warn;
use russimp::material::{DataContent, Material as AiMaterial, PropertyTypeInfo, TextureType};
use russimp::node::Node as AiNode;
use russimp::scene::{PostProcess::*, Scene as AiScene};

use crate::triangle::Triangle;

/// Shading inputs recovered from one material group of a mesh file. Each
/// field is optional; the material resolver decides the fallbacks.
#[derive(Default)]
pub struct GroupMaterial {
    pub diffuse_texture: Option<DynamicImage>,
    pub diffuse_color: Option<Vec3>,
    pub roughness_texture: Option<DynamicImage>,
    pub roughness_color: Option<Vec3>,
    pub emissive_texture: Option<DynamicImage>,
    pub emissive_color: Option<Vec3>,
    pub normal_texture: Option<DynamicImage>,
    pub ior: Option<f32>,
}

pub struct MeshGroup {
    pub triangles: Vec<Triangle>,
    pub material: GroupMaterial,
}

/// Loads a mesh file into per-material triangle groups. Triangulation,
/// smooth normals and tangent space come from the importer's post-process
/// pipeline; transforms are flattened by walking the node graph.
pub fn load(path: &Path) -> Result<Vec<MeshGroup>> {
    let scene = AiScene::from_file(
        path.to_str().context("mesh path is not valid UTF-8")?,
        vec![
            Triangulate,
            JoinIdenticalVertices,
            SortByPrimitiveType,
            GenerateSmoothNormals,
            GenerateUVCoords,
            CalculateTangentSpace,
            EmbedTextures,
            ImproveCacheLocality,
        ],
    )
    .map_err(anyhow::Error::msg)
    .with_context(|| format!("loading mesh {}", path.display()))?;

    let mut groups: Vec<Vec<Triangle>> = vec![Vec::new(); scene.materials.len().max(1)];
    if let Some(root) = scene.root.as_ref() {
        walk_node_graph(&scene, root, Mat4::IDENTITY, &mut groups);
    }

    let mut out = Vec::new();
    for (index, triangles) in groups.into_iter().enumerate() {
        if triangles.is_empty() {
            continue;
        }
        let material = scene
            .materials
            .get(index)
            .map(|m| read_material(m, path))
            .unwrap_or_default();
        out.push(MeshGroup {
            triangles,
            material,
        });
    }
    if out.is_empty() {
        bail!("mesh {} contains no triangles", path.display());
    }
    Ok(out)
}

fn walk_node_graph(scene: &AiScene, node: &AiNode, parent: Mat4, groups: &mut [Vec<Triangle>]) {
    let local = Mat4::from_cols_array_2d(&[
        [
            node.transformation.a1,
            node.transformation.b1,
            node.transformation.c1,
            node.transformation.d1,
        ],
        [
            node.transformation.a2,
            node.transformation.b2,
            node.transformation.c2,
            node.transformation.d2,
        ],
        [
            node.transformation.a3,
            node.transformation.b3,
            node.transformation.c3,
            node.transformation.d3,
        ],
        [
            node.transformation.a4,
            node.transformation.b4,
            node.transformation.c4,
            node.transformation.d4,
        ],
    ]);
    let trs = parent * local;
    let (scale, rotation, _) = trs.to_scale_rotation_translation();

    for &mesh_index in &node.meshes {
        let mesh = &scene.meshes[mesh_index as usize];
        let uv_set = mesh.texture_coords.first().and_then(|set| set.as_ref());
        for face in &mesh.faces {
            // Points and lines end up in their own meshes after
            // SortByPrimitiveType; skip anything that is not a triangle.
            if face.0.len() != 3 {
                continue;
            }
            let mut verts = [Vec3::ZERO; 3];
            let mut uvs = [Vec2::ZERO; 3];
            let mut normals = [Vec3::ZERO; 3];
            let mut tangents = [Vec3::ZERO; 3];
            let mut bitangents = [Vec3::ZERO; 3];
            for (slot, &vertex_index) in face.0.iter().enumerate() {
                let i = vertex_index as usize;
                let v = &mesh.vertices[i];
                verts[slot] = (trs * Vec4::new(v.x, v.y, v.z, 1.0)).xyz();
                normals[slot] = rotate_direction(
                    mesh.normals.get(i).map(|n| Vec3::new(n.x, n.y, n.z)),
                    rotation,
                    scale,
                );
                tangents[slot] = rotate_direction(
                    mesh.tangents.get(i).map(|t| Vec3::new(t.x, t.y, t.z)),
                    rotation,
                    scale,
                );
                if tangents[slot] == Vec3::ZERO {
                    tangents[slot] = normals[slot].any_orthonormal_vector();
                }
                bitangents[slot] = rotate_direction(
                    mesh.bitangents.get(i).map(|b| Vec3::new(b.x, b.y, b.z)),
                    rotation,
                    scale,
                );
                if bitangents[slot] == Vec3::ZERO {
                    bitangents[slot] = normals[slot].cross(tangents[slot]);
                }
                if let Some(set) = uv_set {
                    if let Some(uv) = set.get(i) {
                        uvs[slot] = Vec2::new(uv.x, uv.y);
                    }
                }
            }
            groups[mesh.material_index as usize].push(Triangle::new(
                verts, uvs, normals, tangents, bitangents, 0,
            ));
        }
    }

    for child in node.children.borrow().iter() {
        walk_node_graph(scene, child, trs, groups);
    }
}

fn rotate_direction(v: Option<Vec3>, rotation: Quat, scale: Vec3) -> Vec3 {
    match v {
        Some(v) => (rotation * (v / scale)).normalize_or_zero(),
        None => Vec3::ZERO,
    }
}

fn read_material(material: &AiMaterial, mesh_path: &Path) -> GroupMaterial {
    let mut out = GroupMaterial {
        diffuse_texture: load_texture(material, TextureType::Diffuse, mesh_path),
        roughness_texture: load_texture(material, TextureType::Roughness, mesh_path)
            .or_else(|| load_texture(material, TextureType::Metalness, mesh_path)),
        emissive_texture: load_texture(material, TextureType::Emissive, mesh_path),
        normal_texture: load_texture(material, TextureType::Normals, mesh_path)
            .or_else(|| load_texture(material, TextureType::Height, mesh_path)),
        diffuse_color: load_color(material, "$clr.diffuse"),
        emissive_color: load_color(material, "$clr.emissive"),
        ..Default::default()
    };

    let metallic = load_float(material, "$mat.metallicFactor");
    let roughness = load_float(material, "$mat.roughnessFactor");
    if metallic.is_some() || roughness.is_some() {
        // Packed the glTF way: roughness in green, metallic in blue.
        out.roughness_color = Some(Vec3::new(
            0.0,
            roughness.unwrap_or(0.3),
            metallic.unwrap_or(0.0),
        ));
    }
    out.ior = load_float(material, "$mat.refracti").filter(|&ior| ior > 0.0);
    out
}

fn load_texture(material: &AiMaterial, kind: TextureType, mesh_path: &Path) -> Option<DynamicImage> {
    let texture = material.textures.get(&kind)?;
    let texture = texture.borrow();

    let embedded = match &texture.data {
        DataContent::Texel(texels) => {
            let raw = texels
                .iter()
                .flat_map(|c| [c.r, c.g, c.b, c.a])
                .collect::<Vec<_>>();
            image::RgbaImage::from_vec(texture.width, texture.height, raw)
                .map(DynamicImage::ImageRgba8)
        }
        DataContent::Bytes(bytes) => image::io::Reader::new(Cursor::new(bytes))
            .with_guessed_format()
            .ok()
            .and_then(|reader| reader.decode().ok()),
    };
    if embedded.is_some() {
        return embedded;
    }

    // Not embedded; resolve the texture file next to the mesh.
    if texture.filename.is_empty() {
        return None;
    }
    let dir = mesh_path.parent().unwrap_or_else(|| Path::new("."));
    match load_dynamic_image(&dir.join(&texture.filename)) {
        Ok(image) => Some(image),
        Err(err) => {
            warn!(
                "dropping {kind:?} texture {}: {err:#}",
                texture.filename
            );
            None
        }
    }
}

fn load_color(material: &AiMaterial, key: &str) -> Option<Vec3> {
    let values = load_float_array(material, key)?;
    Some(Vec3::new(
        values.first().copied()?,
        values.get(1).copied().unwrap_or(0.0),
        values.get(2).copied().unwrap_or(0.0),
    ))
}

fn load_float(material: &AiMaterial, key: &str) -> Option<f32> {
    load_float_array(material, key)?.first().copied()
}

fn load_float_array(material: &AiMaterial, key: &str) -> Option<Vec<f32>> {
    let prop = material.properties.iter().find(|p| p.key == key)?;
    match &prop.data {
        PropertyTypeInfo::FloatArray(values) => Some(values.clone()),
        _ => None,
    }
}

/// The image crate does not decode .hdr files as HDR by default.
pub fn load_dynamic_image(path: &Path) -> Result<DynamicImage> {
    if path.extension().is_some_and(|ext| ext == "hdr") {
        let file = std::fs::File::open(path)
            .with_context(|| format!("opening image {}", path.display()))?;
        let decoder = image::codecs::hdr::HdrDecoder::new(std::io::BufReader::new(file))
            .with_context(|| format!("decoding {}", path.display()))?;
        let width = decoder.metadata().width;
        let height = decoder.metadata().height;
        let texels = decoder
            .read_image_hdr()
            .with_context(|| format!("decoding {}", path.display()))?;
        let buffer = image::ImageBuffer::from_vec(
            width,
            height,
            texels.into_iter().flat_map(|c| [c[0], c[1], c[2]]).collect(),
        )
        .context("HDR texel count mismatch")?;
        return Ok(DynamicImage::ImageRgb32F(buffer));
    }

    image::io::Reader::open(path)
        .with_context(|| format!("opening image {}", path.display()))?
        .decode()
        .with_context(|| format!("decoding {}", path.display()))
}
