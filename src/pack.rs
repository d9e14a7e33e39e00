use crate::bvh::FlatNode;
use crate::material::Material;
use crate::triangle::Triangle;

/// Value written into every padding cell.
pub const PAD: f32 = -1.0;

/// A flat float array shaped into a 2D texture layout: `channels` floats per
/// pixel, records spanning a fixed number of pixels, tail padded with `PAD`.
#[derive(Debug, Clone)]
pub struct PackedBuffer {
    pub data: Vec<f32>,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
}

impl PackedBuffer {
    /// Shapes `data` into rows of whole records: the width is the smallest
    /// multiple of `pixels_per_record` at or above `sqrt(pixel count)`.
    pub fn from_records(mut data: Vec<f32>, channels: usize, pixels_per_record: usize) -> Self {
        debug_assert_eq!(data.len() % channels, 0);
        let pixels = data.len() / channels;
        let width = if pixels == 0 {
            pixels_per_record
        } else {
            ((pixels as f64).sqrt() / pixels_per_record as f64).ceil() as usize * pixels_per_record
        };
        let height = pixels.div_ceil(width).max(1);

        let padded = width * height * channels;
        assert!(padded >= data.len(), "buffer padding underflow");
        data.resize(padded, PAD);
        Self {
            data,
            width,
            height,
            channels,
        }
    }

}

/// 9 floats per node: the three index cells carried as bit-preserved casts,
/// then box min and max. Numeric conversion would corrupt the indices once
/// the shader reinterprets the cells, hence `from_bits`.
pub fn pack_bvh(nodes: &[FlatNode]) -> PackedBuffer {
    let mut data = Vec::with_capacity(nodes.len() * 9);
    for node in nodes {
        data.push(f32::from_bits(node.left as u32));
        data.push(f32::from_bits(node.right as u32));
        data.push(f32::from_bits(node.triangle_base as u32));
        data.extend_from_slice(&node.bounds_min);
        data.extend_from_slice(&node.bounds_max);
    }
    PackedBuffer::from_records(data, 3, 3)
}

/// 9 floats per triangle: the three vertex positions, in leaf-visit order.
pub fn pack_triangles(triangles: &[Triangle], order: &[u32]) -> PackedBuffer {
    let mut data = Vec::with_capacity(order.len() * 9);
    for &t in order {
        for v in &triangles[t as usize].verts {
            data.extend_from_slice(&v.to_array());
        }
    }
    PackedBuffer::from_records(data, 3, 3)
}

/// 27 floats per triangle: normal, tangent and bitangent for each vertex.
pub fn pack_normals(triangles: &[Triangle], order: &[u32]) -> PackedBuffer {
    let mut data = Vec::with_capacity(order.len() * 27);
    for &t in order {
        let tri = &triangles[t as usize];
        for i in 0..3 {
            data.extend_from_slice(&tri.normals[i].to_array());
            data.extend_from_slice(&tri.tangents[i].to_array());
            data.extend_from_slice(&tri.bitangents[i].to_array());
        }
    }
    PackedBuffer::from_records(data, 3, 9)
}

/// 6 floats per triangle: one UV pair per vertex, two floats per pixel.
pub fn pack_uvs(triangles: &[Triangle], order: &[u32]) -> PackedBuffer {
    let mut data = Vec::with_capacity(order.len() * 6);
    for &t in order {
        for uv in &triangles[t as usize].uvs {
            data.extend_from_slice(&uv.to_array());
        }
    }
    PackedBuffer::from_records(data, 2, 3)
}

/// 12 floats per triangle: the four atlas indices, two pad cells, emittance,
/// IOR, the dielectric sentinel and a final pad cell.
pub fn pack_materials(
    triangles: &[Triangle],
    order: &[u32],
    materials: &[Material],
) -> PackedBuffer {
    let mut data = Vec::with_capacity(order.len() * 12);
    for &t in order {
        let material = &materials[triangles[t as usize].material as usize];
        data.extend_from_slice(&[
            material.diffuse as f32,
            material.roughness as f32,
            material.normal as f32,
            material.emission as f32,
            PAD,
            PAD,
            material.emittance.x,
            material.emittance.y,
            material.emittance.z,
            material.ior,
            material.dielectric,
            PAD,
        ]);
    }
    PackedBuffer::from_records(data, 3, 4)
}

/// 9 floats per emissive triangle, grouped by light range.
pub fn pack_lights(triangles: &[Triangle], light_ids: &[u32]) -> PackedBuffer {
    let mut data = Vec::with_capacity(light_ids.len() * 9);
    for &t in light_ids {
        for v in &triangles[t as usize].verts {
            data.extend_from_slice(&v.to_array());
        }
    }
    PackedBuffer::from_records(data, 3, 3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn padding_is_sound(buffer: &PackedBuffer, payload: usize) {
        assert_eq!(buffer.data.len() % (buffer.channels * buffer.width), 0);
        assert_eq!(buffer.data.len(), buffer.width * buffer.height * buffer.channels);
        assert!(buffer.data[payload..].iter().all(|&c| c == PAD));
    }

    #[test]
    fn width_is_a_whole_number_of_records() {
        for records in [1usize, 2, 3, 7, 9, 100] {
            let data = vec![0.0; records * 9];
            let buffer = PackedBuffer::from_records(data, 3, 3);
            assert_eq!(buffer.width % 3, 0);
            padding_is_sound(&buffer, records * 9);
        }
    }

    #[test]
    fn empty_payload_still_yields_one_padded_row() {
        let buffer = PackedBuffer::from_records(Vec::new(), 3, 3);
        assert_eq!(buffer.width, 3);
        assert_eq!(buffer.height, 1);
        assert!(buffer.data.iter().all(|&c| c == PAD));
    }

    #[test]
    fn bvh_index_cells_preserve_bit_patterns() {
        let nodes = [FlatNode {
            left: 1,
            right: 6,
            triangle_base: -1,
            bounds_min: [0.0; 3],
            bounds_max: [1.0; 3],
        }];
        let buffer = pack_bvh(&nodes);
        assert_eq!(buffer.data[0].to_bits() as i32, 1);
        assert_eq!(buffer.data[1].to_bits() as i32, 6);
        assert_eq!(buffer.data[2].to_bits() as i32, -1);
        assert_eq!(buffer.data[3..9], [0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        padding_is_sound(&buffer, 9);
    }

    #[test]
    fn triangle_buffer_follows_leaf_order() {
        let tris = vec![
            Triangle::from_verts(Vec3::ZERO, Vec3::X, Vec3::Y),
            Triangle::from_verts(Vec3::splat(5.0), Vec3::splat(5.0) + Vec3::X, Vec3::splat(5.0) + Vec3::Y),
        ];
        let buffer = pack_triangles(&tris, &[1, 0]);
        assert_eq!(buffer.data[0], 5.0);
        assert_eq!(buffer.data[9], 0.0);
        padding_is_sound(&buffer, 18);
    }

    #[test]
    fn material_records_carry_defaults_and_pads() {
        let tris = vec![Triangle::from_verts(Vec3::ZERO, Vec3::X, Vec3::Y)];
        let materials = vec![Material {
            diffuse: 2,
            roughness: 3,
            normal: 4,
            emission: 5,
            emittance: Vec3::new(1.0, 0.5, 0.25),
            ior: 1.4,
            dielectric: -1.0,
        }];
        let buffer = pack_materials(&tris, &[0], &materials);
        assert_eq!(
            &buffer.data[..12],
            &[2.0, 3.0, 4.0, 5.0, PAD, PAD, 1.0, 0.5, 0.25, 1.4, -1.0, PAD]
        );
        padding_is_sound(&buffer, 12);
    }
}
