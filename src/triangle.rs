use glam::{Vec2, Vec3};

use crate::aabb::Aabb;

/// One triangle with full shading attributes and a cached bounding box.
/// The box is recomputed whenever the positions are rescaled.
#[derive(Debug, Clone)]
pub struct Triangle {
    pub verts: [Vec3; 3],
    pub uvs: [Vec2; 3],
    pub normals: [Vec3; 3],
    pub tangents: [Vec3; 3],
    pub bitangents: [Vec3; 3],
    pub material: u32,
    bounds: Aabb,
}

impl Triangle {
    pub fn new(
        verts: [Vec3; 3],
        uvs: [Vec2; 3],
        normals: [Vec3; 3],
        tangents: [Vec3; 3],
        bitangents: [Vec3; 3],
        material: u32,
    ) -> Self {
        Self {
            verts,
            uvs,
            normals,
            tangents,
            bitangents,
            material,
            bounds: Aabb::from_points(&verts),
        }
    }

    /// Positions-only constructor for geometry that carries no shading data.
    pub fn from_verts(v0: Vec3, v1: Vec3, v2: Vec3) -> Self {
        let normal = (v1 - v0).cross(v2 - v0).normalize_or_zero();
        Self::new(
            [v0, v1, v2],
            [Vec2::ZERO; 3],
            [normal; 3],
            [Vec3::ZERO; 3],
            [Vec3::ZERO; 3],
            0,
        )
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn centroid(&self, axis: usize) -> f32 {
        self.bounds.centroid()[axis]
    }

    /// Recenters on `center` and scales positions by `scale`, refreshing the
    /// cached box.
    pub fn rescale(&mut self, center: Vec3, scale: f32) {
        for v in &mut self.verts {
            *v = (*v - center) * scale;
        }
        self.bounds = Aabb::from_points(&self.verts);
    }
}
