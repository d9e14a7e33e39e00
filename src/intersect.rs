use glam::Vec3;

use crate::aabb::Aabb;
use crate::bvh::{Bvh, Node, NodeKind};
use crate::triangle::Triangle;

/// Sentinel distance returned for any miss.
pub const MAX_T: f32 = 1e6;

const EPSILON: f32 = 1e-12;

pub struct Ray {
    pub origin: Vec3,
    pub direction: Vec3,
    inv_direction: Vec3,
}

impl Ray {
    pub fn new(origin: Vec3, direction: Vec3) -> Self {
        Self {
            origin,
            direction,
            inv_direction: direction.recip(),
        }
    }
}

/// Slab test. Returns the entry distance, or `MAX_T` when the ray misses or
/// the box lies entirely behind the origin.
pub fn ray_box(ray: &Ray, aabb: &Aabb) -> f32 {
    let t1 = (aabb.min - ray.origin) * ray.inv_direction;
    let t2 = (aabb.max - ray.origin) * ray.inv_direction;
    let tmin = t1.min(t2).max_element();
    let tmax = t1.max(t2).min_element();
    if tmax >= tmin && tmax >= 0.0 {
        tmin
    } else {
        MAX_T
    }
}

/// Möller–Trumbore. Parallel and back-facing triangles are rejected, as are
/// hits at or behind the origin. Returns `MAX_T` on miss.
pub fn ray_triangle(ray: &Ray, triangle: &Triangle) -> f32 {
    let edge1 = triangle.verts[1] - triangle.verts[0];
    let edge2 = triangle.verts[2] - triangle.verts[0];

    let p = ray.direction.cross(edge2);
    let det = edge1.dot(p);
    if det <= EPSILON {
        return MAX_T;
    }

    let inv_det = 1.0 / det;
    let s = ray.origin - triangle.verts[0];
    let u = s.dot(p) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return MAX_T;
    }

    let q = s.cross(edge1);
    let v = ray.direction.dot(q) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return MAX_T;
    }

    let t = edge2.dot(q) * inv_det;
    if t > EPSILON {
        t
    } else {
        MAX_T
    }
}

/// Closest hit over the BVH, front-to-back. A subtree is pruned as soon as
/// its box entry distance reaches the current closest hit.
pub fn closest_hit(bvh: &Bvh, triangles: &[Triangle], ray: &Ray) -> f32 {
    let mut closest = MAX_T;
    if ray_box(ray, &bvh.root.bounds) < closest {
        walk(&bvh.root, triangles, ray, &mut closest);
    }
    closest
}

fn walk(node: &Node, triangles: &[Triangle], ray: &Ray, closest: &mut f32) {
    match &node.kind {
        NodeKind::Leaf { triangles: ids } => {
            for &t in ids {
                let distance = ray_triangle(ray, &triangles[t as usize]);
                if distance < *closest {
                    *closest = distance;
                }
            }
        }
        NodeKind::Internal { left, right, .. } => {
            let mut near: &Node = left;
            let mut far: &Node = right;
            let mut near_t = ray_box(ray, &near.bounds);
            let mut far_t = ray_box(ray, &far.bounds);
            if near_t > far_t {
                std::mem::swap(&mut near, &mut far);
                std::mem::swap(&mut near_t, &mut far_t);
            }
            if near_t < *closest {
                walk(near, triangles, ray, closest);
            }
            if far_t < *closest {
                walk(far, triangles, ray, closest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh::BvhBuilder;

    fn canonical_triangle() -> Triangle {
        Triangle::from_verts(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        )
    }

    #[test]
    fn slab_test_reports_entry_distance() {
        let aabb = Aabb::from_points(&[Vec3::ZERO, Vec3::ONE]);
        let ray = Ray::new(Vec3::new(0.5, 0.5, -2.0), Vec3::Z);
        assert_eq!(ray_box(&ray, &aabb), 2.0);
    }

    #[test]
    fn slab_test_misses_boxes_behind_the_origin() {
        let aabb = Aabb::from_points(&[Vec3::ZERO, Vec3::ONE]);
        let ray = Ray::new(Vec3::new(0.5, 0.5, 3.0), Vec3::Z);
        assert_eq!(ray_box(&ray, &aabb), MAX_T);

        let sideways = Ray::new(Vec3::new(5.0, 5.0, -2.0), Vec3::Z);
        assert_eq!(ray_box(&sideways, &aabb), MAX_T);
    }

    #[test]
    fn slab_test_from_inside_reports_negative_entry() {
        let aabb = Aabb::from_points(&[Vec3::ZERO, Vec3::ONE]);
        let ray = Ray::new(Vec3::splat(0.5), Vec3::Z);
        assert!(ray_box(&ray, &aabb) < 0.0);
    }

    #[test]
    fn triangle_hit_distance_matches_geometry() {
        let triangle = canonical_triangle();
        // Aim at the centroid from 3 units out along -z.
        let centroid = Vec3::new(1.0 / 3.0, 1.0 / 3.0, 0.0);
        let origin = centroid + Vec3::new(0.0, 0.0, 3.0);
        let ray = Ray::new(origin, Vec3::NEG_Z);
        let t = ray_triangle(&ray, &triangle);
        assert!((t - 3.0).abs() < 3.0 * 1e-6);
    }

    #[test]
    fn backfaces_and_parallel_rays_are_rejected() {
        let triangle = canonical_triangle();
        // Approaching from behind the winding order.
        let back = Ray::new(Vec3::new(0.25, 0.25, -1.0), Vec3::Z);
        assert_eq!(ray_triangle(&back, &triangle), MAX_T);

        let parallel = Ray::new(Vec3::new(0.0, 0.0, 1.0), Vec3::X);
        assert_eq!(ray_triangle(&parallel, &triangle), MAX_T);
    }

    #[test]
    fn barycentric_bounds_are_enforced() {
        let triangle = canonical_triangle();
        let outside = Ray::new(Vec3::new(0.9, 0.9, 1.0), Vec3::NEG_Z);
        assert_eq!(ray_triangle(&outside, &triangle), MAX_T);
    }

    #[test]
    fn autofocus_probe_hits_the_canonical_scene() {
        let triangles = vec![canonical_triangle()];
        let bvh = BvhBuilder::new(&triangles).leaf_size(4).build().unwrap();
        let ray = Ray::new(Vec3::new(0.25, 0.25, 1.0), Vec3::new(0.0, 0.0, -1.0));
        let distance = closest_hit(&bvh, &triangles, &ray);
        assert!((distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn probe_misses_return_the_sentinel() {
        let triangles = vec![canonical_triangle()];
        let bvh = BvhBuilder::new(&triangles).leaf_size(4).build().unwrap();
        let ray = Ray::new(Vec3::new(5.0, 5.0, 1.0), Vec3::new(0.0, 0.0, -1.0));
        assert_eq!(closest_hit(&bvh, &triangles, &ray), MAX_T);
    }

    #[test]
    fn traversal_returns_the_nearest_of_stacked_triangles() {
        let mut triangles = Vec::new();
        for depth in [5.0f32, 2.0, 8.0, 3.5] {
            triangles.push(Triangle::from_verts(
                Vec3::new(-1.0, -1.0, -depth),
                Vec3::new(1.0, -1.0, -depth),
                Vec3::new(-1.0, 1.0, -depth),
            ));
        }
        let bvh = BvhBuilder::new(&triangles).leaf_size(1).build().unwrap();
        let ray = Ray::new(Vec3::new(-0.25, -0.25, 0.0), Vec3::NEG_Z);
        let distance = closest_hit(&bvh, &triangles, &ray);
        assert!((distance - 2.0).abs() < 1e-6);
    }
}
