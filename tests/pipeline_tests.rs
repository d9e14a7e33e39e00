// End-to-end checks over the host-side compile pipeline: BVH construction,
// flattening, buffer packing and the derived tables, without touching a GPU.

use glam::Vec3;

use fray::aabb::Aabb;
use fray::bvh::BvhBuilder;
use fray::intersect::{closest_hit, Ray, MAX_T};
use fray::pack::{self, PAD};
use fray::scene::{light_ranges, normalize_triangles, shader_defines, RunMode};
use fray::triangle::Triangle;

fn unit_triangle_at(center: Vec3) -> Triangle {
    Triangle::from_verts(
        center + Vec3::new(-0.5, -0.5, 0.0),
        center + Vec3::new(0.5, -0.5, 0.0),
        center + Vec3::new(-0.5, 0.5, 0.0),
    )
}

fn grid_triangles(count: usize) -> Vec<Triangle> {
    (0..count)
        .map(|i| {
            unit_triangle_at(Vec3::new(
                (i % 5) as f32 * 2.0,
                ((i / 5) % 5) as f32 * 2.0,
                (i / 25) as f32 * 2.0,
            ))
        })
        .collect()
}

#[test]
fn flattened_tree_and_buffers_stay_consistent() {
    let triangles = grid_triangles(40);
    let bvh = BvhBuilder::new(&triangles).leaf_size(4).build().unwrap();
    let flat = bvh.flatten();

    // Every triangle appears exactly once in leaf order.
    let mut seen = flat.triangle_order.clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..40).collect::<Vec<u32>>());

    // Root ordinal 0, children preorder-contiguous.
    assert!(flat.nodes[0].left == 1 || flat.nodes[0].left == -1);

    let buffers = [
        (pack::pack_bvh(&flat.nodes), 9 * flat.nodes.len()),
        (
            pack::pack_triangles(&triangles, &flat.triangle_order),
            9 * triangles.len(),
        ),
        (
            pack::pack_normals(&triangles, &flat.triangle_order),
            27 * triangles.len(),
        ),
        (
            pack::pack_uvs(&triangles, &flat.triangle_order),
            6 * triangles.len(),
        ),
    ];
    for (buffer, payload) in &buffers {
        assert_eq!(buffer.data.len() % (buffer.channels * buffer.width), 0);
        assert!(buffer.data[*payload..].iter().all(|&c| c == PAD));
    }

    // The packed vertex stream matches the leaf order.
    let triangle_buffer = &buffers[1].0;
    for (slot, &id) in flat.triangle_order.iter().enumerate() {
        let expected = triangles[id as usize].verts[0];
        let base = slot * 9;
        assert_eq!(triangle_buffer.data[base], expected.x);
        assert_eq!(triangle_buffer.data[base + 1], expected.y);
        assert_eq!(triangle_buffer.data[base + 2], expected.z);
    }
}

#[test]
fn bvh_buffer_interleaves_ints_and_floats_bit_exactly() {
    let triangles = grid_triangles(12);
    let bvh = BvhBuilder::new(&triangles).leaf_size(2).build().unwrap();
    let flat = bvh.flatten();
    let buffer = pack::pack_bvh(&flat.nodes);

    for (ordinal, node) in flat.nodes.iter().enumerate() {
        let base = ordinal * 9;
        assert_eq!(buffer.data[base].to_bits() as i32, node.left);
        assert_eq!(buffer.data[base + 1].to_bits() as i32, node.right);
        assert_eq!(buffer.data[base + 2].to_bits() as i32, node.triangle_base);
        assert_eq!(buffer.data[base + 3], node.bounds_min[0]);
        assert_eq!(buffer.data[base + 8], node.bounds_max[2]);
    }
}

#[test]
fn normalization_recenters_and_rescales_the_scene() {
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
    assert_eq!(bounds.min, Vec3::splat(-10.0));
    assert_eq!(bounds.max, Vec3::splat(10.0));

    let rescaled = normalize_triangles(&mut triangles, &bounds, 1.0);
    assert!(rescaled.centroid().abs_diff_eq(Vec3::ZERO, 1e-6));
    for triangle in &triangles {
        for v in &triangle.verts {
            assert!(v.abs().max_element() <= 1.0 + 1e-6);
        }
    }
}

#[test]
fn autofocus_against_the_normalized_scene() {
    let triangles = vec![Triangle::from_verts(
        Vec3::new(0.0, 0.0, 0.0),
        Vec3::new(1.0, 0.0, 0.0),
        Vec3::new(0.0, 1.0, 0.0),
    )];
    let bvh = BvhBuilder::new(&triangles).leaf_size(4).build().unwrap();

    let hit = closest_hit(
        &bvh,
        &triangles,
        &Ray::new(Vec3::new(0.25, 0.25, 1.0), Vec3::new(0.0, 0.0, -1.0)),
    );
    assert!((hit - 1.0).abs() < 1e-6);

    let miss = closest_hit(
        &bvh,
        &triangles,
        &Ray::new(Vec3::new(4.0, 4.0, 1.0), Vec3::new(0.0, 0.0, -1.0)),
    );
    assert_eq!(miss, MAX_T);
}

#[test]
fn light_tables_cover_every_emissive_group() {
    // Groups of 3, 2 and 4 emissive triangles.
    let ranges = light_ranges(&[(10, 3), (13, 2), (20, 4)]);
    assert_eq!(ranges, vec![[0, 2], [3, 4], [5, 8]]);

    let triangles = grid_triangles(9);
    let ids: Vec<u32> = (0..9).collect();
    let buffer = pack::pack_lights(&triangles, &ids);
    assert_eq!(buffer.channels, 3);
    // Last range's final ordinal addresses a real record.
    let last = ranges.last().unwrap()[1] as usize;
    assert!(last * 9 < buffer.data.len());
}

#[test]
fn defines_cover_all_required_symbols() {
    let defines = shader_defines(6, 3, 4, RunMode::parse("nee"));
    let find = |key: &str| {
        defines
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    };
    assert_eq!(find("ENV_BINS").unwrap(), "6");
    assert_eq!(find("NUM_LIGHT_RANGES").unwrap(), "3");
    assert_eq!(find("LEAF_SIZE").unwrap(), "4");
    assert!(find("USE_EXPLICIT").is_some());
    assert!(find("USE_ALPHA").is_none());
}
