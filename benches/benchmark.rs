// This file contains benchmarks for the purpose of guarding against
// performance regressions in the scene compiler. To run them, use
// `cargo bench`.

use criterion::{criterion_group, criterion_main, Criterion};
use glam::Vec3;

use fray::bvh::BvhBuilder;
use fray::pack;
use fray::triangle::Triangle;

/// Deterministic triangle cloud; an LCG keeps runs comparable.
fn triangle_cloud(count: usize) -> Vec<Triangle> {
    let mut state = 0x2545f491u64;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((state >> 33) as f32 / (1u64 << 31) as f32) * 20.0 - 10.0
    };
    (0..count)
        .map(|_| {
            let center = Vec3::new(next(), next(), next());
            Triangle::from_verts(
                center + Vec3::new(-0.2, -0.2, 0.0),
                center + Vec3::new(0.2, -0.2, 0.0),
                center + Vec3::new(-0.2, 0.2, 0.1),
            )
        })
        .collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("Performance regression tests");
    group.sample_size(10);

    let small = triangle_cloud(1_000);
    let large = triangle_cloud(50_000);

    group.bench_function("BVH build (1k tris)", |b| {
        b.iter(|| BvhBuilder::new(&small).build().unwrap())
    });
    group.bench_function("BVH build (50k tris)", |b| {
        b.iter(|| BvhBuilder::new(&large).build().unwrap())
    });

    let bvh = BvhBuilder::new(&large).build().unwrap();
    group.bench_function("Flatten + pack (50k tris)", |b| {
        b.iter(|| {
            let flat = bvh.flatten();
            (
                pack::pack_bvh(&flat.nodes),
                pack::pack_triangles(&large, &flat.triangle_order),
            )
        })
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
