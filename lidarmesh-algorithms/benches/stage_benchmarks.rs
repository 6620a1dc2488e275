//! Benchmarks for the point cloud stages ahead of reconstruction

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lidarmesh_algorithms::{
    estimate_normals, filter_z_outliers, normalize, voxel_downsample, DownsampleConfig,
    NormalEstimationConfig,
};
use lidarmesh_core::{Point3d, PointCloud};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn generate_terrain(n: usize) -> PointCloud<Point3d> {
    let mut rng = StdRng::seed_from_u64(17);
    (0..n)
        .map(|_| {
            let x: f64 = rng.gen_range(0.0..500.0);
            let y: f64 = rng.gen_range(0.0..500.0);
            let z = 40.0 * (x / 80.0).sin() * (y / 120.0).cos() + rng.gen_range(-0.2..0.2);
            Point3d::new(x, y, z)
        })
        .collect()
}

fn bench_stages(c: &mut Criterion) {
    let sizes = [10_000, 100_000];
    let mut group = c.benchmark_group("stages");
    group.sample_size(10);

    for &size in &sizes {
        let cloud = generate_terrain(size);
        let (normalized, _) = normalize(&cloud).unwrap();

        group.bench_with_input(BenchmarkId::new("filter_z_outliers", size), &cloud, |b, cloud| {
            b.iter(|| black_box(filter_z_outliers(black_box(cloud), 3.0).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("normalize", size), &cloud, |b, cloud| {
            b.iter(|| black_box(normalize(black_box(cloud)).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("voxel_downsample", size), &normalized, |b, cloud| {
            let config = DownsampleConfig::default().with_resolution(256.0);
            b.iter(|| black_box(voxel_downsample(black_box(cloud), size / 4, &config).unwrap()));
        });

        group.bench_with_input(BenchmarkId::new("estimate_normals", size), &normalized, |b, cloud| {
            let config = NormalEstimationConfig::default().with_max_neighbors(30);
            b.iter(|| black_box(estimate_normals(black_box(cloud), &config).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_stages);
criterion_main!(benches);
