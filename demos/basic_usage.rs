//! Basic usage: run the pipeline stages one at a time
//!
//! Shows the stage functions behind `convert` on a small synthetic patch.

use std::time::Instant;

use lidarmesh::algorithms::{
    estimate_normals, filter_z_outliers, normalize, voxel_downsample, DownsampleConfig,
    NormalEstimationConfig,
};
use lidarmesh::postprocess::{DensityTrim, MeshProcessor, QuadMerger, TrimThreshold};
use lidarmesh::prelude::*;
use lidarmesh::reconstruction::{poisson_reconstruction, PoissonConfig, ResourceLimits};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cloud: PointCloud<Point3d> = (0..40_000)
        .map(|i| {
            let x = (i % 200) as f64 * 0.5;
            let y = (i / 200) as f64 * 0.5;
            Point3d::new(x, y, 3.0 * (x * 0.05).sin() + 2.0 * (y * 0.08).cos())
        })
        .chain(std::iter::once(Point3d::new(50.0, 50.0, 900.0)))
        .collect();
    println!("Created cloud with {} points", cloud.len());

    let start = Instant::now();
    let filtered = filter_z_outliers(&cloud, 3.0)?;
    println!("1. Outlier filter: {} points remain", filtered.len());

    let (normalized, normalization) = normalize(&filtered)?;
    println!(
        "2. Normalized around {:?} with scale {:.2}",
        normalization.center, normalization.scale
    );

    let downsample = DownsampleConfig::default()
        .with_resolution(256.0)
        .with_refine_to_target(true);
    let reduced = voxel_downsample(&normalized, 20_000, &downsample)?;
    println!("3. Downsampled to {} points", reduced.len());

    let oriented = estimate_normals(
        &reduced,
        &NormalEstimationConfig::default().with_radius(0.05).with_max_neighbors(30),
    )?;
    println!("4. Estimated {} normals", oriented.len());

    let reconstruction = poisson_reconstruction(
        &oriented,
        &PoissonConfig::default().with_depth(10),
        &ResourceLimits::default(),
        &CancellationToken::new(),
    )?;
    println!(
        "5. Reconstructed {} vertices, {} triangles (solve depth {})",
        reconstruction.mesh.vertex_count(),
        reconstruction.mesh.face_count(),
        reconstruction.stats.solve_depth
    );

    let trimmed = DensityTrim::new(TrimThreshold::Quantile(0.05)).process(&reconstruction.mesh)?;
    let merged = QuadMerger::default().process(&trimmed)?;
    println!(
        "6. Post-processed: {} quads, {} triangles",
        merged.quad_count(),
        merged.triangle_count()
    );

    println!("Finished in {:?}", start.elapsed());
    Ok(())
}
