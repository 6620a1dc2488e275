//! The conversion pipeline from raw points to a terrain mesh

use crate::config::ConversionConfig;
use lidarmesh_algorithms::{estimate_normals, filter_z_outliers, normalize, voxel_downsample, Normalization};
use lidarmesh_core::{
    CancellationToken, Error, Point3d, PointCloud, Result, TerrainMesh, Transform3D, Transformable,
};
use lidarmesh_postprocess::{DensityTrim, MeshProcessor, QuadMerger};
use lidarmesh_reconstruction::parallel::{execute_parallel, init_thread_pool};
use lidarmesh_reconstruction::{poisson_reconstruction, LevelStats};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::info;

/// Counts and solver statistics collected while converting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionReport {
    pub input_points: usize,
    pub filtered_points: usize,
    pub downsampled_points: usize,
    pub octree_depth: u32,
    pub solve_depth: u32,
    /// Deepest level reached by adaptive refinement
    pub output_depth: u32,
    pub iso_value: f64,
    pub solver_levels: Vec<LevelStats>,
    pub refinement_levels: Vec<LevelStats>,
    pub reconstructed_vertices: usize,
    pub reconstructed_faces: usize,
    pub final_vertices: usize,
    pub triangles: usize,
    pub quads: usize,
    pub elapsed: Duration,
}

/// Result of a conversion
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    /// Terrain mesh in normalized coordinates multiplied by the output scale
    pub mesh: TerrainMesh,
    /// Mapping from input coordinates to normalized coordinates
    pub normalization: Normalization,
    pub report: ConversionReport,
}

/// Runs conversions with one configuration
///
/// The configuration is validated when the converter is created. Each run
/// executes on the configured worker pool and stops with
/// [`Error::Cancelled`] once the converter's cancellation token fires.
#[derive(Debug, Clone)]
pub struct Converter {
    config: ConversionConfig,
    cancel: CancellationToken,
}

impl Converter {
    pub fn new(config: ConversionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Use an existing cancellation token
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ConversionConfig {
        &self.config
    }

    /// Token that cancels runs of this converter
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Convert raw points into a terrain mesh
    pub fn run(&self, points: &[Point3d]) -> Result<ConversionOutput> {
        init_thread_pool(self.config.thread_pool.clone())?;
        execute_parallel(|| self.run_stages(points))?
    }

    fn run_stages(&self, points: &[Point3d]) -> Result<ConversionOutput> {
        let start = Instant::now();
        let config = &self.config;
        let mut report = ConversionReport {
            input_points: points.len(),
            ..ConversionReport::default()
        };

        self.cancel.check()?;
        if points.is_empty() {
            return Err(Error::Input("point cloud is empty".to_string()));
        }
        let cloud = PointCloud::from_points(points.to_vec());

        let filtered = filter_z_outliers(&cloud, config.z_std_multiplier)?;
        report.filtered_points = filtered.len();
        info!(remaining = filtered.len(), "Filtered outliers");

        self.cancel.check()?;
        let (normalized, normalization) = normalize(&filtered)?;

        self.cancel.check()?;
        let downsampled = voxel_downsample(&normalized, config.vertex_count_target, &config.downsample)?;
        report.downsampled_points = downsampled.len();
        info!(points = downsampled.len(), "Final point cloud size");

        self.cancel.check()?;
        let oriented = estimate_normals(&downsampled, &config.normal_config())?;

        self.cancel.check()?;
        info!("Performing Poisson surface reconstruction");
        let reconstruction = poisson_reconstruction(
            &oriented,
            &config.poisson_config(),
            &config.limits,
            &self.cancel,
        )?;
        let mut mesh = reconstruction.mesh;
        report.octree_depth = reconstruction.stats.octree_depth;
        report.solve_depth = reconstruction.stats.solve_depth;
        report.iso_value = reconstruction.stats.iso_value;
        report.output_depth = reconstruction.stats.output_depth;
        report.solver_levels = reconstruction.stats.levels;
        report.refinement_levels = reconstruction.stats.refinement;
        report.reconstructed_vertices = mesh.vertex_count();
        report.reconstructed_faces = mesh.face_count();
        info!(
            vertices = mesh.vertex_count(),
            faces = mesh.face_count(),
            "Generated mesh"
        );

        if let Some(threshold) = config.density_trim {
            self.cancel.check()?;
            mesh = DensityTrim::new(threshold).process(&mesh)?;
        }
        if let Some(quad_merge) = config.quad_merge {
            self.cancel.check()?;
            mesh = QuadMerger::new(quad_merge).process(&mesh)?;
        }
        if mesh.faces.is_empty() {
            return Err(Error::Reconstruction(
                "no faces remain after post-processing".to_string(),
            ));
        }

        mesh.transform(&Transform3D::uniform_scaling(config.output_scale));
        mesh.validate()?;

        report.final_vertices = mesh.vertex_count();
        report.triangles = mesh.triangle_count();
        report.quads = mesh.quad_count();
        report.elapsed = start.elapsed();
        info!(
            vertices = report.final_vertices,
            triangles = report.triangles,
            quads = report.quads,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Conversion finished"
        );

        Ok(ConversionOutput {
            mesh,
            normalization,
            report,
        })
    }
}

/// Convert raw LiDAR points into a terrain mesh
///
/// The configuration is validated before any point is touched. Points pass
/// through outlier filtering, normalization, downsampling, normal estimation,
/// surface reconstruction and post-processing in that order.
///
/// # Arguments
/// * `points` - Raw points in source coordinates
/// * `config` - Conversion settings
///
/// # Returns
/// * `Result<ConversionOutput>` - The mesh, the normalization that was applied and a report
pub fn convert(points: &[Point3d], config: &ConversionConfig) -> Result<ConversionOutput> {
    Converter::new(config.clone())?.run(points)
}
