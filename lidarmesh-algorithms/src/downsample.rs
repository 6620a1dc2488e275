//! Voxel grid downsampling toward a vertex budget

use lidarmesh_core::{Bounded, Error, Point3d, PointCloud, Result, Vector3d};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Integer voxel coordinates, `floor(coord / voxel_size)` per axis
pub type VoxelKey = (i64, i64, i64);

/// Settings for [`voxel_downsample`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownsampleConfig {
    /// Voxel size is `(extent_x + extent_y) / resolution`
    pub resolution: f64,
    /// Coarsen the grid again while the result still exceeds the target
    pub refine_to_target: bool,
    /// Upper bound on coarsening rounds when `refine_to_target` is set
    pub max_refine_rounds: usize,
}

impl Default for DownsampleConfig {
    fn default() -> Self {
        Self {
            resolution: 2048.0,
            refine_to_target: false,
            max_refine_rounds: 8,
        }
    }
}

impl DownsampleConfig {
    pub fn with_resolution(mut self, resolution: f64) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_refine_to_target(mut self, refine: bool) -> Self {
        self.refine_to_target = refine;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(Error::Config(format!(
                "downsample resolution must be positive, got {}",
                self.resolution
            )));
        }
        Ok(())
    }
}

/// Voxel key of a point
#[inline]
pub fn voxel_key(point: &Point3d, voxel_size: f64) -> VoxelKey {
    (
        (point.x / voxel_size).floor() as i64,
        (point.y / voxel_size).floor() as i64,
        (point.z / voxel_size).floor() as i64,
    )
}

/// Replace every occupied voxel by the centroid of its points
///
/// Output is ordered by voxel key (lexicographic) and each centroid sums its
/// members in input order, so the result does not depend on scheduling.
pub fn voxel_grid(cloud: &PointCloud<Point3d>, voxel_size: f64) -> Result<PointCloud<Point3d>> {
    if !(voxel_size.is_finite() && voxel_size > 0.0) {
        return Err(Error::Config(format!(
            "voxel_size must be positive, got {}",
            voxel_size
        )));
    }

    let mut keyed: Vec<(VoxelKey, usize)> = cloud
        .points
        .par_iter()
        .enumerate()
        .map(|(idx, p)| (voxel_key(p, voxel_size), idx))
        .collect();
    keyed.par_sort_unstable();

    let centroids: Vec<Point3d> = keyed
        .chunk_by(|a, b| a.0 == b.0)
        .map(|members| {
            let sum = members
                .iter()
                .fold(Vector3d::zeros(), |acc, &(_, idx)| acc + cloud.points[idx].coords);
            Point3d::from(sum / members.len() as f64)
        })
        .collect();

    Ok(PointCloud::from_points(centroids))
}

fn centroid(points: &[Point3d]) -> Point3d {
    let sum = points.iter().fold(Vector3d::zeros(), |acc, p| acc + p.coords);
    Point3d::from(sum / points.len() as f64)
}

/// Spatially downsample a normalized cloud toward `target` points
///
/// Clouds already within budget are returned unchanged. Otherwise the voxel
/// size follows the planar extent of the cloud, which suits terrain where the
/// vertical extent is small compared to the horizontal one. The output size
/// is a heuristic bound, not an exact contract; with
/// [`DownsampleConfig::refine_to_target`] the grid is coarsened until the
/// target is met or the round limit is reached.
///
/// # Arguments
/// * `cloud` - Normalized point cloud
/// * `target` - Desired maximum number of points
/// * `config` - Grid resolution and refinement settings
///
/// # Returns
/// * `Result<PointCloud<Point3d>>` - Downsampled cloud
pub fn voxel_downsample(
    cloud: &PointCloud<Point3d>,
    target: usize,
    config: &DownsampleConfig,
) -> Result<PointCloud<Point3d>> {
    config.validate()?;
    if target == 0 {
        return Err(Error::Config("downsample target must be positive".to_string()));
    }
    if cloud.len() <= target {
        debug!(points = cloud.len(), target, "cloud within budget, skipping downsample");
        return Ok(cloud.clone());
    }

    let (min, max) = cloud
        .bounding_box()
        .ok_or_else(|| Error::Input("cannot downsample an empty point cloud".to_string()))?;
    let extent = max - min;

    let mut voxel_size = (extent.x + extent.y) / config.resolution;
    if voxel_size <= 0.0 {
        voxel_size = extent.max() / config.resolution;
    }
    if voxel_size <= 0.0 {
        info!(points = cloud.len(), "degenerate cloud collapsed to its centroid");
        return Ok(PointCloud::from_points(vec![centroid(&cloud.points)]));
    }

    let mut result = voxel_grid(cloud, voxel_size)?;
    if config.refine_to_target {
        let mut rounds = 0;
        while result.len() > target && rounds < config.max_refine_rounds {
            voxel_size *= (result.len() as f64 / target as f64).sqrt();
            result = voxel_grid(cloud, voxel_size)?;
            rounds += 1;
        }
    }

    info!(
        before = cloud.len(),
        after = result.len(),
        target,
        voxel_size,
        "voxel downsample"
    );
    Ok(result)
}
