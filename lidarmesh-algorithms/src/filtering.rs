//! Filtering algorithms

use lidarmesh_core::{chunked_sum, Error, Point3d, PointCloud, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default standard deviation multiplier for z outlier removal
pub const DEFAULT_Z_STD_MULTIPLIER: f64 = 3.0;

/// Elevation statistics used by [`filter_z_outliers`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZStatistics {
    /// Mean z over the whole input
    pub mean: f64,
    /// Population standard deviation of z
    pub std_dev: f64,
    /// Lowest retained z (inclusive)
    pub lower: f64,
    /// Highest retained z (inclusive)
    pub upper: f64,
}

impl ZStatistics {
    /// Check whether an elevation lies inside the retained band
    pub fn contains(&self, z: f64) -> bool {
        z >= self.lower && z <= self.upper
    }
}

/// Compute mean and standard deviation of the z coordinate
///
/// # Arguments
/// * `cloud` - Input point cloud, must be non-empty with finite coordinates
/// * `std_multiplier` - Half-width of the retained band in standard deviations
///
/// # Returns
/// * `Result<ZStatistics>` - Statistics and retained band
pub fn z_statistics(cloud: &PointCloud<Point3d>, std_multiplier: f64) -> Result<ZStatistics> {
    if cloud.is_empty() {
        return Err(Error::Input("point cloud is empty".to_string()));
    }

    if !(std_multiplier > 0.0) {
        return Err(Error::Config(format!(
            "std_multiplier must be positive, got {}",
            std_multiplier
        )));
    }

    if let Some(idx) = cloud
        .points
        .par_iter()
        .position_any(|p| !(p.x.is_finite() && p.y.is_finite() && p.z.is_finite()))
    {
        return Err(Error::Input(format!(
            "point {} has a non-finite coordinate",
            idx
        )));
    }

    let n = cloud.len() as f64;
    let points = &cloud.points;
    let mean = chunked_sum(points.len(), |i| points[i].z) / n;
    let variance = chunked_sum(points.len(), |i| (points[i].z - mean).powi(2)) / n;
    let std_dev = variance.sqrt();

    Ok(ZStatistics {
        mean,
        std_dev,
        lower: mean - std_multiplier * std_dev,
        upper: mean + std_multiplier * std_dev,
    })
}

/// Statistical outlier removal along the vertical axis
///
/// Points whose elevation lies outside `mean ± std_multiplier · std` of the
/// whole cloud are removed. LiDAR returns from birds, power lines and
/// multipath reflections show up as isolated extreme z values, which this
/// removes before they can stretch the normalization box.
///
/// When every point has the same elevation the band collapses to a single
/// value and every point is kept. Input order is preserved.
///
/// # Arguments
/// * `cloud` - Input point cloud
/// * `std_multiplier` - Standard deviation multiplier (3.0 in the default pipeline)
///
/// # Returns
/// * `Result<PointCloud<Point3d>>` - Filtered cloud; `Error::Input` if nothing survives
///
/// # Example
/// ```rust
/// use lidarmesh_core::{PointCloud, Point3d};
/// use lidarmesh_algorithms::filter_z_outliers;
///
/// fn main() -> lidarmesh_core::Result<()> {
///     let mut points: Vec<Point3d> = (0..100)
///         .map(|i| Point3d::new(i as f64, 0.0, (i % 5) as f64 * 0.1))
///         .collect();
///     points.push(Point3d::new(50.0, 0.0, 500.0)); // outlier
///
///     let filtered = filter_z_outliers(&PointCloud::from_points(points), 3.0)?;
///     assert_eq!(filtered.len(), 100);
///     Ok(())
/// }
/// ```
pub fn filter_z_outliers(
    cloud: &PointCloud<Point3d>,
    std_multiplier: f64,
) -> Result<PointCloud<Point3d>> {
    let stats = z_statistics(cloud, std_multiplier)?;

    let filtered: Vec<Point3d> = if stats.std_dev == 0.0 {
        cloud.points.clone()
    } else {
        cloud
            .points
            .par_iter()
            .filter(|p| stats.contains(p.z))
            .copied()
            .collect()
    };

    if filtered.is_empty() {
        return Err(Error::Input(
            "no points left after outlier filtering".to_string(),
        ));
    }

    debug!(
        mean = stats.mean,
        std_dev = stats.std_dev,
        removed = cloud.len() - filtered.len(),
        "z outlier filter"
    );

    Ok(PointCloud::from_points(filtered))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noisy_plane(n: usize, seed: u64) -> Vec<Point3d> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                Point3d::new(
                    rng.gen_range(0.0..100.0),
                    rng.gen_range(0.0..100.0),
                    rng.gen_range(-0.5..0.5),
                )
            })
            .collect()
    }

    #[test]
    fn test_filter_empty_cloud() {
        let cloud = PointCloud::<Point3d>::new();
        let result = filter_z_outliers(&cloud, 3.0);
        assert!(matches!(result, Err(Error::Input(_))));
    }

    #[test]
    fn test_filter_single_point() {
        let cloud = PointCloud::from_points(vec![Point3d::new(1.0, 2.0, 3.0)]);
        let filtered = filter_z_outliers(&cloud, 3.0).unwrap();
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn test_filter_zero_std_keeps_everything() {
        let cloud: PointCloud<Point3d> = (0..50).map(|i| Point3d::new(i as f64, -(i as f64), 12.5)).collect();
        let filtered = filter_z_outliers(&cloud, 3.0).unwrap();
        assert_eq!(filtered, cloud);
    }

    #[test]
    fn test_filter_removes_extreme_elevations() {
        let mut points = noisy_plane(2000, 42);
        points.push(Point3d::new(10.0, 10.0, 250.0));
        points.push(Point3d::new(20.0, 20.0, -300.0));
        let cloud = PointCloud::from_points(points);

        let stats = z_statistics(&cloud, 3.0).unwrap();
        let filtered = filter_z_outliers(&cloud, 3.0).unwrap();

        assert!(filtered.len() <= cloud.len());
        assert_eq!(filtered.len(), 2000);
        assert!(filtered.iter().all(|p| stats.contains(p.z)));
        assert!(!filtered.iter().any(|p| p.z.abs() > 100.0));
    }

    #[test]
    fn test_filter_preserves_order() {
        let mut points = noisy_plane(300, 5);
        points.insert(150, Point3d::new(0.0, 0.0, 1.0e4));
        let cloud = PointCloud::from_points(points.clone());

        let filtered = filter_z_outliers(&cloud, 3.0).unwrap();
        points.remove(150);
        assert_eq!(filtered.points, points);
    }

    #[test]
    fn test_z_statistics_population_std() {
        let cloud: PointCloud<Point3d> = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]
            .iter()
            .map(|&z| Point3d::new(0.0, 0.0, z))
            .collect();
        let stats = z_statistics(&cloud, 3.0).unwrap();
        assert_relative_eq!(stats.mean, 5.0, epsilon = 1e-12);
        assert_relative_eq!(stats.std_dev, 2.0, epsilon = 1e-12);
        assert_relative_eq!(stats.lower, -1.0, epsilon = 1e-12);
        assert_relative_eq!(stats.upper, 11.0, epsilon = 1e-12);
    }

    #[test]
    fn test_filter_rejects_non_finite_input() {
        let cloud = PointCloud::from_points(vec![
            Point3d::new(0.0, 0.0, 0.0),
            Point3d::new(0.0, f64::NAN, 0.0),
        ]);
        assert!(matches!(filter_z_outliers(&cloud, 3.0), Err(Error::Input(_))));
    }

    #[test]
    fn test_filter_invalid_multiplier() {
        let cloud = PointCloud::from_points(vec![Point3d::new(0.0, 0.0, 0.0)]);
        assert!(matches!(filter_z_outliers(&cloud, 0.0), Err(Error::Config(_))));
        assert!(matches!(filter_z_outliers(&cloud, -1.0), Err(Error::Config(_))));
    }

    #[test]
    fn test_filter_is_deterministic() {
        let cloud = PointCloud::from_points(noisy_plane(50_000, 9));
        let a = z_statistics(&cloud, 3.0).unwrap();
        let b = z_statistics(&cloud, 3.0).unwrap();
        assert_eq!(a.mean.to_bits(), b.mean.to_bits());
        assert_eq!(a.std_dev.to_bits(), b.std_dev.to_bits());
    }
}
