//! Normal estimation algorithms

use crate::nearest_neighbor::KdTree;
use lidarmesh_core::{
    Error, NearestNeighborSearch, NormalPoint3d, Point3d, PointCloud, Result, Vector3d,
};
use nalgebra::Matrix3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Minimum neighbourhood size for a covariance estimate
pub const MIN_NEIGHBORS: usize = 3;

/// Relative eigenvalue threshold below which a covariance is rank deficient
const RANK_TOLERANCE: f64 = 1e-12;

/// How the sign of each estimated normal is chosen
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NormalOrientation {
    /// Point every normal toward +Z, which suits airborne terrain scans
    Upward,
    /// Point every normal toward the given direction
    Direction(Vector3d),
}

impl NormalOrientation {
    fn reference(&self) -> Vector3d {
        match self {
            NormalOrientation::Upward => Vector3d::z(),
            NormalOrientation::Direction(v) => *v,
        }
    }
}

impl Default for NormalOrientation {
    fn default() -> Self {
        NormalOrientation::Upward
    }
}

/// Settings for [`estimate_normals`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalEstimationConfig {
    /// Neighbours farther than this are ignored
    pub radius: f64,
    /// At most this many nearest neighbours are used (the point itself included)
    pub max_neighbors: usize,
    pub orientation: NormalOrientation,
}

impl Default for NormalEstimationConfig {
    fn default() -> Self {
        Self {
            radius: 5.0,
            max_neighbors: 50,
            orientation: NormalOrientation::Upward,
        }
    }
}

impl NormalEstimationConfig {
    pub fn with_radius(mut self, radius: f64) -> Self {
        self.radius = radius;
        self
    }

    pub fn with_max_neighbors(mut self, max_neighbors: usize) -> Self {
        self.max_neighbors = max_neighbors;
        self
    }

    pub fn with_orientation(mut self, orientation: NormalOrientation) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.radius.is_finite() && self.radius > 0.0) {
            return Err(Error::Config(format!(
                "normal search radius must be positive, got {}",
                self.radius
            )));
        }
        if self.max_neighbors == 0 {
            return Err(Error::Config(
                "normal max_neighbors must be positive".to_string(),
            ));
        }
        if let NormalOrientation::Direction(v) = self.orientation {
            if !(v.norm() > 0.0 && v.iter().all(|c| c.is_finite())) {
                return Err(Error::Config(
                    "normal orientation direction must be a finite non-zero vector".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Fit a plane to a neighbourhood and return its unit normal
///
/// The normal is the eigenvector of the smallest eigenvalue of the
/// neighbourhood covariance. Returns `None` when the neighbourhood does not
/// span a plane (fewer than three points, or rank below two).
pub fn fit_plane_normal(neighbors: &[Point3d]) -> Option<Vector3d> {
    if neighbors.len() < MIN_NEIGHBORS {
        return None;
    }

    let centroid = neighbors
        .iter()
        .fold(Vector3d::zeros(), |acc, p| acc + p.coords)
        / neighbors.len() as f64;

    let mut cov = Matrix3::zeros();
    for p in neighbors {
        let d = p.coords - centroid;
        cov += d * d.transpose();
    }

    let eig = cov.symmetric_eigen();
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));
    let middle = eig.eigenvalues[order[1]];
    let largest = eig.eigenvalues[order[2]];
    if !(largest > 0.0) || middle <= RANK_TOLERANCE * largest {
        return None;
    }

    let normal = eig.eigenvectors.column(order[0]).into_owned();
    normal.try_normalize(f64::EPSILON)
}

/// Estimate a unit normal for every point of a cloud
///
/// Neighbourhoods are the `max_neighbors` nearest points within `radius`,
/// found with a k-d tree; the point itself is part of its neighbourhood.
/// Normals are flipped to agree with the configured orientation.
///
/// # Arguments
/// * `cloud` - Point cloud, normally the normalized and downsampled one
/// * `config` - Neighbourhood and orientation settings
///
/// # Returns
/// * `Result<PointCloud<NormalPoint3d>>` - Same points in the same order with normals;
///   `Error::Reconstruction` if any neighbourhood is degenerate
pub fn estimate_normals(
    cloud: &PointCloud<Point3d>,
    config: &NormalEstimationConfig,
) -> Result<PointCloud<NormalPoint3d>> {
    config.validate()?;
    if cloud.len() < MIN_NEIGHBORS {
        return Err(Error::Reconstruction(format!(
            "normal estimation needs at least {} points, got {}",
            MIN_NEIGHBORS,
            cloud.len()
        )));
    }

    let tree = KdTree::new(&cloud.points);
    let reference = config.orientation.reference();

    let estimated: Vec<Result<NormalPoint3d>> = cloud
        .points
        .par_iter()
        .enumerate()
        .map(|(idx, point)| {
            let neighbors: Vec<Point3d> = tree
                .find_hybrid_neighbors(point, config.radius, config.max_neighbors)
                .into_iter()
                .map(|(n, _)| cloud.points[n])
                .collect();

            let normal = fit_plane_normal(&neighbors).ok_or_else(|| {
                Error::Reconstruction(format!(
                    "degenerate neighbourhood at point {} ({} neighbours)",
                    idx,
                    neighbors.len()
                ))
            })?;

            let normal = if normal.dot(&reference) < 0.0 { -normal } else { normal };
            Ok(NormalPoint3d::new(*point, normal))
        })
        .collect();

    // first failure in cloud order
    let points = estimated.into_iter().collect::<Result<Vec<_>>>()?;

    debug!(points = points.len(), max_neighbors = config.max_neighbors, "estimated normals");
    Ok(PointCloud::from_points(points))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn jittered_grid(n: usize, seed: u64, height: impl Fn(f64, f64) -> f64) -> PointCloud<Point3d> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut points = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                let x = i as f64 / n as f64 - 0.5 + rng.gen_range(-0.1..0.1) / n as f64;
                let y = j as f64 / n as f64 - 0.5 + rng.gen_range(-0.1..0.1) / n as f64;
                points.push(Point3d::new(x, y, height(x, y)));
            }
        }
        PointCloud::from_points(points)
    }

    #[test]
    fn test_flat_plane_normals_point_up() {
        let cloud = jittered_grid(20, 1, |_, _| 0.0);
        let normals = estimate_normals(&cloud, &NormalEstimationConfig::default()).unwrap();

        assert_eq!(normals.len(), cloud.len());
        for (np, p) in normals.iter().zip(cloud.iter()) {
            assert_eq!(np.position, *p);
            assert_relative_eq!(np.normal.norm(), 1.0, epsilon = 1e-6);
            assert!(np.normal.z > 0.999);
        }
    }

    #[test]
    fn test_tilted_plane_normals() {
        // z = 0.5 x, normal proportional to (-0.5, 0, 1)
        let cloud = jittered_grid(15, 2, |x, _| 0.5 * x);
        let config = NormalEstimationConfig::default().with_max_neighbors(12);
        let normals = estimate_normals(&cloud, &config).unwrap();

        let expected = Vector3d::new(-0.5, 0.0, 1.0).normalize();
        for np in normals.iter() {
            assert_relative_eq!(np.normal.norm(), 1.0, epsilon = 1e-6);
            assert!(np.normal.dot(&expected) > 0.999);
        }
    }

    #[test]
    fn test_direction_orientation() {
        let cloud = jittered_grid(10, 3, |_, _| 0.0);
        let config = NormalEstimationConfig::default()
            .with_orientation(NormalOrientation::Direction(Vector3d::new(0.0, 0.0, -1.0)));
        let normals = estimate_normals(&cloud, &config).unwrap();
        assert!(normals.iter().all(|np| np.normal.z < -0.999));
    }

    #[test]
    fn test_collinear_points_fail() {
        let cloud: PointCloud<Point3d> = (0..20).map(|i| Point3d::new(i as f64 * 0.01, 0.0, 0.0)).collect();
        let result = estimate_normals(&cloud, &NormalEstimationConfig::default());
        assert!(matches!(result, Err(Error::Reconstruction(_))));
    }

    #[test]
    fn test_too_few_neighbours_within_radius_fail() {
        let cloud = jittered_grid(10, 4, |_, _| 0.0);
        // grid spacing is 0.1, so a tiny radius leaves only the point itself
        let config = NormalEstimationConfig::default().with_radius(0.01);
        let result = estimate_normals(&cloud, &config);
        assert!(matches!(result, Err(Error::Reconstruction(_))));
    }

    #[test]
    fn test_fit_plane_normal_small_inputs() {
        assert!(fit_plane_normal(&[]).is_none());
        assert!(fit_plane_normal(&[Point3d::origin(), Point3d::new(1.0, 0.0, 0.0)]).is_none());
        let n = fit_plane_normal(&[
            Point3d::origin(),
            Point3d::new(1.0, 0.0, 0.0),
            Point3d::new(0.0, 1.0, 0.0),
        ])
        .unwrap();
        assert_relative_eq!(n.z.abs(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_config() {
        let cloud = jittered_grid(5, 5, |_, _| 0.0);
        let bad = NormalEstimationConfig::default().with_max_neighbors(0);
        assert!(matches!(estimate_normals(&cloud, &bad), Err(Error::Config(_))));
        let bad = NormalEstimationConfig::default().with_radius(-1.0);
        assert!(matches!(estimate_normals(&cloud, &bad), Err(Error::Config(_))));
    }
}
