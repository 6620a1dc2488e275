//! Coordinate normalization

use lidarmesh_core::{Bounded, Error, Point3d, PointCloud, Result, Transform3D, Vector3d};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The similarity transform applied by [`normalize`]
///
/// Normalized coordinates are `(p - center) / scale`, so the cloud fits the
/// cube `[-0.5, 0.5]^3` with its largest extent spanning the full unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    pub center: Point3d,
    pub scale: f64,
}

impl Normalization {
    /// The identity normalization
    pub fn identity() -> Self {
        Self {
            center: Point3d::origin(),
            scale: 1.0,
        }
    }

    /// Map a world point into normalized space
    #[inline]
    pub fn apply(&self, point: &Point3d) -> Point3d {
        Point3d::from((point - self.center) / self.scale)
    }

    /// Map a normalized point back to world space
    #[inline]
    pub fn invert(&self, point: &Point3d) -> Point3d {
        self.center + point.coords * self.scale
    }

    /// The world-to-normalized transform as a matrix
    pub fn to_transform(&self) -> Transform3D {
        Transform3D::uniform_scaling(1.0 / self.scale)
            * Transform3D::translation(-self.center.coords)
    }

    /// The normalized-to-world transform as a matrix
    pub fn to_inverse_transform(&self) -> Transform3D {
        Transform3D::translation(self.center.coords) * Transform3D::uniform_scaling(self.scale)
    }
}

impl Default for Normalization {
    fn default() -> Self {
        Self::identity()
    }
}

/// Centre a cloud on its bounding box and rescale its largest extent to 1
///
/// A cloud whose points all coincide has no extent; it is only translated
/// (scale 1.0) so the output is the origin repeated.
///
/// # Arguments
/// * `cloud` - Input point cloud
///
/// # Returns
/// * `Result<(PointCloud<Point3d>, Normalization)>` - Normalized copy and the applied transform
pub fn normalize(cloud: &PointCloud<Point3d>) -> Result<(PointCloud<Point3d>, Normalization)> {
    let (min, max) = cloud
        .bounding_box()
        .ok_or_else(|| Error::Input("cannot normalize an empty point cloud".to_string()))?;

    let extent: Vector3d = max - min;
    let largest = extent.max();
    let normalization = Normalization {
        center: nalgebra::center(&min, &max),
        scale: if largest > 0.0 { largest } else { 1.0 },
    };

    let points: Vec<Point3d> = cloud
        .points
        .par_iter()
        .map(|p| normalization.apply(p))
        .collect();

    debug!(
        center = ?normalization.center,
        scale = normalization.scale,
        "normalized point cloud"
    );

    Ok((PointCloud::from_points(points), normalization))
}
