//! Point types and related functionality

use nalgebra::{Point3, Vector3};
use serde::{Deserialize, Serialize};

/// A 3D point with double precision coordinates
///
/// LiDAR coordinates are usually projected (UTM and friends) and carry six or
/// more significant digits before the decimal point, so everything up to and
/// including normalization stays in `f64`.
pub type Point3d = Point3<f64>;

/// A 3D vector with double precision components
pub type Vector3d = Vector3<f64>;

/// A point with a unit normal vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalPoint3d {
    pub position: Point3d,
    pub normal: Vector3d,
}

impl NormalPoint3d {
    pub fn new(position: Point3d, normal: Vector3d) -> Self {
        Self { position, normal }
    }
}

impl Default for NormalPoint3d {
    fn default() -> Self {
        Self {
            position: Point3d::origin(),
            normal: Vector3d::new(0.0, 0.0, 1.0),
        }
    }
}

/// Access to the position of any point type stored in a cloud
pub trait HasPosition {
    fn position(&self) -> Point3d;
}

impl HasPosition for Point3d {
    #[inline]
    fn position(&self) -> Point3d {
        *self
    }
}

impl HasPosition for NormalPoint3d {
    #[inline]
    fn position(&self) -> Point3d {
        self.position
    }
}
