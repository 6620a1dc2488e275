//! 3D transformation utilities

use crate::mesh::TerrainMesh;
use crate::point::{Point3d, Vector3d};
use crate::point_cloud::PointCloud;
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

/// A homogeneous 3D transformation applied to points and meshes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform3D {
    pub matrix: Matrix4<f64>,
}

impl Transform3D {
    /// Create an identity transformation
    pub fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
        }
    }

    /// Create a translation transformation
    pub fn translation(translation: Vector3d) -> Self {
        Self {
            matrix: Matrix4::new_translation(&translation),
        }
    }

    /// Create a uniform scaling transformation about the origin
    pub fn uniform_scaling(scale: f64) -> Self {
        Self {
            matrix: Matrix4::new_scaling(scale),
        }
    }

    /// Apply the transformation to a point
    pub fn transform_point(&self, point: &Point3d) -> Point3d {
        let homogeneous = self.matrix * point.to_homogeneous();
        Point3d::from_homogeneous(homogeneous).unwrap_or(*point)
    }

    /// Apply the linear part of the transformation to a vector
    pub fn transform_vector(&self, vector: &Vector3d) -> Vector3d {
        self.matrix.fixed_view::<3, 3>(0, 0) * vector
    }

    /// Compose this transformation with another; `other` is applied first
    pub fn compose(self, other: Self) -> Self {
        Self {
            matrix: self.matrix * other.matrix,
        }
    }

    /// Get the inverse transformation
    pub fn inverse(self) -> Option<Self> {
        self.matrix
            .try_inverse()
            .map(|inv_matrix| Self { matrix: inv_matrix })
    }
}

impl Default for Transform3D {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for Transform3D {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self::Output {
        self.compose(rhs)
    }
}

/// Trait for objects that can be transformed in place
pub trait Transformable {
    fn transform(&mut self, transform: &Transform3D);
}

impl Transformable for PointCloud<Point3d> {
    fn transform(&mut self, transform: &Transform3D) {
        for point in &mut self.points {
            *point = transform.transform_point(point);
        }
    }
}

impl Transformable for TerrainMesh {
    fn transform(&mut self, transform: &Transform3D) {
        for vertex in &mut self.vertices {
            *vertex = transform.transform_point(vertex);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_compose_order() {
        let scale = Transform3D::uniform_scaling(2.0);
        let shift = Transform3D::translation(Vector3d::new(1.0, 0.0, 0.0));

        // shift first, then scale
        let t = scale * shift;
        let p = t.transform_point(&Point3d::new(1.0, 1.0, 1.0));
        assert_relative_eq!(p, Point3d::new(4.0, 2.0, 2.0), epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_round_trip() {
        let t = Transform3D::uniform_scaling(10.0) * Transform3D::translation(Vector3d::new(-3.0, 2.0, 0.5));
        let inv = t.inverse().unwrap();
        let p = Point3d::new(0.25, -0.5, 0.125);
        assert_relative_eq!(inv.transform_point(&t.transform_point(&p)), p, epsilon = 1e-12);
    }

    #[test]
    fn test_transform_mesh() {
        let mut mesh = TerrainMesh::from_triangles(
            vec![Point3d::new(0.1, 0.2, 0.3), Point3d::new(1.0, 0.0, 0.0), Point3d::new(0.0, 1.0, 0.0)],
            vec![[0, 1, 2]],
        );
        mesh.transform(&Transform3D::uniform_scaling(10.0));
        assert_relative_eq!(mesh.vertices[0], Point3d::new(1.0, 2.0, 3.0), epsilon = 1e-12);
        assert_relative_eq!(
            Transform3D::uniform_scaling(10.0).transform_vector(&Vector3d::z()),
            Vector3d::new(0.0, 0.0, 10.0),
            epsilon = 1e-12
        );
    }
}
