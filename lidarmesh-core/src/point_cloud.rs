//! Point cloud data structures and functionality

use crate::point::*;
use serde::{Deserialize, Serialize};
use std::ops::Index;

/// An ordered point cloud snapshot
///
/// Pipeline stages take a cloud by reference and return a new one, so a
/// snapshot is never mutated by two stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloud<T> {
    pub points: Vec<T>,
}

/// A point cloud of bare positions
pub type PointCloud3d = PointCloud<Point3d>;

/// A point cloud with normal vectors
pub type NormalPointCloud3d = PointCloud<NormalPoint3d>;

impl<T> PointCloud<T> {
    /// Create a new empty point cloud
    pub fn new() -> Self {
        Self { points: Vec::new() }
    }

    /// Create a new point cloud with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: Vec::with_capacity(capacity),
        }
    }

    /// Create a point cloud from a vector of points
    pub fn from_points(points: Vec<T>) -> Self {
        Self { points }
    }

    /// Get the number of points in the cloud
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the point cloud is empty
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Add a point to the cloud
    pub fn push(&mut self, point: T) {
        self.points.push(point);
    }

    /// Get an iterator over the points
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.points.iter()
    }
}

impl PointCloud<Point3d> {
    /// Build a cloud from raw `(x, y, z)` triples as handed over by a reader
    pub fn from_xyz(coords: &[[f64; 3]]) -> Self {
        coords
            .iter()
            .map(|c| Point3d::new(c[0], c[1], c[2]))
            .collect()
    }
}

impl PointCloud<NormalPoint3d> {
    /// Positions without normals, in cloud order
    pub fn positions(&self) -> Vec<Point3d> {
        self.points.iter().map(|p| p.position).collect()
    }
}

impl<T> Default for PointCloud<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<usize> for PointCloud<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        &self.points[index]
    }
}

impl<T> IntoIterator for PointCloud<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a PointCloud<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

impl<T> FromIterator<T> for PointCloud<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            points: Vec::from_iter(iter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_xyz_preserves_order() {
        let cloud = PointCloud::from_xyz(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        assert_eq!(cloud.len(), 2);
        assert_eq!(cloud[0], Point3d::new(1.0, 2.0, 3.0));
        assert_eq!(cloud[1], Point3d::new(4.0, 5.0, 6.0));
    }

    #[test]
    fn test_empty_cloud() {
        let cloud = PointCloud3d::new();
        assert!(cloud.is_empty());
        assert_eq!(cloud.iter().count(), 0);
    }
}
