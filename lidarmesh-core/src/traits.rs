//! Core traits for lidarmesh

use crate::{mesh::*, point::*, point_cloud::*};

/// Trait for nearest neighbor search functionality
///
/// Distances are Euclidean (not squared).
pub trait NearestNeighborSearch {
    /// Find the k nearest neighbors to a query point, closest first
    fn find_k_nearest(&self, query: &Point3d, k: usize) -> Vec<(usize, f64)>;

    /// Find all neighbors within a given radius, closest first
    fn find_radius_neighbors(&self, query: &Point3d, radius: f64) -> Vec<(usize, f64)>;

    /// Up to `max_neighbors` nearest points that also lie within `radius`
    fn find_hybrid_neighbors(
        &self,
        query: &Point3d,
        radius: f64,
        max_neighbors: usize,
    ) -> Vec<(usize, f64)> {
        let mut neighbors = self.find_k_nearest(query, max_neighbors);
        neighbors.retain(|&(_, distance)| distance <= radius);
        neighbors
    }
}

/// Trait for geometry with an axis-aligned bounding box
pub trait Bounded {
    /// Get the bounding box of the object, `None` when it has no points
    fn bounding_box(&self) -> Option<(Point3d, Point3d)>;

    /// Get the center of the bounding box
    fn center(&self) -> Option<Point3d> {
        self.bounding_box().map(|(min, max)| nalgebra::center(&min, &max))
    }
}

fn bounds_of<I>(positions: I) -> Option<(Point3d, Point3d)>
where
    I: IntoIterator<Item = Point3d>,
{
    let mut iter = positions.into_iter();
    let first = iter.next()?;
    let (min, max) = iter.fold((first, first), |(min, max), p| {
        (min.inf(&p), max.sup(&p))
    });
    Some((min, max))
}

impl<T: HasPosition> Bounded for PointCloud<T> {
    fn bounding_box(&self) -> Option<(Point3d, Point3d)> {
        bounds_of(self.points.iter().map(HasPosition::position))
    }
}

impl Bounded for TerrainMesh {
    fn bounding_box(&self) -> Option<(Point3d, Point3d)> {
        bounds_of(self.vertices.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_cloud_bounding_box() {
        let cloud = PointCloud::from_points(vec![
            Point3d::new(0.0, 0.0, 0.0),
            Point3d::new(1.0, 1.0, 1.0),
            Point3d::new(-1.0, -1.0, -1.0),
            Point3d::new(2.0, 0.5, -0.5),
        ]);

        let (min, max) = cloud.bounding_box().unwrap();
        assert_eq!(min, Point3d::new(-1.0, -1.0, -1.0));
        assert_eq!(max, Point3d::new(2.0, 1.0, 1.0));
        assert_eq!(cloud.center().unwrap(), Point3d::new(0.5, 0.0, 0.0));
    }

    #[test]
    fn test_empty_bounding_box() {
        assert!(PointCloud3d::new().bounding_box().is_none());
        assert!(TerrainMesh::new().bounding_box().is_none());
    }
}
