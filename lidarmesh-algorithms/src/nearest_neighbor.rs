//! Nearest neighbor search implementations

use kiddo::float::kdtree::KdTree as KiddoTree;
use kiddo::SquaredEuclidean;
use lidarmesh_core::{NearestNeighborSearch, Point3d};

/// Bucket size of the k-d tree leaves
///
/// Terrain scans put many samples on identical coordinates along one axis
/// (flat roofs, gridded exports); kiddo needs a bucket larger than the
/// number of items sharing a split value.
const BUCKET_SIZE: usize = 256;

type Tree = KiddoTree<f64, u64, 3, BUCKET_SIZE, u32>;

/// KD-Tree for nearest neighbor search, backed by `kiddo`
pub struct KdTree {
    tree: Tree,
    len: usize,
}

impl KdTree {
    pub fn new(points: &[Point3d]) -> Self {
        let mut tree = Tree::with_capacity(points.len().max(1));
        for (idx, point) in points.iter().enumerate() {
            tree.add(&[point.x, point.y, point.z], idx as u64);
        }
        Self {
            tree,
            len: points.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl NearestNeighborSearch for KdTree {
    fn find_k_nearest(&self, query: &Point3d, k: usize) -> Vec<(usize, f64)> {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }
        self.tree
            .nearest_n::<SquaredEuclidean>(&[query.x, query.y, query.z], k.min(self.len))
            .into_iter()
            .map(|n| (n.item as usize, n.distance.sqrt()))
            .collect()
    }

    fn find_radius_neighbors(&self, query: &Point3d, radius: f64) -> Vec<(usize, f64)> {
        if radius < 0.0 || self.is_empty() {
            return Vec::new();
        }
        self.tree
            .within::<SquaredEuclidean>(&[query.x, query.y, query.z], radius * radius)
            .into_iter()
            .map(|n| (n.item as usize, n.distance.sqrt()))
            .collect()
    }
}

/// Simple brute force nearest neighbor search for small datasets
pub struct BruteForceSearch {
    points: Vec<Point3d>,
}

impl BruteForceSearch {
    pub fn new(points: &[Point3d]) -> Self {
        Self {
            points: points.to_vec(),
        }
    }
}

impl NearestNeighborSearch for BruteForceSearch {
    fn find_k_nearest(&self, query: &Point3d, k: usize) -> Vec<(usize, f64)> {
        let mut distances: Vec<(usize, f64)> = self
            .points
            .iter()
            .enumerate()
            .map(|(idx, point)| (idx, (point - query).norm()))
            .collect();

        // Sort by distance and take k nearest
        distances.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        distances.truncate(k);
        distances
    }

    fn find_radius_neighbors(&self, query: &Point3d, radius: f64) -> Vec<(usize, f64)> {
        let radius_squared = radius * radius;
        let mut neighbors: Vec<(usize, f64)> = self
            .points
            .iter()
            .enumerate()
            .filter_map(|(idx, point)| {
                let distance_squared = (point - query).norm_squared();
                (distance_squared <= radius_squared).then(|| (idx, distance_squared.sqrt()))
            })
            .collect();
        neighbors.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        neighbors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_points(n: usize, seed: u64) -> Vec<Point3d> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| Point3d::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-0.1..0.1)))
            .collect()
    }

    #[test]
    fn test_kdtree_matches_brute_force_knn() {
        let points = random_points(500, 7);
        let kdtree = KdTree::new(&points);
        let brute = BruteForceSearch::new(&points);

        for query in points.iter().step_by(37) {
            let a = kdtree.find_k_nearest(query, 8);
            let b = brute.find_k_nearest(query, 8);
            assert_eq!(a.len(), 8);
            for ((_, da), (_, db)) in a.iter().zip(b.iter()) {
                assert!((da - db).abs() < 1e-12);
            }
            // the query itself is always its own nearest neighbour
            assert!(a[0].1 < 1e-12);
        }
    }

    #[test]
    fn test_kdtree_radius_search() {
        let points = random_points(300, 11);
        let kdtree = KdTree::new(&points);
        let brute = BruteForceSearch::new(&points);

        let query = Point3d::new(0.0, 0.0, 0.0);
        let mut a: Vec<usize> = kdtree.find_radius_neighbors(&query, 0.3).into_iter().map(|(i, _)| i).collect();
        let mut b: Vec<usize> = brute.find_radius_neighbors(&query, 0.3).into_iter().map(|(i, _)| i).collect();
        a.sort_unstable();
        b.sort_unstable();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hybrid_search_respects_both_limits() {
        let points: Vec<Point3d> = (0..10).map(|i| Point3d::new(i as f64, 0.0, 0.0)).collect();
        let kdtree = KdTree::new(&points);

        let by_radius = kdtree.find_hybrid_neighbors(&points[0], 2.5, 50);
        assert_eq!(by_radius.len(), 3);

        let by_count = kdtree.find_hybrid_neighbors(&points[0], 100.0, 4);
        assert_eq!(by_count.len(), 4);
    }

    #[test]
    fn test_k_larger_than_cloud() {
        let points = random_points(5, 3);
        let kdtree = KdTree::new(&points);
        assert_eq!(kdtree.find_k_nearest(&points[0], 50).len(), 5);
        assert!(KdTree::new(&[]).find_k_nearest(&Point3d::origin(), 3).is_empty());
    }
}
