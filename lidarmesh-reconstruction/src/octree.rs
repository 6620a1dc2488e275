//! Adaptive octree over the reconstruction domain

use lidarmesh_core::{Error, Point3d, Result, Vector3d};
use serde::{Deserialize, Serialize};

/// Shallowest octree depth accepted for reconstruction
pub const MIN_OCTREE_DEPTH: u32 = 8;
/// Deepest octree depth accepted for reconstruction
pub const MAX_OCTREE_DEPTH: u32 = 18;
/// The cascadic solve always starts at this level
pub const COARSEST_SOLVE_DEPTH: u32 = 2;

/// Domain side length relative to the largest extent of the samples
const DOMAIN_PADDING: f64 = 1.5;
/// Shift of the domain origin, in domain sides
///
/// Not a dyadic fraction, so planes through the centre of the samples never
/// coincide with lattice vertices at any level.
const DOMAIN_SHIFT: f64 = 1.0 / 30.0;

const KEY_BITS: u32 = 21;
const KEY_MASK: u64 = (1 << KEY_BITS) - 1;

/// Pack integer lattice coordinates into one sortable key
///
/// Keys compare in lexicographic `(x, y, z)` order.
#[inline]
pub fn pack_key(key: [u32; 3]) -> u64 {
    ((key[0] as u64) << (2 * KEY_BITS)) | ((key[1] as u64) << KEY_BITS) | key[2] as u64
}

#[inline]
pub fn unpack_key(packed: u64) -> [u32; 3] {
    [
        (packed >> (2 * KEY_BITS)) as u32,
        ((packed >> KEY_BITS) & KEY_MASK) as u32,
        (packed & KEY_MASK) as u32,
    ]
}

/// The cube that contains the octree and every solver lattice
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub origin: Point3d,
    pub size: f64,
}

impl Domain {
    /// Padded cube around a set of samples
    pub fn around(points: &[Point3d]) -> Result<Self> {
        let first = points
            .first()
            .ok_or_else(|| Error::Reconstruction("no samples to reconstruct from".to_string()))?;
        let (min, max) = points
            .iter()
            .fold((*first, *first), |(min, max), p| (min.inf(p), max.sup(p)));

        let extent = (max - min).max();
        if !(extent > 0.0) || !extent.is_finite() {
            return Err(Error::Reconstruction(
                "samples have no spatial extent".to_string(),
            ));
        }

        let size = extent * DOMAIN_PADDING;
        let center = nalgebra::center(&min, &max);
        let shift = size * DOMAIN_SHIFT;
        Ok(Self {
            origin: center - Vector3d::repeat(size / 2.0 - shift),
            size,
        })
    }

    /// Edge length of a cell at `level`
    #[inline]
    pub fn cell_size(&self, level: u32) -> f64 {
        self.size / (1u64 << level) as f64
    }

    /// Continuous lattice coordinates of a point at `level`
    #[inline]
    pub fn to_lattice(&self, point: &Point3d, level: u32) -> Vector3d {
        (point - self.origin) / self.cell_size(level)
    }

    /// World position of a lattice vertex at `level`
    #[inline]
    pub fn lattice_point(&self, key: [u32; 3], level: u32) -> Point3d {
        let h = self.cell_size(level);
        self.origin + Vector3d::new(key[0] as f64, key[1] as f64, key[2] as f64) * h
    }

    /// Cell containing a point at `level`, clamped into the domain
    #[inline]
    pub fn cell_of(&self, point: &Point3d, level: u32) -> [u32; 3] {
        let u = self.to_lattice(point, level);
        let max = ((1u64 << level) - 1) as f64;
        [
            u.x.floor().clamp(0.0, max) as u32,
            u.y.floor().clamp(0.0, max) as u32,
            u.z.floor().clamp(0.0, max) as u32,
        ]
    }
}

/// A node of the octree
///
/// Children are stored as eight contiguous nodes; empty children have an
/// empty sample range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OctreeNode {
    /// Cell coordinates at `depth`
    pub key: [u32; 3],
    pub depth: u32,
    pub first_child: Option<u32>,
    /// Range into [`Octree::permutation`]
    pub start: u32,
    pub end: u32,
}

impl OctreeNode {
    #[inline]
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.first_child.is_none()
    }
}

/// A cell occupied by samples at a given level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccupiedCell {
    pub key: [u32; 3],
    /// Range into [`Octree::permutation`]
    pub start: u32,
    pub end: u32,
    /// The cell's samples lie in more than one cell at the maximum depth
    pub subdivided: bool,
}

impl OccupiedCell {
    #[inline]
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Arena octree over sample indices
///
/// A node subdivides while it is shallower than the maximum depth and its
/// samples fall into more than one cell at that depth; coincident samples
/// end in a shared leaf. Samples of a node occupy a contiguous range of the
/// index permutation, so every node's samples can be visited without
/// copying.
#[derive(Debug, Clone)]
pub struct Octree {
    domain: Domain,
    max_depth: u32,
    nodes: Vec<OctreeNode>,
    permutation: Vec<u32>,
    /// Cell of every sample at `max_depth`
    leaf_keys: Vec<[u32; 3]>,
    occupied_counts: Vec<usize>,
}

impl Octree {
    /// Build the octree for `points` inside `domain`
    ///
    /// Fails with `Error::Resource` once the arena would hold more than
    /// `max_nodes` nodes.
    pub fn build(points: &[Point3d], domain: Domain, max_depth: u32, max_nodes: usize) -> Result<Self> {
        if !(1..=MAX_OCTREE_DEPTH).contains(&max_depth) {
            return Err(Error::Config(format!(
                "octree depth must be in 1..={}, got {}",
                MAX_OCTREE_DEPTH, max_depth
            )));
        }
        if points.len() > u32::MAX as usize {
            return Err(Error::Resource(format!(
                "{} samples exceed the octree index range",
                points.len()
            )));
        }

        let leaf_keys: Vec<[u32; 3]> = points.iter().map(|p| domain.cell_of(p, max_depth)).collect();
        let mut permutation: Vec<u32> = (0..points.len() as u32).collect();
        let mut scratch = vec![0u32; points.len()];

        let mut nodes = vec![OctreeNode {
            key: [0, 0, 0],
            depth: 0,
            first_child: None,
            start: 0,
            end: points.len() as u32,
        }];

        let mut pending = vec![0usize];
        while let Some(node_idx) = pending.pop() {
            let node = nodes[node_idx];
            if node.len() <= 1 || node.depth >= max_depth {
                continue;
            }
            let (start, end) = (node.start as usize, node.end as usize);
            let first_key = leaf_keys[permutation[start] as usize];
            if permutation[start..end]
                .iter()
                .all(|&idx| leaf_keys[idx as usize] == first_key)
            {
                continue;
            }
            if nodes.len() + 8 > max_nodes {
                return Err(Error::Resource(format!(
                    "octree needs more than {} nodes at depth {}",
                    max_nodes, max_depth
                )));
            }

            let shift = max_depth - node.depth - 1;
            let octant = |idx: u32| -> usize {
                let k = leaf_keys[idx as usize];
                (((k[0] >> shift) & 1) | (((k[1] >> shift) & 1) << 1) | (((k[2] >> shift) & 1) << 2))
                    as usize
            };

            // stable counting sort of the node's range by child octant
            let mut counts = [0u32; 8];
            for &idx in &permutation[start..end] {
                counts[octant(idx)] += 1;
            }
            let mut offsets = [0u32; 8];
            for o in 1..8 {
                offsets[o] = offsets[o - 1] + counts[o - 1];
            }
            let mut cursor = offsets;
            for &idx in &permutation[start..end] {
                let o = octant(idx);
                scratch[start + cursor[o] as usize] = idx;
                cursor[o] += 1;
            }
            permutation[start..end].copy_from_slice(&scratch[start..end]);

            let first_child = nodes.len();
            for o in 0..8u32 {
                let child_start = node.start + offsets[o as usize];
                nodes.push(OctreeNode {
                    key: [
                        node.key[0] * 2 + (o & 1),
                        node.key[1] * 2 + ((o >> 1) & 1),
                        node.key[2] * 2 + ((o >> 2) & 1),
                    ],
                    depth: node.depth + 1,
                    first_child: None,
                    start: child_start,
                    end: child_start + counts[o as usize],
                });
            }
            nodes[node_idx].first_child = Some(first_child as u32);
            pending.extend((first_child..first_child + 8).filter(|&c| nodes[c].len() > 1));
        }

        // the samples of a non-empty leaf share one cell at every deeper level
        let mut occupied_counts = vec![0usize; max_depth as usize + 1];
        for node in nodes.iter().filter(|n| !n.is_empty()) {
            if node.is_leaf() {
                for count in &mut occupied_counts[node.depth as usize..] {
                    *count += 1;
                }
            } else {
                occupied_counts[node.depth as usize] += 1;
            }
        }

        Ok(Self {
            domain,
            max_depth,
            nodes,
            permutation,
            leaf_keys,
            occupied_counts,
        })
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn nodes(&self) -> &[OctreeNode] {
        &self.nodes
    }

    /// Sample indices ordered so that every node covers a contiguous range
    pub fn permutation(&self) -> &[u32] {
        &self.permutation
    }

    pub fn sample_count(&self) -> usize {
        self.permutation.len()
    }

    /// Number of distinct cells holding samples at `level`
    pub fn occupied_count(&self, level: u32) -> usize {
        self.occupied_counts
            .get(level as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Deepest level whose occupied cells hold at least `samples_per_node`
    /// samples on average
    ///
    /// Samples sharing a cell at the maximum depth count once, so duplicated
    /// points do not raise the result. The occupancy of a level does not
    /// depend on the maximum depth and the number of distinct samples only
    /// grows with it, so building a deeper tree never lowers the result.
    pub fn solve_depth(&self, samples_per_node: f64) -> u32 {
        let n = self.occupied_count(self.max_depth) as f64;
        let coarsest = COARSEST_SOLVE_DEPTH.min(self.max_depth);
        (coarsest..=self.max_depth)
            .filter(|&level| {
                let occupied = self.occupied_count(level);
                occupied > 0 && n / occupied as f64 >= samples_per_node
            })
            .max()
            .unwrap_or(coarsest)
    }

    /// Occupied cells at `level`, sorted by packed key
    ///
    /// Nodes at `level` map to themselves; leaves above it hold a single
    /// sample, or coincident samples, and map to the cell containing them.
    pub fn occupied_cells(&self, level: u32) -> Vec<OccupiedCell> {
        let level = level.min(self.max_depth);
        let mut cells: Vec<OccupiedCell> = self
            .nodes
            .iter()
            .filter(|n| !n.is_empty() && (n.depth == level || (n.is_leaf() && n.depth < level)))
            .map(|n| {
                let key = if n.depth == level {
                    n.key
                } else {
                    let sample = self.permutation[n.start as usize] as usize;
                    let leaf = self.leaf_keys[sample];
                    let down = self.max_depth - level;
                    [leaf[0] >> down, leaf[1] >> down, leaf[2] >> down]
                };
                OccupiedCell {
                    key,
                    start: n.start,
                    end: n.end,
                    subdivided: n.depth == level && !n.is_leaf(),
                }
            })
            .collect();
        cells.sort_unstable_by_key(|c| pack_key(c.key));
        cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn terrain_samples(n: usize, seed: u64) -> Vec<Point3d> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let x: f64 = rng.gen_range(-0.5..0.5);
                let y: f64 = rng.gen_range(-0.5..0.5);
                Point3d::new(x, y, 0.05 * (3.0 * x).sin() + rng.gen_range(-0.005..0.005))
            })
            .collect()
    }

    #[test]
    fn test_pack_key_round_trip_and_order() {
        let a = [3, 7, 262_144];
        assert_eq!(unpack_key(pack_key(a)), a);
        assert!(pack_key([1, 0, 0]) > pack_key([0, 500, 500]));
        assert!(pack_key([0, 1, 0]) > pack_key([0, 0, 500]));
    }

    #[test]
    fn test_domain_contains_samples_off_lattice() {
        let points = terrain_samples(500, 1);
        let domain = Domain::around(&points).unwrap();
        for p in &points {
            let u = domain.to_lattice(p, 0);
            assert!(u.iter().all(|c| *c > 0.0 && *c < 1.0));
        }
        // the horizontal plane through the centre never passes through a lattice vertex
        let (min_z, max_z) = points
            .iter()
            .fold((f64::MAX, f64::MIN), |(lo, hi), p| (lo.min(p.z), hi.max(p.z)));
        let center_z = (min_z + max_z) / 2.0;
        for level in 0..=MAX_OCTREE_DEPTH {
            let u = (center_z - domain.origin.z) / domain.cell_size(level);
            assert!((u - u.round()).abs() > 1e-6, "level {}", level);
        }
    }

    #[test]
    fn test_domain_rejects_degenerate_input() {
        assert!(Domain::around(&[]).is_err());
        assert!(Domain::around(&[Point3d::new(1.0, 1.0, 1.0); 4]).is_err());
    }

    #[test]
    fn test_octree_structure() {
        let points = terrain_samples(2000, 2);
        let domain = Domain::around(&points).unwrap();
        let octree = Octree::build(&points, domain, 8, usize::MAX).unwrap();

        let mut seen: Vec<u32> = octree.permutation().to_vec();
        seen.sort_unstable();
        assert_eq!(seen, (0..2000).collect::<Vec<u32>>());

        for node in octree.nodes() {
            assert!(node.depth <= 8);
            match node.first_child {
                Some(first) => {
                    let children = &octree.nodes()[first as usize..first as usize + 8];
                    assert_eq!(children[0].start, node.start);
                    assert_eq!(children[7].end, node.end);
                    assert!(node.len() > 1);
                }
                None => {
                    let samples = &octree.permutation()[node.start as usize..node.end as usize];
                    let distinct: BTreeSet<[u32; 3]> =
                        samples.iter().map(|&s| domain.cell_of(&points[s as usize], 8)).collect();
                    assert!(distinct.len() <= 1 || node.depth == 8);
                }
            }
            for &sample in &octree.permutation()[node.start as usize..node.end as usize] {
                assert_eq!(domain.cell_of(&points[sample as usize], node.depth), node.key);
            }
        }
    }

    #[test]
    fn test_occupied_counts_match_distinct_cells() {
        let points = terrain_samples(3000, 3);
        let domain = Domain::around(&points).unwrap();
        let octree = Octree::build(&points, domain, 9, usize::MAX).unwrap();

        for level in 0..=9 {
            let distinct: BTreeSet<[u32; 3]> = points.iter().map(|p| domain.cell_of(p, level)).collect();
            assert_eq!(octree.occupied_count(level), distinct.len(), "level {}", level);

            let cells = octree.occupied_cells(level);
            assert_eq!(cells.len(), distinct.len());
            assert!(cells.windows(2).all(|w| pack_key(w[0].key) < pack_key(w[1].key)));
            for cell in &cells {
                let samples = &octree.permutation()[cell.start as usize..cell.end as usize];
                for &s in samples {
                    assert_eq!(domain.cell_of(&points[s as usize], level), cell.key);
                }
                let leaves: BTreeSet<[u32; 3]> = samples
                    .iter()
                    .map(|&s| domain.cell_of(&points[s as usize], 9))
                    .collect();
                assert_eq!(cell.subdivided, level < 9 && leaves.len() > 1, "level {}", level);
            }
        }
    }

    #[test]
    fn test_solve_depth_never_decreases_with_depth() {
        let points = terrain_samples(5000, 4);
        let domain = Domain::around(&points).unwrap();

        let mut previous = 0;
        for depth in MIN_OCTREE_DEPTH..=12 {
            let octree = Octree::build(&points, domain, depth, usize::MAX).unwrap();
            let solve = octree.solve_depth(1.5);
            assert!(solve >= previous);
            assert!(solve <= depth && solve >= COARSEST_SOLVE_DEPTH);
            let n = octree.occupied_count(depth) as f64;
            assert!(n / octree.occupied_count(solve) as f64 >= 1.5);
            previous = solve;
        }
    }

    #[test]
    fn test_duplicates_do_not_raise_solve_depth() {
        let points = terrain_samples(3000, 7);
        let doubled: Vec<Point3d> = points.iter().flat_map(|p| [*p, *p]).collect();
        let domain = Domain::around(&points).unwrap();

        let single = Octree::build(&points, domain, 14, usize::MAX).unwrap();
        let paired = Octree::build(&doubled, domain, 14, usize::MAX).unwrap();
        assert_eq!(paired.solve_depth(1.5), single.solve_depth(1.5));
        assert!(paired.solve_depth(1.5) < 14);
    }

    #[test]
    fn test_coincident_samples_share_a_leaf() {
        let points = terrain_samples(2000, 5);
        let doubled: Vec<Point3d> = points.iter().flat_map(|p| [*p, *p]).collect();
        let domain = Domain::around(&points).unwrap();

        let single = Octree::build(&points, domain, 18, usize::MAX).unwrap();
        let paired = Octree::build(&doubled, domain, 18, usize::MAX).unwrap();
        assert_eq!(paired.nodes().len(), single.nodes().len());
        assert_eq!(paired.sample_count(), 4000);
        for level in [8, 12, 18] {
            assert_eq!(paired.occupied_count(level), single.occupied_count(level));
        }

        let stacked = vec![Point3d::new(0.1, 0.2, 0.0); 500];
        let mut with_stack = points.clone();
        with_stack.extend(stacked);
        let octree = Octree::build(&with_stack, domain, 18, usize::MAX).unwrap();
        assert!(octree.nodes().len() <= single.nodes().len() + 8 * 18);
    }

    #[test]
    fn test_node_budget_is_a_resource_error() {
        let points = terrain_samples(2000, 6);
        let domain = Domain::around(&points).unwrap();
        let full = Octree::build(&points, domain, 12, usize::MAX).unwrap();

        let result = Octree::build(&points, domain, 12, full.nodes().len() - 1);
        assert!(matches!(result, Err(Error::Resource(_))));
        assert!(Octree::build(&points, domain, 12, full.nodes().len()).is_ok());
    }
}
