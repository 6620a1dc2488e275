//! Triangle-to-quad merging
//!
//! Pairs of triangles sharing an interior edge are joined into quads when the
//! pair is nearly planar and the resulting quad is convex and close to
//! rectangular. Candidate pairs are ranked by how well they meet both
//! criteria and merged greedily, best first; a merge only ever removes other
//! candidates, so one sorted pass visits them all.

use crate::MeshProcessor;
use itertools::Itertools;
use lidarmesh_core::{Error, Face, Point3d, Result, TerrainMesh, Vector3d};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::FRAC_PI_2;
use tracing::debug;

/// Quad merging thresholds, in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadMergeConfig {
    /// Largest angle between the normals of the two triangles
    pub face_threshold: f64,
    /// Largest deviation of any quad corner from a right angle
    pub shape_threshold: f64,
}

impl Default for QuadMergeConfig {
    fn default() -> Self {
        Self {
            face_threshold: 40.0,
            shape_threshold: 40.0,
        }
    }
}

impl QuadMergeConfig {
    pub fn with_face_threshold(mut self, degrees: f64) -> Self {
        self.face_threshold = degrees;
        self
    }

    pub fn with_shape_threshold(mut self, degrees: f64) -> Self {
        self.shape_threshold = degrees;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("face_threshold", self.face_threshold),
            ("shape_threshold", self.shape_threshold),
        ] {
            if !(value > 0.0 && value <= 180.0) {
                return Err(Error::Config(format!(
                    "{} must be in (0, 180] degrees, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// A pair of triangles that may become one quad
#[derive(Debug, Clone, Copy)]
struct Candidate {
    error: f64,
    first: usize,
    second: usize,
    quad: [usize; 4],
}

/// Joins adjacent triangles into quads
#[derive(Debug, Clone, Default)]
pub struct QuadMerger {
    config: QuadMergeConfig,
}

impl QuadMerger {
    pub fn new(config: QuadMergeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QuadMergeConfig {
        &self.config
    }

    /// Score the quad formed by two triangles, or `None` if it may not be formed
    fn evaluate(&self, mesh: &TerrainMesh, n1: &Vector3d, n2: &Vector3d, quad: [usize; 4]) -> Option<f64> {
        let face_limit = self.config.face_threshold.to_radians();
        let shape_limit = self.config.shape_threshold.to_radians();

        let dihedral = n1.dot(n2).clamp(-1.0, 1.0).acos();
        if dihedral > face_limit {
            return None;
        }

        let normal = mesh.face_normal(&Face::Quad(quad)).try_normalize(f64::EPSILON)?;
        let corners: [Point3d; 4] = quad.map(|v| mesh.vertices[v]);

        let mut worst = 0.0f64;
        for (prev, corner, next) in corners.iter().circular_tuple_windows() {
            let incoming = corner - prev;
            let outgoing = next - corner;
            if incoming.cross(&outgoing).dot(&normal) <= 0.0 {
                return None;
            }
            let angle = (prev - corner).angle(&(next - corner));
            worst = worst.max((angle - FRAC_PI_2).abs());
        }
        if worst > shape_limit {
            return None;
        }

        Some(dihedral / face_limit + worst / shape_limit)
    }

    /// Triangle pairs that share an edge used by exactly those two faces
    fn candidates(&self, mesh: &TerrainMesh) -> Vec<Candidate> {
        let normals: Vec<Option<Vector3d>> = mesh
            .faces
            .par_iter()
            .map(|face| match face {
                Face::Triangle(_) => mesh.face_normal(face).try_normalize(f64::EPSILON),
                Face::Quad(_) => None,
            })
            .collect();

        // (undirected edge, face, directed from lower to higher vertex)
        let mut edges: Vec<((usize, usize), usize, bool)> = mesh
            .faces
            .iter()
            .enumerate()
            .flat_map(|(fi, face)| {
                face.indices()
                    .iter()
                    .circular_tuple_windows()
                    .map(move |(&a, &b)| ((a.min(b), a.max(b)), fi, a < b))
            })
            .collect();
        edges.par_sort_unstable();

        let pairs: Vec<(usize, usize, usize, usize)> = edges
            .chunk_by(|x, y| x.0 == y.0)
            .filter_map(|group| match group {
                [(edge, f1, forward), (_, f2, backward)] if forward != backward && f1 != f2 => {
                    // orient the shared edge as it runs in the first face
                    let (a, b) = if *forward { *edge } else { (edge.1, edge.0) };
                    Some((*f1, *f2, a, b))
                }
                _ => None,
            })
            .collect();

        pairs
            .par_iter()
            .filter_map(|&(first, second, a, b)| {
                let (Face::Triangle(t1), Face::Triangle(t2)) = (mesh.faces[first], mesh.faces[second]) else {
                    return None;
                };
                let n1 = normals[first].as_ref()?;
                let n2 = normals[second].as_ref()?;

                let c = *t1.iter().find(|&&v| v != a && v != b)?;
                let d = *t2.iter().find(|&&v| v != a && v != b)?;
                if c == d {
                    return None;
                }

                let quad = [a, d, b, c];
                self.evaluate(mesh, n1, n2, quad).map(|error| Candidate {
                    error,
                    first,
                    second,
                    quad,
                })
            })
            .collect()
    }

    /// Merge triangle pairs into quads
    ///
    /// Vertices and densities are unchanged. A merged quad takes the place of
    /// the lower-indexed triangle of its pair; all other faces keep their
    /// order.
    pub fn merge(&self, mesh: &TerrainMesh) -> Result<TerrainMesh> {
        self.config.validate()?;
        mesh.validate()?;

        let mut candidates = self.candidates(mesh);
        candidates.sort_unstable_by(|x, y| {
            x.error
                .total_cmp(&y.error)
                .then(x.first.cmp(&y.first))
                .then(x.second.cmp(&y.second))
        });

        let mut consumed = vec![false; mesh.face_count()];
        let mut replacement: Vec<Option<Face>> = vec![None; mesh.face_count()];
        let mut merged = 0usize;
        for candidate in &candidates {
            if consumed[candidate.first] || consumed[candidate.second] {
                continue;
            }
            consumed[candidate.first] = true;
            consumed[candidate.second] = true;
            replacement[candidate.first.min(candidate.second)] = Some(Face::Quad(candidate.quad));
            merged += 1;
        }

        let faces: Vec<Face> = mesh
            .faces
            .iter()
            .enumerate()
            .filter_map(|(fi, face)| match replacement[fi] {
                Some(quad) => Some(quad),
                None if consumed[fi] => None,
                None => Some(*face),
            })
            .collect();

        debug!(
            candidates = candidates.len(),
            quads = merged,
            "merged triangle pairs"
        );

        Ok(TerrainMesh {
            vertices: mesh.vertices.clone(),
            faces,
            densities: mesh.densities.clone(),
        })
    }
}

impl MeshProcessor for QuadMerger {
    fn process(&self, mesh: &TerrainMesh) -> Result<TerrainMesh> {
        self.merge(mesh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// `size` x `size` grid of unit squares, each split along a diagonal
    fn grid(size: usize, height: impl Fn(f64, f64) -> f64) -> TerrainMesh {
        let stride = size + 1;
        let vertices = (0..stride * stride)
            .map(|i| {
                let (x, y) = ((i % stride) as f64, (i / stride) as f64);
                Point3d::new(x, y, height(x, y))
            })
            .collect();
        let mut triangles = Vec::new();
        for y in 0..size {
            for x in 0..size {
                let v = y * stride + x;
                triangles.push([v, v + 1, v + stride + 1]);
                triangles.push([v, v + stride + 1, v + stride]);
            }
        }
        TerrainMesh::from_triangles(vertices, triangles)
    }

    #[test]
    fn test_single_square_becomes_quad() {
        let mesh = grid(1, |_, _| 0.0);
        let merged = QuadMerger::default().merge(&mesh).unwrap();

        assert_eq!(merged.face_count(), 1);
        assert_eq!(merged.quad_count(), 1);
        assert_eq!(merged.faces[0], Face::Quad([3, 2, 0, 1]));
        assert_relative_eq!(merged.face_normal(&merged.faces[0]).z, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_grid_merges_into_squares() {
        let mesh = grid(6, |x, y| 0.05 * (x + y));
        let merged = QuadMerger::default().process(&mesh).unwrap();

        assert_eq!(merged.quad_count(), 36);
        assert_eq!(merged.triangle_count(), 0);
        assert_eq!(merged.vertices, mesh.vertices);
        assert!(merged.validate().is_ok());
        for face in &merged.faces {
            assert!(merged.face_normal(face).z > 0.0);
        }
    }

    #[test]
    fn test_folded_pair_is_kept() {
        // the second triangle is folded up by 90 degrees along the diagonal
        let mesh = TerrainMesh::from_triangles(
            vec![
                Point3d::new(0.0, 0.0, 0.0),
                Point3d::new(1.0, 0.0, 0.0),
                Point3d::new(1.0, 1.0, 0.0),
                Point3d::new(0.5, 0.5, 0.7071),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        );
        let merged = QuadMerger::default().merge(&mesh).unwrap();
        assert_eq!(merged.faces, mesh.faces);
    }

    #[test]
    fn test_skewed_pair_is_kept() {
        // rhombus with 30 and 150 degree corners
        let s = 30f64.to_radians();
        let mesh = TerrainMesh::from_triangles(
            vec![
                Point3d::new(0.0, 0.0, 0.0),
                Point3d::new(1.0, 0.0, 0.0),
                Point3d::new(1.0 + s.cos(), s.sin(), 0.0),
                Point3d::new(s.cos(), s.sin(), 0.0),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        );
        assert_eq!(QuadMerger::default().merge(&mesh).unwrap().quad_count(), 0);

        let relaxed = QuadMerger::new(QuadMergeConfig::default().with_shape_threshold(70.0));
        assert_eq!(relaxed.merge(&mesh).unwrap().quad_count(), 1);
    }

    #[test]
    fn test_non_convex_pair_is_kept() {
        // dart: the fourth vertex sits inside the triangle's hull
        let mesh = TerrainMesh::from_triangles(
            vec![
                Point3d::new(0.0, 0.0, 0.0),
                Point3d::new(2.0, 0.0, 0.0),
                Point3d::new(1.0, 2.0, 0.0),
                Point3d::new(1.0, 0.5, 0.0),
            ],
            vec![[0, 1, 3], [1, 2, 3]],
        );
        let merged = QuadMerger::new(
            QuadMergeConfig::default()
                .with_face_threshold(180.0)
                .with_shape_threshold(180.0),
        )
        .merge(&mesh)
        .unwrap();
        assert_eq!(merged.quad_count(), 0);
    }

    #[test]
    fn test_non_manifold_edge_is_not_merged() {
        let mut mesh = grid(1, |_, _| 0.0);
        mesh.add_vertex(Point3d::new(0.5, 0.5, 1.0));
        mesh.add_face(Face::Triangle([0, 3, 4]));
        let merged = QuadMerger::default().merge(&mesh).unwrap();
        assert_eq!(merged.quad_count(), 0);
        assert_eq!(merged.face_count(), 3);
    }

    #[test]
    fn test_densities_are_preserved() {
        let mut mesh = grid(2, |_, _| 0.0);
        mesh.set_densities((0..9).map(|i| i as f64).collect()).unwrap();
        let merged = QuadMerger::default().merge(&mesh).unwrap();
        assert_eq!(merged.densities, mesh.densities);
    }

    #[test]
    fn test_invalid_thresholds() {
        let mesh = grid(1, |_, _| 0.0);
        let merger = QuadMerger::new(QuadMergeConfig::default().with_face_threshold(0.0));
        assert!(matches!(merger.merge(&mesh), Err(Error::Config(_))));
    }
}
