//! Mesh data structures and functionality

use crate::error::{Error, Result};
use crate::point::*;
use serde::{Deserialize, Serialize};

/// A polygonal face referencing mesh vertices by index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Face {
    Triangle([usize; 3]),
    /// Only produced by quad merging
    Quad([usize; 4]),
}

impl Face {
    /// Vertex indices of the face in winding order
    pub fn indices(&self) -> &[usize] {
        match self {
            Face::Triangle(idx) => idx,
            Face::Quad(idx) => idx,
        }
    }

    pub fn is_triangle(&self) -> bool {
        matches!(self, Face::Triangle(_))
    }

    pub fn is_quad(&self) -> bool {
        matches!(self, Face::Quad(_))
    }

    /// Apply an index remapping; `None` if any vertex was dropped
    pub fn remap(&self, map: &[Option<usize>]) -> Option<Face> {
        match self {
            Face::Triangle([a, b, c]) => Some(Face::Triangle([map[*a]?, map[*b]?, map[*c]?])),
            Face::Quad([a, b, c, d]) => {
                Some(Face::Quad([map[*a]?, map[*b]?, map[*c]?, map[*d]?]))
            }
        }
    }
}

/// Terrain mesh produced by the reconstruction pipeline
///
/// Faces are triangles, or quads once adjacent triangles have been merged.
/// `densities`, when present, has one entry per vertex.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerrainMesh {
    pub vertices: Vec<Point3d>,
    pub faces: Vec<Face>,
    pub densities: Option<Vec<f64>>,
}

impl TerrainMesh {
    /// Create a new empty mesh
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a triangle mesh from vertices and index triples
    pub fn from_triangles(vertices: Vec<Point3d>, triangles: Vec<[usize; 3]>) -> Self {
        Self {
            vertices,
            faces: triangles.into_iter().map(Face::Triangle).collect(),
            densities: None,
        }
    }

    /// Get the number of vertices
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Get the number of faces
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.faces.iter().filter(|f| f.is_triangle()).count()
    }

    pub fn quad_count(&self) -> usize {
        self.faces.iter().filter(|f| f.is_quad()).count()
    }

    /// Check if the mesh is empty
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.faces.is_empty()
    }

    /// Add a vertex to the mesh
    pub fn add_vertex(&mut self, vertex: Point3d) -> usize {
        let index = self.vertices.len();
        self.vertices.push(vertex);
        index
    }

    /// Add a face to the mesh
    pub fn add_face(&mut self, face: Face) {
        self.faces.push(face);
    }

    /// Set per-vertex densities
    ///
    /// Fails with `Error::Input` unless there is exactly one value per
    /// vertex; the mesh is left unchanged in that case.
    pub fn set_densities(&mut self, densities: Vec<f64>) -> Result<()> {
        if densities.len() != self.vertices.len() {
            return Err(Error::Input(format!(
                "{} densities given for {} vertices",
                densities.len(),
                self.vertices.len()
            )));
        }
        self.densities = Some(densities);
        Ok(())
    }

    /// Move the vertices and faces of `other` into this mesh
    ///
    /// Face indices of `other` are offset past the existing vertices. The
    /// result keeps densities only if both meshes carry them.
    pub fn append(&mut self, other: TerrainMesh) {
        let offset = self.vertices.len();
        let had_vertices = offset > 0 || !self.faces.is_empty();
        self.densities = match (self.densities.take(), other.densities) {
            (Some(mut ours), Some(theirs)) => {
                ours.extend(theirs);
                Some(ours)
            }
            (None, Some(theirs)) if !had_vertices => Some(theirs),
            _ => None,
        };
        self.vertices.extend(other.vertices);
        self.faces.extend(other.faces.into_iter().map(|face| match face {
            Face::Triangle([a, b, c]) => Face::Triangle([a + offset, b + offset, c + offset]),
            Face::Quad([a, b, c, d]) => {
                Face::Quad([a + offset, b + offset, c + offset, d + offset])
            }
        }));
    }

    /// Area-weighted normal of a face (Newell's method), not normalized
    pub fn face_normal(&self, face: &Face) -> Vector3d {
        let idx = face.indices();
        let mut normal = Vector3d::zeros();
        for i in 0..idx.len() {
            let a = self.vertices[idx[i]];
            let b = self.vertices[idx[(i + 1) % idx.len()]];
            normal.x += (a.y - b.y) * (a.z + b.z);
            normal.y += (a.z - b.z) * (a.x + b.x);
            normal.z += (a.x - b.x) * (a.y + b.y);
        }
        normal * 0.5
    }

    /// Check that every face index is in range and the density array matches
    pub fn validate(&self) -> Result<()> {
        let n = self.vertices.len();
        for (fi, face) in self.faces.iter().enumerate() {
            if let Some(&bad) = face.indices().iter().find(|&&i| i >= n) {
                return Err(Error::Reconstruction(format!(
                    "face {} references vertex {} but the mesh has {} vertices",
                    fi, bad, n
                )));
            }
        }
        if let Some(densities) = &self.densities {
            if densities.len() != n {
                return Err(Error::Reconstruction(format!(
                    "density field has {} values for {} vertices",
                    densities.len(),
                    n
                )));
            }
        }
        Ok(())
    }

    /// Clear the mesh
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.faces.clear();
        self.densities = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_square() -> TerrainMesh {
        TerrainMesh::from_triangles(
            vec![
                Point3d::new(0.0, 0.0, 0.0),
                Point3d::new(1.0, 0.0, 0.0),
                Point3d::new(1.0, 1.0, 0.0),
                Point3d::new(0.0, 1.0, 0.0),
            ],
            vec![[0, 1, 2], [0, 2, 3]],
        )
    }

    #[test]
    fn test_counts() {
        let mut mesh = unit_square();
        assert_eq!(mesh.vertex_count(), 4);
        assert_eq!(mesh.face_count(), 2);
        assert_eq!(mesh.triangle_count(), 2);
        assert_eq!(mesh.quad_count(), 0);

        mesh.faces = vec![Face::Quad([0, 1, 2, 3])];
        assert_eq!(mesh.quad_count(), 1);
    }

    #[test]
    fn test_face_normal_counter_clockwise_is_up() {
        let mesh = unit_square();
        let n = mesh.face_normal(&mesh.faces[0]);
        assert_relative_eq!(n.z, 0.5, epsilon = 1e-12);

        let quad = Face::Quad([0, 1, 2, 3]);
        assert_relative_eq!(mesh.face_normal(&quad).z, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_validate_rejects_out_of_range_index() {
        let mut mesh = unit_square();
        assert!(mesh.validate().is_ok());
        mesh.add_face(Face::Triangle([0, 1, 4]));
        assert!(mesh.validate().is_err());
    }

    #[test]
    fn test_set_densities_requires_matching_length() {
        let mut mesh = unit_square();
        let err = mesh.set_densities(vec![1.0; 3]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Input);
        assert!(mesh.densities.is_none());
        mesh.set_densities(vec![1.0; 4]).unwrap();
        assert_eq!(mesh.densities.as_ref().map(Vec::len), Some(4));
    }

    #[test]
    fn test_append_offsets_faces_and_keeps_densities() {
        let mut mesh = unit_square();
        mesh.set_densities(vec![1.0; 4]).unwrap();
        let mut other = unit_square();
        other.set_densities(vec![2.0; 4]).unwrap();
        other.faces = vec![Face::Quad([0, 1, 2, 3])];

        mesh.append(other);
        assert_eq!(mesh.vertex_count(), 8);
        assert_eq!(mesh.faces[2], Face::Quad([4, 5, 6, 7]));
        assert_eq!(mesh.densities.as_ref().map(|d| d[5]), Some(2.0));
        assert!(mesh.validate().is_ok());

        let mut empty = TerrainMesh::new();
        empty.append(mesh.clone());
        assert_eq!(empty, mesh);

        mesh.append(unit_square());
        assert!(mesh.densities.is_none());
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn test_face_remap() {
        let map = vec![Some(0), None, Some(1), Some(2)];
        assert_eq!(Face::Triangle([0, 2, 3]).remap(&map), Some(Face::Triangle([0, 1, 2])));
        assert_eq!(Face::Triangle([0, 1, 2]).remap(&map), None);
    }
}
