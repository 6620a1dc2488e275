//! Density-based trimming of reconstructed surfaces

use crate::MeshProcessor;
use lidarmesh_core::{Error, Result, TerrainMesh};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Density below which vertices are removed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum TrimThreshold {
    /// A fixed density value
    Absolute(f64),
    /// A quantile of the mesh's densities, in `[0, 1)`
    Quantile(f64),
}

impl TrimThreshold {
    pub fn validate(&self) -> Result<()> {
        match *self {
            TrimThreshold::Absolute(v) if !v.is_finite() => Err(Error::Config(format!(
                "absolute density threshold must be finite, got {}",
                v
            ))),
            TrimThreshold::Quantile(q) if !(0.0..1.0).contains(&q) => Err(Error::Config(format!(
                "density quantile must be in [0, 1), got {}",
                q
            ))),
            _ => Ok(()),
        }
    }

    /// Concrete density value for a set of densities
    pub fn resolve(&self, densities: &[f64]) -> Result<f64> {
        self.validate()?;
        match *self {
            TrimThreshold::Absolute(v) => Ok(v),
            TrimThreshold::Quantile(q) => {
                if densities.is_empty() {
                    return Err(Error::Input("no densities to take a quantile of".to_string()));
                }
                let mut sorted = densities.to_vec();
                sorted.sort_unstable_by(f64::total_cmp);
                let rank = (q * (sorted.len() - 1) as f64).floor() as usize;
                Ok(sorted[rank])
            }
        }
    }
}

/// Removes vertices with low sample support and every face touching them
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DensityTrim {
    threshold: TrimThreshold,
}

impl DensityTrim {
    pub fn new(threshold: TrimThreshold) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> TrimThreshold {
        self.threshold
    }
}

impl MeshProcessor for DensityTrim {
    fn process(&self, mesh: &TerrainMesh) -> Result<TerrainMesh> {
        trim_by_density(mesh, self.threshold)
    }
}

/// Remove vertices whose density is below `threshold`
///
/// Surviving vertices keep their relative order and their densities; faces
/// are re-indexed, and dropped if any of their vertices was removed.
pub fn trim_by_density(mesh: &TerrainMesh, threshold: TrimThreshold) -> Result<TerrainMesh> {
    let densities = mesh
        .densities
        .as_ref()
        .ok_or_else(|| Error::Input("density trimming needs per-vertex densities".to_string()))?;
    if densities.len() != mesh.vertex_count() {
        return Err(Error::Input(format!(
            "mesh has {} densities for {} vertices",
            densities.len(),
            mesh.vertex_count()
        )));
    }
    mesh.validate()?;
    if let Some(bad) = densities.iter().position(|d| !d.is_finite()) {
        return Err(Error::Input(format!("vertex {} has a non-finite density", bad)));
    }

    let cutoff = threshold.resolve(densities)?;

    let mut map = vec![None; mesh.vertex_count()];
    let mut vertices = Vec::with_capacity(mesh.vertex_count());
    let mut kept_densities = Vec::with_capacity(mesh.vertex_count());
    for (i, (vertex, &density)) in mesh.vertices.iter().zip(densities.iter()).enumerate() {
        if density >= cutoff {
            map[i] = Some(vertices.len());
            vertices.push(*vertex);
            kept_densities.push(density);
        }
    }

    let faces: Vec<_> = mesh.faces.iter().filter_map(|f| f.remap(&map)).collect();

    debug!(
        cutoff,
        removed_vertices = mesh.vertex_count() - vertices.len(),
        removed_faces = mesh.face_count() - faces.len(),
        "trimmed low-density vertices"
    );

    Ok(TerrainMesh {
        vertices,
        faces,
        densities: Some(kept_densities),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lidarmesh_core::{Face, Point3d};

    /// Strip of four triangles over six vertices
    fn strip(densities: Vec<f64>) -> TerrainMesh {
        let vertices = (0..6)
            .map(|i| Point3d::new((i / 2) as f64, (i % 2) as f64, 0.0))
            .collect();
        let mut mesh = TerrainMesh::from_triangles(
            vertices,
            vec![[0, 2, 1], [1, 2, 3], [2, 4, 3], [3, 4, 5]],
        );
        mesh.set_densities(densities).unwrap();
        mesh
    }

    #[test]
    fn test_absolute_threshold() {
        let mesh = strip(vec![5.0, 5.0, 5.0, 5.0, 1.0, 5.0]);
        let trimmed = trim_by_density(&mesh, TrimThreshold::Absolute(2.0)).unwrap();

        assert_eq!(trimmed.vertex_count(), 5);
        assert_eq!(trimmed.faces, vec![Face::Triangle([0, 2, 1]), Face::Triangle([1, 2, 3])]);
        assert_eq!(trimmed.densities, Some(vec![5.0; 5]));
        assert_eq!(trimmed.vertices[4], Point3d::new(2.0, 1.0, 0.0));
        assert!(trimmed.validate().is_ok());
    }

    #[test]
    fn test_quantile_threshold() {
        let mesh = strip(vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0]);
        // rank floor(0.2 * 5) = 1 of the sorted densities, i.e. 2.0
        let trimmed = trim_by_density(&mesh, TrimThreshold::Quantile(0.2)).unwrap();
        assert_eq!(trimmed.vertex_count(), 5);
        assert_eq!(trimmed.face_count(), 3);

        let untouched = trim_by_density(&mesh, TrimThreshold::Quantile(0.0)).unwrap();
        assert_eq!(untouched, mesh);
    }

    #[test]
    fn test_missing_densities_is_an_input_error() {
        let mut mesh = strip(vec![1.0; 6]);
        mesh.densities = None;
        let result = DensityTrim::new(TrimThreshold::Absolute(0.5)).process(&mesh);
        assert!(matches!(result, Err(Error::Input(_))));
    }

    #[test]
    fn test_out_of_range_face_is_an_error() {
        let mut mesh = strip(vec![1.0; 6]);
        mesh.faces.push(Face::Triangle([3, 5, 6]));
        let result = trim_by_density(&mesh, TrimThreshold::Absolute(0.5));
        assert!(matches!(result, Err(Error::Reconstruction(_))));
    }

    #[test]
    fn test_threshold_validation() {
        assert!(TrimThreshold::Quantile(1.0).validate().is_err());
        assert!(TrimThreshold::Quantile(-0.1).validate().is_err());
        assert!(TrimThreshold::Absolute(f64::NAN).validate().is_err());
        assert!(TrimThreshold::Quantile(0.99).validate().is_ok());
    }
}
