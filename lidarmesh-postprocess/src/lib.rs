//! Mesh post-processing for reconstructed terrain
//!
//! This crate provides the operations applied to a surface after
//! reconstruction:
//! - Density trimming of weakly supported vertices
//! - Merging of adjacent triangle pairs into quads

pub mod density_trim;
pub mod quad_merge;

pub use density_trim::*;
pub use quad_merge::*;

use lidarmesh_core::{Result, TerrainMesh};

/// A transformation from one terrain mesh to another
pub trait MeshProcessor {
    /// Process `mesh`, returning a new mesh
    fn process(&self, mesh: &TerrainMesh) -> Result<TerrainMesh>;
}
