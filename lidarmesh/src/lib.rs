//! # lidarmesh
//!
//! Conversion of LiDAR point clouds into terrain meshes.
//!
//! This is the umbrella crate: it owns the validated [`ConversionConfig`] and
//! the [`convert`] entry point, and re-exports the stage crates for callers
//! that want to run stages individually.
//!
//! ## Pipeline
//!
//! 1. Z-axis statistical outlier removal
//! 2. Normalization into the unit cube
//! 3. Voxel grid downsampling toward a point budget
//! 4. PCA normal estimation
//! 5. Screened Poisson reconstruction with per-vertex densities
//! 6. Optional density trimming, then triangle-to-quad merging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lidarmesh::prelude::*;
//!
//! fn main() -> lidarmesh::Result<()> {
//!     let points: Vec<Point3d> = (0..40_000)
//!         .map(|i| {
//!             let (x, y) = ((i % 200) as f64, (i / 200) as f64);
//!             Point3d::new(x, y, 0.1 * (x * 0.05).sin())
//!         })
//!         .collect();
//!
//!     let output = convert(&points, &ConversionConfig::default())?;
//!     println!(
//!         "{} vertices, {} quads",
//!         output.mesh.vertex_count(),
//!         output.mesh.quad_count()
//!     );
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod pipeline;

pub use config::*;
pub use pipeline::*;

pub use lidarmesh_algorithms as algorithms;
pub use lidarmesh_postprocess as postprocess;
pub use lidarmesh_reconstruction as reconstruction;

pub use lidarmesh_core::{Error, ErrorKind, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ConversionConfig;
    pub use crate::pipeline::{convert, ConversionOutput, ConversionReport, Converter};
    pub use lidarmesh_algorithms::{Normalization, NormalOrientation};
    pub use lidarmesh_core::{
        CancellationToken, Error, ErrorKind, Face, NormalPoint3d, Point3d, PointCloud, Result,
        TerrainMesh, Vector3d,
    };
    pub use lidarmesh_postprocess::{QuadMergeConfig, TrimThreshold};
    pub use lidarmesh_reconstruction::{PoissonConfig, ResourceLimits};
}
