//! # lidarmesh Algorithms
//!
//! Point cloud stages that run before surface reconstruction.
//!
//! This crate provides z-axis outlier filtering, coordinate normalization,
//! voxel grid downsampling and PCA normal estimation backed by a k-d tree.

pub mod filtering;
pub mod normalize;
pub mod downsample;
pub mod normals;
pub mod nearest_neighbor;

// Re-export commonly used items
pub use filtering::*;
pub use normalize::*;
pub use downsample::*;
pub use normals::*;
pub use nearest_neighbor::*;
