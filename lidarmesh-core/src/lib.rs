//! Core data structures and traits for lidarmesh
//!
//! This crate provides the fundamental types shared by every stage of the
//! point-cloud-to-terrain pipeline: points, point clouds, polygon meshes,
//! transforms, the error taxonomy, cooperative cancellation and
//! deterministic parallel reductions.

pub mod point;
pub mod point_cloud;
pub mod mesh;
pub mod traits;
pub mod transform;
pub mod error;
pub mod cancel;
pub mod reduce;

pub use point::*;
pub use point_cloud::*;
pub use mesh::*;
pub use traits::*;
pub use transform::*;
pub use error::*;
pub use cancel::*;
pub use reduce::chunked_sum;

/// Re-export commonly used types from nalgebra
pub use nalgebra::{Matrix3, Point3, Vector3};
