//! # lidarmesh Reconstruction
//!
//! Surface reconstruction from oriented terrain samples.
//!
//! This crate turns a point cloud with unit normals into a triangle mesh by
//! solving a screened Poisson problem on a sparse lattice band and extracting
//! an isosurface with marching cubes. Every vertex of the result carries the
//! sample density around it, which later stages use to trim the surface.

pub mod parallel;
pub mod octree;
pub mod lattice;
pub mod solver;
pub mod marching_cubes;
pub mod poisson;

// Re-export commonly used items
pub use parallel::{execute_parallel, init_thread_pool, ThreadPoolConfig};
pub use octree::{Domain, Octree, MAX_OCTREE_DEPTH, MIN_OCTREE_DEPTH};
pub use marching_cubes::*;
pub use poisson::*;
