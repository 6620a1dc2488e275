//! Sparse lattice band around the samples at one solver level

use crate::octree::{pack_key, unpack_key};
use lidarmesh_core::{Error, Result};
use rayon::prelude::*;

/// Marker for a missing neighbour
pub const NO_VERTEX: u32 = u32::MAX;

/// Corner offsets of a cell, in marching cubes order
pub const CORNER_OFFSETS: [[u32; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

/// Neighbour slots: `2 * axis` is the lower neighbour, `2 * axis + 1` the upper
pub type Neighbors = [u32; 6];

/// A sparse set of cells at one level, and their corners
///
/// Solver levels use the cells within a Chebyshev distance of the occupied
/// cells; refinement levels use the children of refined cells. Vertices are
/// indexed by their position in the sorted key list, which makes the
/// numbering independent of how the band was assembled.
#[derive(Debug, Clone)]
pub struct Band {
    level: u32,
    cells: Vec<u64>,
    vertices: Vec<u64>,
    neighbors: Vec<Neighbors>,
}

/// Replace every key by its neighbours `lo..=hi` along `axis`, within `0..=limit`
fn dilate_axis(keys: &[u64], axis: usize, lo: i64, hi: i64, limit: u32) -> Vec<u64> {
    let mut out: Vec<u64> = keys
        .par_iter()
        .flat_map_iter(|&packed| {
            let key = unpack_key(packed);
            (lo..=hi).filter_map(move |offset| {
                let c = key[axis] as i64 + offset;
                (c >= 0 && c <= limit as i64).then(|| {
                    let mut shifted = key;
                    shifted[axis] = c as u32;
                    pack_key(shifted)
                })
            })
        })
        .collect();
    out.par_sort_unstable();
    out.dedup();
    out
}

fn dilate(keys: &[u64], lo: i64, hi: i64, limit: u32) -> Vec<u64> {
    let x = dilate_axis(keys, 0, lo, hi, limit);
    let y = dilate_axis(&x, 1, lo, hi, limit);
    dilate_axis(&y, 2, lo, hi, limit)
}

impl Band {
    /// Build the band around `occupied` cell keys at `level`
    ///
    /// Fails with `Error::Resource` once the band would need more than
    /// `max_vertices` lattice vertices.
    pub fn build(occupied: &[[u32; 3]], level: u32, radius: u32, max_vertices: usize) -> Result<Self> {
        let cell_limit = ((1u64 << level) - 1) as u32;
        let mut seeds: Vec<u64> = occupied.iter().map(|&k| pack_key(k)).collect();
        seeds.par_sort_unstable();
        seeds.dedup();

        let r = radius as i64;
        let cells = dilate(&seeds, -r, r, cell_limit);
        Self::from_cells(cells, level, max_vertices)
    }

    /// Band made of the eight children of each `parents` cell at `level - 1`
    pub fn children_of(parents: &[u64], level: u32, max_vertices: usize) -> Result<Self> {
        if level == 0 {
            return Err(Error::Reconstruction(
                "the root level has no parent cells".to_string(),
            ));
        }
        let cell_limit = ((1u64 << level) - 1) as u32;
        let doubled: Vec<u64> = parents
            .iter()
            .map(|&packed| {
                let key = unpack_key(packed);
                pack_key([key[0] * 2, key[1] * 2, key[2] * 2])
            })
            .collect();
        let cells = dilate(&doubled, 0, 1, cell_limit);
        Self::from_cells(cells, level, max_vertices)
    }

    /// Band over an explicit set of sorted, distinct cell keys
    fn from_cells(cells: Vec<u64>, level: u32, max_vertices: usize) -> Result<Self> {
        let cell_limit = ((1u64 << level) - 1) as u32;
        if cells.len() > max_vertices {
            return Err(Error::Resource(format!(
                "level {} band has {} cells, above the limit of {} lattice vertices",
                level,
                cells.len(),
                max_vertices
            )));
        }

        let vertices = dilate(&cells, 0, 1, cell_limit + 1);
        if vertices.len() > max_vertices {
            return Err(Error::Resource(format!(
                "level {} band needs {} lattice vertices, above the limit of {}",
                level,
                vertices.len(),
                max_vertices
            )));
        }

        let neighbors: Vec<Neighbors> = vertices
            .par_iter()
            .map(|&packed| {
                let key = unpack_key(packed);
                let mut slots = [NO_VERTEX; 6];
                for axis in 0..3 {
                    if key[axis] > 0 {
                        let mut lower = key;
                        lower[axis] -= 1;
                        slots[2 * axis] = find(&vertices, pack_key(lower));
                    }
                    let mut upper = key;
                    upper[axis] += 1;
                    slots[2 * axis + 1] = find(&vertices, pack_key(upper));
                }
                slots
            })
            .collect();

        Ok(Self {
            level,
            cells,
            vertices,
            neighbors,
        })
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Packed keys of the band cells, sorted
    pub fn cells(&self) -> &[u64] {
        &self.cells
    }

    #[inline]
    pub fn contains_cell(&self, cell: [u32; 3]) -> bool {
        self.cells.binary_search(&pack_key(cell)).is_ok()
    }

    /// Whether all eight cells around vertex `idx` belong to the band
    pub fn is_interior(&self, idx: usize) -> bool {
        let key = self.vertex_key(idx);
        if key.iter().any(|&c| c == 0) {
            return false;
        }
        CORNER_OFFSETS.iter().all(|offset| {
            self.contains_cell([
                key[0] + offset[0] - 1,
                key[1] + offset[1] - 1,
                key[2] + offset[2] - 1,
            ])
        })
    }

    /// Lattice coordinates of vertex `idx`
    #[inline]
    pub fn vertex_key(&self, idx: usize) -> [u32; 3] {
        unpack_key(self.vertices[idx])
    }

    #[inline]
    pub fn neighbors(&self, idx: usize) -> &Neighbors {
        &self.neighbors[idx]
    }

    /// Index of the vertex at `key`, if it belongs to the band
    #[inline]
    pub fn vertex_index(&self, key: [u32; 3]) -> Option<u32> {
        self.vertices
            .binary_search(&pack_key(key))
            .ok()
            .map(|i| i as u32)
    }

    /// Vertex indices of the eight corners of a cell, in marching cubes order
    pub fn cell_corners(&self, cell: [u32; 3]) -> Option<[u32; 8]> {
        let mut corners = [NO_VERTEX; 8];
        for (corner, offset) in corners.iter_mut().zip(CORNER_OFFSETS.iter()) {
            *corner = self.vertex_index([
                cell[0] + offset[0],
                cell[1] + offset[1],
                cell[2] + offset[2],
            ])?;
        }
        Some(corners)
    }
}

#[inline]
fn find(sorted: &[u64], key: u64) -> u32 {
    sorted
        .binary_search(&key)
        .map(|i| i as u32)
        .unwrap_or(NO_VERTEX)
}

/// Trilinear weights of a point inside a cell, in marching cubes corner order
///
/// `frac` holds the position inside the cell in `[0, 1]^3`.
#[inline]
pub fn trilinear_weights(frac: [f64; 3]) -> [f64; 8] {
    let mut weights = [0.0; 8];
    for (w, offset) in weights.iter_mut().zip(CORNER_OFFSETS.iter()) {
        *w = (0..3)
            .map(|a| if offset[a] == 1 { frac[a] } else { 1.0 - frac[a] })
            .product();
    }
    weights
}
