//! Screened Poisson surface reconstruction
//!
//! The indicator function χ of the surface is solved for on a sparse band of
//! lattice vertices around the samples, one octree level at a time:
//!
//! 1. Normals are splatted trilinearly into a vector field `V` on the band.
//! 2. χ minimises `Σ_edges (χ_v - χ_u - h V_e·d)² + α Σ_samples χ(p)²`, which
//!    pulls its gradient toward `V` and its value at the samples toward zero.
//! 3. The system is solved with Jacobi-preconditioned conjugate gradients,
//!    starting from the interpolated solution of the previous level.
//!
//! These uniform levels stop at the solve depth, the deepest level the
//! sample density supports as a whole. Below it the lattice is refined
//! locally down to the configured depth: every cell that holds at least
//! `samples_per_node` samples spread over more than one octree leaf is split
//! into its eight children. On each refined level χ is the interpolated
//! coarser solution plus a correction that is zero on the boundary of the
//! refined region and pulls χ toward the iso value at the samples there.
//!
//! The surface is the level set of χ at the mean sample value. Every cell
//! that is not split further is polygonized with marching cubes on its own
//! level.

use crate::lattice::{trilinear_weights, Band, CORNER_OFFSETS, NO_VERTEX};
use crate::marching_cubes::{LatticeField, MarchingCubes, MarchingCubesConfig};
use crate::octree::{
    pack_key, Domain, OccupiedCell, Octree, COARSEST_SOLVE_DEPTH, MAX_OCTREE_DEPTH,
    MIN_OCTREE_DEPTH,
};
use crate::parallel;
use crate::solver::{conjugate_gradient, CgSettings, CgStats, LinearOperator};
use lidarmesh_core::{
    chunked_sum, CancellationToken, Error, NormalPoint3d, PointCloud, Result, TerrainMesh,
    Vector3d,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fewest samples a reconstruction is attempted with
pub const MIN_SAMPLES: usize = 4;

/// Allowed deviation of a normal's length from one
const NORMAL_LENGTH_TOLERANCE: f64 = 1e-3;

/// Relative residual above which a level counts as not converged
const DIVERGENCE_RESIDUAL: f64 = 1e-2;

/// Configuration parameters for Poisson reconstruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoissonConfig {
    /// Maximum octree depth, clamped to `8..=18` (default: 14)
    ///
    /// Well-sampled cells are refined down to this depth.
    pub depth: u32,
    /// Samples per occupied cell needed to solve a level uniformly, on
    /// average, or to refine a single cell below it (default: 1.5)
    pub samples_per_node: f64,
    /// Weight of the interpolation term relative to gradient matching (default: 4.0)
    pub screening: f64,
    /// Chebyshev radius of the lattice band around occupied cells (default: 2)
    pub band_radius: u32,
    /// Relative residual at which a level is solved (default: 1e-6)
    pub tolerance: f64,
    /// Conjugate gradient iterations per level (default: 1000)
    pub max_iterations: usize,
}

impl Default for PoissonConfig {
    fn default() -> Self {
        Self {
            depth: 14,
            samples_per_node: 1.5,
            screening: 4.0,
            band_radius: 2,
            tolerance: 1e-6,
            max_iterations: 1000,
        }
    }
}

impl PoissonConfig {
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_samples_per_node(mut self, samples_per_node: f64) -> Self {
        self.samples_per_node = samples_per_node;
        self
    }

    pub fn with_screening(mut self, screening: f64) -> Self {
        self.screening = screening;
        self
    }

    pub fn with_band_radius(mut self, band_radius: u32) -> Self {
        self.band_radius = band_radius;
        self
    }

    /// Octree depth actually used
    pub fn effective_depth(&self) -> u32 {
        self.depth.clamp(MIN_OCTREE_DEPTH, MAX_OCTREE_DEPTH)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.samples_per_node.is_finite() && self.samples_per_node > 0.0) {
            return Err(Error::Config(format!(
                "samples_per_node must be positive, got {}",
                self.samples_per_node
            )));
        }
        if !(self.screening.is_finite() && self.screening > 0.0) {
            return Err(Error::Config(format!(
                "screening weight must be positive, got {}",
                self.screening
            )));
        }
        if self.band_radius == 0 {
            return Err(Error::Config("band_radius must be at least 1".to_string()));
        }
        if !(self.tolerance > 0.0 && self.tolerance < DIVERGENCE_RESIDUAL) {
            return Err(Error::Config(format!(
                "solver tolerance must be in (0, {}), got {}",
                DIVERGENCE_RESIDUAL, self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(Error::Config("max_iterations must be positive".to_string()));
        }
        Ok(())
    }
}

/// Memory and time budget of a reconstruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Largest lattice (band vertices) allowed at any level
    pub max_lattice_vertices: usize,
    /// Largest octree arena, at 32 bytes per node
    pub max_octree_nodes: usize,
    /// Wall-clock budget for the whole reconstruction
    pub time_limit: Option<Duration>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_lattice_vertices: 25_000_000,
            max_octree_nodes: 64_000_000,
            time_limit: None,
        }
    }
}

impl ResourceLimits {
    pub fn with_max_lattice_vertices(mut self, max: usize) -> Self {
        self.max_lattice_vertices = max;
        self
    }

    pub fn with_max_octree_nodes(mut self, max: usize) -> Self {
        self.max_octree_nodes = max;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }
}

/// Solver outcome of one level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelStats {
    pub level: u32,
    pub vertices: usize,
    pub iterations: usize,
    pub relative_residual: f64,
}

/// Summary of a reconstruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoissonStats {
    pub octree_depth: u32,
    /// Deepest uniformly solved level
    pub solve_depth: u32,
    /// Deepest level that was polygonized
    pub output_depth: u32,
    pub iso_value: f64,
    /// Uniform levels, coarsest first
    pub levels: Vec<LevelStats>,
    /// Locally refined levels below the solve depth; `vertices` counts the
    /// corrected interior vertices
    pub refinement: Vec<LevelStats>,
}

/// Mesh with per-vertex densities plus solver statistics
#[derive(Debug, Clone)]
pub struct PoissonOutput {
    pub mesh: TerrainMesh,
    pub stats: PoissonStats,
}

struct Budget<'a> {
    start: Instant,
    limit: Option<Duration>,
    cancel: &'a CancellationToken,
}

impl Budget<'_> {
    fn check(&self) -> Result<()> {
        self.cancel.check()?;
        if let Some(limit) = self.limit {
            let elapsed = self.start.elapsed();
            if elapsed > limit {
                return Err(Error::Resource(format!(
                    "reconstruction exceeded its time limit of {:?} ({:?} elapsed)",
                    limit, elapsed
                )));
            }
        }
        Ok(())
    }
}

/// A sample's trilinear footprint on the lattice
#[derive(Debug, Clone, Copy)]
struct Splat {
    sample: u32,
    corners: [u32; 8],
    weights: [f64; 8],
}

/// Footprints of the samples on one band, with per-vertex incidence
struct SplatTable {
    splats: Vec<Splat>,
    /// CSR rows: splats touching each vertex, with the corner slot
    touch_ptr: Vec<usize>,
    touch: Vec<(u32, u8)>,
}

impl SplatTable {
    /// Splat the samples of `cells` onto `band`; cells outside it are skipped
    fn build(
        band: &Band,
        octree: &Octree,
        cloud: &PointCloud<NormalPoint3d>,
        cells: &[OccupiedCell],
    ) -> Self {
        let domain = octree.domain();
        let level = band.level();
        let permutation = octree.permutation();
        let per_cell: Vec<Vec<Splat>> = parallel::parallel_map(cells, |cell| {
            let Some(corners) = band.cell_corners(cell.key) else {
                return Vec::new();
            };
            // index order keeps the splats independent of deeper subdivisions
            let mut samples = permutation[cell.start as usize..cell.end as usize].to_vec();
            samples.sort_unstable();
            samples
                .into_iter()
                .map(|sample| {
                    let u = domain.to_lattice(&cloud.points[sample as usize].position, level);
                    let frac = [
                        (u.x - cell.key[0] as f64).clamp(0.0, 1.0),
                        (u.y - cell.key[1] as f64).clamp(0.0, 1.0),
                        (u.z - cell.key[2] as f64).clamp(0.0, 1.0),
                    ];
                    Splat {
                        sample,
                        corners,
                        weights: trilinear_weights(frac),
                    }
                })
                .collect()
        });
        let splats: Vec<Splat> = per_cell.into_iter().flatten().collect();

        // counting sort of (vertex, splat) incidences keeps rows in splat order
        let n = band.vertex_count();
        let mut touch_ptr = vec![0usize; n + 1];
        for splat in &splats {
            for &c in &splat.corners {
                touch_ptr[c as usize + 1] += 1;
            }
        }
        for v in 0..n {
            touch_ptr[v + 1] += touch_ptr[v];
        }
        let mut cursor = touch_ptr.clone();
        let mut touch = vec![(0u32, 0u8); touch_ptr[n]];
        for (s, splat) in splats.iter().enumerate() {
            for (slot, &c) in splat.corners.iter().enumerate() {
                touch[cursor[c as usize]] = (s as u32, slot as u8);
                cursor[c as usize] += 1;
            }
        }

        Self {
            splats,
            touch_ptr,
            touch,
        }
    }

    fn len(&self) -> usize {
        self.splats.len()
    }

    #[inline]
    fn row(&self, v: usize) -> &[(u32, u8)] {
        &self.touch[self.touch_ptr[v]..self.touch_ptr[v + 1]]
    }

    #[inline]
    fn weight(&self, s: u32, slot: u8) -> f64 {
        self.splats[s as usize].weights[slot as usize]
    }

    /// Total splat weight per vertex
    fn vertex_weights(&self) -> Vec<f64> {
        (0..self.touch_ptr.len() - 1)
            .into_par_iter()
            .map(|v| self.row(v).iter().map(|&(s, slot)| self.weight(s, slot)).sum())
            .collect()
    }

    /// Value of a lattice function at every splatted sample
    fn sample_values(&self, x: &[f64]) -> Vec<f64> {
        self.splats
            .par_iter()
            .map(|splat| {
                splat
                    .corners
                    .iter()
                    .zip(splat.weights.iter())
                    .map(|(&c, w)| w * x[c as usize])
                    .sum()
            })
            .collect()
    }
}

/// Screened Poisson system of one uniform level
struct LevelSystem<'a> {
    band: Band,
    splats: SplatTable,
    screening: f64,
    cloud: &'a PointCloud<NormalPoint3d>,
    cell_size: f64,
}

impl<'a> LevelSystem<'a> {
    fn build(
        octree: &Octree,
        cloud: &'a PointCloud<NormalPoint3d>,
        level: u32,
        config: &PoissonConfig,
        limits: &ResourceLimits,
    ) -> Result<Self> {
        let occupied = octree.occupied_cells(level);
        let keys: Vec<[u32; 3]> = occupied.iter().map(|c| c.key).collect();
        let band = Band::build(&keys, level, config.band_radius, limits.max_lattice_vertices)?;

        let splats = SplatTable::build(&band, octree, cloud, &occupied);
        if splats.len() != cloud.len() {
            return Err(Error::Reconstruction(format!(
                "level {} lattice misses {} samples",
                level,
                cloud.len() - splats.len()
            )));
        }

        let screening = config.screening * band.vertex_count() as f64 / splats.len() as f64;

        Ok(Self {
            band,
            splats,
            screening,
            cloud,
            cell_size: octree.domain().cell_size(level),
        })
    }

    /// Splatted normal field and total splat weight per vertex
    fn splat_normals(&self) -> (Vec<Vector3d>, Vec<f64>) {
        (0..self.band.vertex_count())
            .into_par_iter()
            .map(|v| {
                let mut acc = Vector3d::zeros();
                let mut weight = 0.0;
                for &(s, slot) in self.splats.row(v) {
                    let w = self.splats.weight(s, slot);
                    let sample = self.splats.splats[s as usize].sample;
                    acc += self.cloud.points[sample as usize].normal * w;
                    weight += w;
                }
                (acc / weight.max(1.0), weight)
            })
            .unzip()
    }

    /// Divergence of the splatted field, the right hand side of the system
    fn divergence(&self, field: &[Vector3d]) -> Vec<f64> {
        let h = self.cell_size;
        (0..self.band.vertex_count())
            .into_par_iter()
            .map(|v| {
                let neighbors = self.band.neighbors(v);
                let mut b = 0.0;
                for axis in 0..3 {
                    let lower = neighbors[2 * axis];
                    if lower != NO_VERTEX {
                        b += 0.5 * h * (field[lower as usize][axis] + field[v][axis]);
                    }
                    let upper = neighbors[2 * axis + 1];
                    if upper != NO_VERTEX {
                        b -= 0.5 * h * (field[v][axis] + field[upper as usize][axis]);
                    }
                }
                b
            })
            .collect()
    }
}

impl LinearOperator for LevelSystem<'_> {
    fn dim(&self) -> usize {
        self.band.vertex_count()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let at_samples = self.splats.sample_values(x);
        y.par_iter_mut().enumerate().for_each(|(v, out)| {
            let mut value = 0.0;
            for &u in self.band.neighbors(v) {
                if u != NO_VERTEX {
                    value += x[v] - x[u as usize];
                }
            }
            let mut screened = 0.0;
            for &(s, slot) in self.splats.row(v) {
                screened += self.splats.weight(s, slot) * at_samples[s as usize];
            }
            *out = value + self.screening * screened;
        });
    }

    fn diagonal(&self) -> Vec<f64> {
        (0..self.band.vertex_count())
            .into_par_iter()
            .map(|v| {
                let degree = self
                    .band
                    .neighbors(v)
                    .iter()
                    .filter(|&&u| u != NO_VERTEX)
                    .count() as f64;
                let screened: f64 = self
                    .splats
                    .row(v)
                    .iter()
                    .map(|&(s, slot)| self.splats.weight(s, slot).powi(2))
                    .sum();
                degree + self.screening * screened
            })
            .collect()
    }
}

/// Correction of an interpolated solution on a locally refined level
///
/// Unknowns are the interior vertices of the refined region; the boundary
/// keeps the interpolated values, so χ stays continuous where refined and
/// unrefined cells meet.
struct RefinementSystem<'a> {
    band: &'a Band,
    splats: &'a SplatTable,
    /// Band vertex of every unknown
    interior: Vec<u32>,
    screening: f64,
}

impl RefinementSystem<'_> {
    /// Scatter interior values onto the whole band, zero on the boundary
    fn expand(&self, x: &[f64]) -> Vec<f64> {
        let mut full = vec![0.0; self.band.vertex_count()];
        for (&v, &value) in self.interior.iter().zip(x.iter()) {
            full[v as usize] = value;
        }
        full
    }

    /// Screening pull of the interpolated solution toward `iso` at the samples
    fn rhs(&self, at_samples: &[f64], iso: f64) -> Vec<f64> {
        self.interior
            .par_iter()
            .map(|&v| {
                let pull: f64 = self
                    .splats
                    .row(v as usize)
                    .iter()
                    .map(|&(s, slot)| self.splats.weight(s, slot) * (iso - at_samples[s as usize]))
                    .sum();
                self.screening * pull
            })
            .collect()
    }
}

impl LinearOperator for RefinementSystem<'_> {
    fn dim(&self) -> usize {
        self.interior.len()
    }

    fn apply(&self, x: &[f64], y: &mut [f64]) {
        let full = self.expand(x);
        let at_samples = self.splats.sample_values(&full);
        y.par_iter_mut()
            .zip(self.interior.par_iter())
            .for_each(|(out, &v)| {
                let v = v as usize;
                // interior vertices have all six neighbours
                let value: f64 = self
                    .band
                    .neighbors(v)
                    .iter()
                    .filter(|&&u| u != NO_VERTEX)
                    .map(|&u| full[v] - full[u as usize])
                    .sum();
                let screened: f64 = self
                    .splats
                    .row(v)
                    .iter()
                    .map(|&(s, slot)| self.splats.weight(s, slot) * at_samples[s as usize])
                    .sum();
                *out = value + self.screening * screened;
            });
    }

    fn diagonal(&self) -> Vec<f64> {
        self.interior
            .par_iter()
            .map(|&v| {
                let screened: f64 = self
                    .splats
                    .row(v as usize)
                    .iter()
                    .map(|&(s, slot)| self.splats.weight(s, slot).powi(2))
                    .sum();
                6.0 + self.screening * screened
            })
            .collect()
    }
}

/// Interpolate the previous level's solution onto a finer band
///
/// Between uniform levels values are halved, because the indicator's jump
/// across the surface scales with the cell size there; refined levels keep
/// the scale of the level they refine.
fn prolongate(coarse: &Band, coarse_values: &[f64], fine: &Band, scale: f64) -> Vec<f64> {
    (0..fine.vertex_count())
        .into_par_iter()
        .map(|v| {
            let key = fine.vertex_key(v);
            let base = [key[0] >> 1, key[1] >> 1, key[2] >> 1];
            let frac = [
                (key[0] & 1) as f64 * 0.5,
                (key[1] & 1) as f64 * 0.5,
                (key[2] & 1) as f64 * 0.5,
            ];
            let weights = trilinear_weights(frac);

            let mut sum = 0.0;
            let mut total = 0.0;
            for (corner, w) in CORNER_OFFSETS.iter().zip(weights.iter()) {
                if *w == 0.0 {
                    continue;
                }
                if let Some(c) = coarse.vertex_index([
                    base[0] + corner[0],
                    base[1] + corner[1],
                    base[2] + corner[2],
                ]) {
                    sum += w * coarse_values[c as usize];
                    total += w;
                }
            }
            if total > 0.0 {
                scale * sum / total
            } else {
                0.0
            }
        })
        .collect()
}

fn check_convergence(level: u32, stats: &CgStats, tolerance: f64) -> Result<()> {
    if stats.relative_residual > DIVERGENCE_RESIDUAL {
        return Err(Error::Reconstruction(format!(
            "Poisson solve did not converge at level {} (relative residual {:.3e} after {} iterations)",
            level, stats.relative_residual, stats.iterations
        )));
    }
    if !stats.converged {
        warn!(
            level,
            residual = stats.relative_residual,
            tolerance,
            "Poisson solve stopped above tolerance"
        );
    }
    Ok(())
}

/// χ and support on the cells of one level
struct Patch {
    band: Band,
    values: Vec<f64>,
    support: Vec<f64>,
}

/// Cells of `patch` to split at the next level, sorted by packed key
fn refined_cells(octree: &Octree, patch: &Patch, samples_per_node: f64) -> Vec<u64> {
    let level = patch.band.level();
    if level >= octree.max_depth() {
        return Vec::new();
    }
    octree
        .occupied_cells(level)
        .into_iter()
        .filter(|cell| {
            cell.subdivided
                && cell.len() as f64 >= samples_per_node
                && patch.band.contains_cell(cell.key)
        })
        .map(|cell| pack_key(cell.key))
        .collect()
}

struct RefineContext<'a> {
    octree: &'a Octree,
    cloud: &'a PointCloud<NormalPoint3d>,
    config: &'a PoissonConfig,
    limits: &'a ResourceLimits,
    settings: &'a CgSettings,
    budget: &'a Budget<'a>,
    iso_value: f64,
    solve_depth: u32,
}

/// Solve the children of `parents` one level below `coarse`
fn refine_level(ctx: &RefineContext<'_>, coarse: &Patch, parents: &[u64]) -> Result<(Patch, LevelStats)> {
    let level = coarse.band.level() + 1;
    let band = Band::children_of(parents, level, ctx.limits.max_lattice_vertices)?;

    let occupied: Vec<OccupiedCell> = ctx
        .octree
        .occupied_cells(level)
        .into_iter()
        .filter(|cell| band.contains_cell(cell.key))
        .collect();
    let splats = SplatTable::build(&band, ctx.octree, ctx.cloud, &occupied);

    let mut values = prolongate(&coarse.band, &coarse.values, &band, 1.0);
    let interior: Vec<u32> = (0..band.vertex_count())
        .filter(|&v| band.is_interior(v))
        .map(|v| v as u32)
        .collect();
    let system = RefinementSystem {
        band: &band,
        splats: &splats,
        interior,
        screening: ctx.config.screening * band.vertex_count() as f64 / splats.len().max(1) as f64,
    };

    let rhs = system.rhs(&splats.sample_values(&values), ctx.iso_value);
    let mut correction = vec![0.0; system.dim()];
    let stats = conjugate_gradient(&system, &rhs, &mut correction, ctx.settings, || {
        ctx.budget.check()
    })?;
    check_convergence(level, &stats, ctx.config.tolerance)?;
    debug!(
        level,
        parents = parents.len(),
        vertices = band.vertex_count(),
        unknowns = system.dim(),
        iterations = stats.iterations,
        residual = stats.relative_residual,
        "refined level"
    );

    for (&v, delta) in system.interior.iter().zip(correction.iter()) {
        values[v as usize] += delta;
    }
    let unknowns = system.dim();

    // support per area of a solve-depth cell
    let area_scale = 4f64.powi((level - ctx.solve_depth) as i32);
    let support = splats
        .vertex_weights()
        .into_iter()
        .map(|w| w * area_scale)
        .collect();

    Ok((
        Patch {
            band,
            values,
            support,
        },
        LevelStats {
            level,
            vertices: unknowns,
            iterations: stats.iterations,
            relative_residual: stats.relative_residual,
        },
    ))
}

fn validate_samples(cloud: &PointCloud<NormalPoint3d>) -> Result<()> {
    if cloud.len() < MIN_SAMPLES {
        return Err(Error::Reconstruction(format!(
            "Poisson reconstruction needs at least {} samples, got {}",
            MIN_SAMPLES,
            cloud.len()
        )));
    }

    let bad = cloud.points.par_iter().position_first(|p| {
        let length = p.normal.norm();
        !p.position.coords.iter().all(|c| c.is_finite())
            || !length.is_finite()
            || (length - 1.0).abs() > NORMAL_LENGTH_TOLERANCE
    });
    if let Some(i) = bad {
        return Err(Error::Reconstruction(format!(
            "sample {} has a non-finite position or a normal of length {}",
            i,
            cloud.points[i].normal.norm()
        )));
    }
    Ok(())
}

/// Reconstruct a surface from oriented samples
///
/// # Arguments
/// * `cloud` - Samples with unit normals, normally the normalized cloud
/// * `config` - Depth and solver settings
/// * `limits` - Lattice size and time budget
/// * `cancel` - Polled between levels and during each solve
///
/// # Returns
/// * `Result<PoissonOutput>` - Triangle mesh with per-vertex densities and solver statistics
///
/// # Example
/// ```rust
/// use lidarmesh_core::{CancellationToken, NormalPoint3d, Point3d, PointCloud, Vector3d};
/// use lidarmesh_reconstruction::{poisson_reconstruction, PoissonConfig, ResourceLimits};
///
/// fn main() -> lidarmesh_core::Result<()> {
///     let cloud: PointCloud<NormalPoint3d> = (0..400)
///         .map(|i| {
///             let x = (i % 20) as f64 / 20.0 - 0.5;
///             let y = (i / 20) as f64 / 20.0 - 0.5;
///             NormalPoint3d::new(Point3d::new(x, y, 0.0), Vector3d::z())
///         })
///         .collect();
///
///     let output = poisson_reconstruction(
///         &cloud,
///         &PoissonConfig::default().with_depth(8),
///         &ResourceLimits::default(),
///         &CancellationToken::new(),
///     )?;
///     assert!(output.mesh.vertex_count() > 0);
///     Ok(())
/// }
/// ```
pub fn poisson_reconstruction(
    cloud: &PointCloud<NormalPoint3d>,
    config: &PoissonConfig,
    limits: &ResourceLimits,
    cancel: &CancellationToken,
) -> Result<PoissonOutput> {
    config.validate()?;
    validate_samples(cloud)?;

    let budget = Budget {
        start: Instant::now(),
        limit: limits.time_limit,
        cancel,
    };

    let positions = cloud.positions();
    let domain = Domain::around(&positions)?;
    let octree_depth = config.effective_depth();
    let octree = Octree::build(&positions, domain, octree_depth, limits.max_octree_nodes)?;
    let solve_depth = octree.solve_depth(config.samples_per_node);
    debug!(
        octree_depth,
        solve_depth,
        nodes = octree.nodes().len(),
        "built octree"
    );

    let settings = CgSettings {
        tolerance: config.tolerance,
        max_iterations: config.max_iterations,
        ..CgSettings::default()
    };

    let mut levels = Vec::new();
    let mut previous: Option<(Band, Vec<f64>)> = None;
    let mut finest = None;

    for level in COARSEST_SOLVE_DEPTH.min(solve_depth)..=solve_depth {
        budget.check()?;

        let system = LevelSystem::build(&octree, cloud, level, config, limits)?;
        let (field, support) = system.splat_normals();
        let rhs = system.divergence(&field);

        let mut chi = match &previous {
            Some((band, values)) => prolongate(band, values, &system.band, 0.5),
            None => vec![0.0; system.dim()],
        };
        let stats = conjugate_gradient(&system, &rhs, &mut chi, &settings, || budget.check())?;

        debug!(
            level,
            vertices = system.dim(),
            iterations = stats.iterations,
            residual = stats.relative_residual,
            "solved level"
        );
        check_convergence(level, &stats, config.tolerance)?;

        levels.push(LevelStats {
            level,
            vertices: system.dim(),
            iterations: stats.iterations,
            relative_residual: stats.relative_residual,
        });

        if level == solve_depth {
            let at_samples = system.splats.sample_values(&chi);
            let iso_value = chunked_sum(at_samples.len(), |i| at_samples[i]) / at_samples.len() as f64;
            finest = Some((
                Patch {
                    band: system.band,
                    values: chi,
                    support,
                },
                iso_value,
            ));
        } else {
            previous = Some((system.band, chi));
        }
    }

    let (mut patch, iso_value) = finest.ok_or_else(|| {
        Error::Reconstruction("no solver level was processed".to_string())
    })?;

    let ctx = RefineContext {
        octree: &octree,
        cloud,
        config,
        limits,
        settings: &settings,
        budget: &budget,
        iso_value,
        solve_depth,
    };
    let marching = MarchingCubes::new(MarchingCubesConfig { iso_level: iso_value });
    let mut mesh = TerrainMesh::new();
    let mut refinement = Vec::new();

    loop {
        budget.check()?;
        let parents = refined_cells(&octree, &patch, config.samples_per_node);
        let leaves: Vec<u64> = patch
            .band
            .cells()
            .iter()
            .filter(|cell| parents.binary_search(cell).is_err())
            .copied()
            .collect();
        mesh.append(marching.polygonize(
            &LatticeField {
                band: &patch.band,
                domain: &domain,
                values: &patch.values,
                support: &patch.support,
            },
            &leaves,
        )?);

        if parents.is_empty() {
            break;
        }
        let (next, stats) = refine_level(&ctx, &patch, &parents)?;
        refinement.push(stats);
        patch = next;
    }
    let output_depth = patch.band.level();

    if mesh.is_empty() {
        return Err(Error::Reconstruction(
            "no isosurface found at the requested level".to_string(),
        ));
    }

    info!(
        samples = cloud.len(),
        solve_depth,
        output_depth,
        vertices = mesh.vertex_count(),
        faces = mesh.face_count(),
        "Poisson reconstruction finished"
    );

    Ok(PoissonOutput {
        mesh,
        stats: PoissonStats {
            octree_depth,
            solve_depth,
            output_depth,
            iso_value,
            levels,
            refinement,
        },
    })
}

/// Poisson surface reconstruction with default configuration and limits
pub fn poisson_reconstruction_default(cloud: &PointCloud<NormalPoint3d>) -> Result<PoissonOutput> {
    poisson_reconstruction(
        cloud,
        &PoissonConfig::default(),
        &ResourceLimits::default(),
        &CancellationToken::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use lidarmesh_core::Point3d;

    fn flat_patch(n: usize) -> PointCloud<NormalPoint3d> {
        (0..n * n)
            .map(|i| {
                let x = (i % n) as f64 / n as f64 - 0.5;
                let y = (i / n) as f64 / n as f64 - 0.5;
                let z = 0.01 * ((i * 7919) % 13) as f64 / 13.0;
                NormalPoint3d::new(Point3d::new(x, y, z), Vector3d::z())
            })
            .collect()
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = PoissonConfig::default();
        assert_eq!(config.depth, 14);
        assert_eq!(config.samples_per_node, 1.5);
        assert!(config.validate().is_ok());

        assert_eq!(PoissonConfig::default().with_depth(4).effective_depth(), 8);
        assert_eq!(PoissonConfig::default().with_depth(30).effective_depth(), 18);
        assert!(PoissonConfig::default().with_screening(0.0).validate().is_err());
        assert!(PoissonConfig::default().with_band_radius(0).validate().is_err());
    }

    #[test]
    fn test_too_few_samples() {
        let cloud = flat_patch(1);
        let result = poisson_reconstruction_default(&cloud);
        assert!(matches!(result, Err(Error::Reconstruction(_))));
    }

    #[test]
    fn test_non_unit_normals_rejected() {
        let mut cloud = flat_patch(10);
        cloud.points[3].normal = Vector3d::new(0.0, 0.0, 2.0);
        let result = poisson_reconstruction_default(&cloud);
        assert!(matches!(result, Err(Error::Reconstruction(_))));
    }

    #[test]
    fn test_flat_patch_reconstruction() {
        let cloud = flat_patch(30);
        let output = poisson_reconstruction(
            &cloud,
            &PoissonConfig::default().with_depth(8),
            &ResourceLimits::default(),
            &CancellationToken::new(),
        )
        .unwrap();

        let mesh = &output.mesh;
        assert!(mesh.vertex_count() > 0);
        assert!(mesh.face_count() > 0);
        assert!(mesh.validate().is_ok());
        assert_eq!(mesh.densities.as_ref().map(Vec::len), Some(mesh.vertex_count()));
        assert_eq!(output.stats.octree_depth, 8);
        assert_eq!(
            output.stats.levels.len() as u32,
            output.stats.solve_depth - COARSEST_SOLVE_DEPTH + 1
        );

        // the part of the surface above the samples is flat and faces up
        let supported: Vec<usize> = (0..mesh.vertex_count())
            .filter(|&v| {
                let p = mesh.vertices[v];
                p.x.abs() < 0.4 && p.y.abs() < 0.4
            })
            .collect();
        assert!(!supported.is_empty());
        for &v in &supported {
            assert!(mesh.vertices[v].z.abs() < 0.1, "vertex {:?}", mesh.vertices[v]);
        }
        let up = mesh
            .faces
            .iter()
            .filter(|f| {
                let n = mesh.face_normal(f);
                n.z > 0.0 && n.z > n.xy().norm()
            })
            .count();
        assert!(up * 2 > mesh.face_count());
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = poisson_reconstruction(
            &flat_patch(10),
            &PoissonConfig::default(),
            &ResourceLimits::default(),
            &cancel,
        );
        assert_eq!(result.err(), Some(Error::Cancelled));
    }

    #[test]
    fn test_lattice_limit_is_a_resource_error() {
        let result = poisson_reconstruction(
            &flat_patch(20),
            &PoissonConfig::default(),
            &ResourceLimits::default().with_max_lattice_vertices(50),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::Resource(_))));
    }

    #[test]
    fn test_duplicated_samples_stay_within_node_budget() {
        let cloud = flat_patch(30);
        let doubled: PointCloud<NormalPoint3d> =
            cloud.points.iter().flat_map(|p| [*p, *p]).collect();
        let config = PoissonConfig::default().with_depth(18);
        let limits = ResourceLimits::default().with_max_octree_nodes(40_000);
        let cancel = CancellationToken::new();

        let single = poisson_reconstruction(&cloud, &config, &limits, &cancel).unwrap();
        let paired = poisson_reconstruction(&doubled, &config, &limits, &cancel).unwrap();
        assert_eq!(paired.stats.solve_depth, single.stats.solve_depth);
        assert!(paired.stats.output_depth <= 18);
        assert!(paired.mesh.validate().is_ok());

        let starved = ResourceLimits::default().with_max_octree_nodes(16);
        let result = poisson_reconstruction(&doubled, &config, &starved, &cancel);
        assert!(matches!(result, Err(Error::Resource(_))));
    }

    #[test]
    fn test_time_limit_is_a_resource_error() {
        let result = poisson_reconstruction(
            &flat_patch(20),
            &PoissonConfig::default(),
            &ResourceLimits::default().with_time_limit(Duration::ZERO),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(Error::Resource(_))));
    }

    #[test]
    fn test_prolongation_preserves_linear_functions() {
        let coarse = Band::build(&[[3, 3, 3]], 3, 1, usize::MAX).unwrap();
        let fine = Band::build(&[[6, 6, 6], [7, 7, 7]], 4, 1, usize::MAX).unwrap();
        let coarse_values: Vec<f64> = (0..coarse.vertex_count())
            .map(|v| coarse.vertex_key(v)[2] as f64)
            .collect();
        let fine_values = prolongate(&coarse, &coarse_values, &fine, 0.5);
        let refined_values = prolongate(&coarse, &coarse_values, &fine, 1.0);
        for v in 0..fine.vertex_count() {
            let z = fine.vertex_key(v)[2] as f64;
            // coarse z = fine z / 2, halved again by the level scaling
            assert!((fine_values[v] - 0.25 * z).abs() < 1e-12);
            assert!((refined_values[v] - 0.5 * z).abs() < 1e-12);
        }
    }
}
