//! Conversion configuration

use lidarmesh_algorithms::{DownsampleConfig, NormalEstimationConfig, NormalOrientation, DEFAULT_Z_STD_MULTIPLIER};
use lidarmesh_core::{Error, Result};
use lidarmesh_postprocess::{QuadMergeConfig, TrimThreshold};
use lidarmesh_reconstruction::parallel::ThreadPoolConfig;
use lidarmesh_reconstruction::{PoissonConfig, ResourceLimits};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// Accepted octree depths
pub const PSR_DEPTH_RANGE: RangeInclusive<u32> = 8..=18;
/// Accepted point budgets for downsampling
pub const VERTEX_COUNT_TARGET_RANGE: RangeInclusive<usize> = 100_000..=5_000_000;
/// Accepted output scale factors
pub const OUTPUT_SCALE_RANGE: RangeInclusive<f64> = 0.1..=100.0;

/// Every setting of a conversion
///
/// The first five fields are the user-facing options; the nested sections
/// expose the tuning of individual stages and default to the values the
/// pipeline was designed around. Deserializing fills missing fields from
/// [`Default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    /// Maximum octree depth of the surface solve
    pub psr_depth: u32,
    /// Point budget above which the cloud is downsampled
    pub vertex_count_target: usize,
    /// Uniform scale applied to the finished mesh
    pub output_scale: f64,
    /// Neighbour search radius for normals, in normalized units
    pub normal_search_radius: f64,
    /// Neighbour count for normals
    pub normal_max_neighbors: usize,

    /// Points further than this many standard deviations from the mean height are dropped
    pub z_std_multiplier: f64,
    pub normal_orientation: NormalOrientation,
    pub downsample: DownsampleConfig,
    /// Solver settings; `depth` is taken from `psr_depth`
    pub poisson: PoissonConfig,
    pub limits: ResourceLimits,
    /// Remove weakly supported parts of the surface
    pub density_trim: Option<TrimThreshold>,
    /// Merge triangle pairs into quads; `None` keeps the triangle mesh
    pub quad_merge: Option<QuadMergeConfig>,
    pub thread_pool: ThreadPoolConfig,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            psr_depth: 14,
            vertex_count_target: 1_000_000,
            output_scale: 10.0,
            normal_search_radius: 5.0,
            normal_max_neighbors: 50,
            z_std_multiplier: DEFAULT_Z_STD_MULTIPLIER,
            normal_orientation: NormalOrientation::Upward,
            downsample: DownsampleConfig::default(),
            poisson: PoissonConfig::default(),
            limits: ResourceLimits::default(),
            density_trim: None,
            quad_merge: Some(QuadMergeConfig::default()),
            thread_pool: ThreadPoolConfig::default(),
        }
    }
}

impl ConversionConfig {
    pub fn with_psr_depth(mut self, depth: u32) -> Self {
        self.psr_depth = depth;
        self
    }

    pub fn with_vertex_count_target(mut self, target: usize) -> Self {
        self.vertex_count_target = target;
        self
    }

    pub fn with_output_scale(mut self, scale: f64) -> Self {
        self.output_scale = scale;
        self
    }

    pub fn with_normal_search(mut self, radius: f64, max_neighbors: usize) -> Self {
        self.normal_search_radius = radius;
        self.normal_max_neighbors = max_neighbors;
        self
    }

    pub fn with_density_trim(mut self, threshold: TrimThreshold) -> Self {
        self.density_trim = Some(threshold);
        self
    }

    pub fn with_quad_merge(mut self, config: Option<QuadMergeConfig>) -> Self {
        self.quad_merge = config;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_thread_pool(mut self, thread_pool: ThreadPoolConfig) -> Self {
        self.thread_pool = thread_pool;
        self
    }

    /// Normal estimation settings derived from this configuration
    pub fn normal_config(&self) -> NormalEstimationConfig {
        NormalEstimationConfig::default()
            .with_radius(self.normal_search_radius)
            .with_max_neighbors(self.normal_max_neighbors)
            .with_orientation(self.normal_orientation)
    }

    /// Solver settings derived from this configuration
    pub fn poisson_config(&self) -> PoissonConfig {
        self.poisson.clone().with_depth(self.psr_depth)
    }

    /// Check every option against its accepted range
    pub fn validate(&self) -> Result<()> {
        if !PSR_DEPTH_RANGE.contains(&self.psr_depth) {
            return Err(Error::Config(format!(
                "psr_depth must be in [{}, {}], got {}",
                PSR_DEPTH_RANGE.start(),
                PSR_DEPTH_RANGE.end(),
                self.psr_depth
            )));
        }
        if !VERTEX_COUNT_TARGET_RANGE.contains(&self.vertex_count_target) {
            return Err(Error::Config(format!(
                "vertex_count_target must be in [{}, {}], got {}",
                VERTEX_COUNT_TARGET_RANGE.start(),
                VERTEX_COUNT_TARGET_RANGE.end(),
                self.vertex_count_target
            )));
        }
        if !OUTPUT_SCALE_RANGE.contains(&self.output_scale) {
            return Err(Error::Config(format!(
                "output_scale must be in [{}, {}], got {}",
                OUTPUT_SCALE_RANGE.start(),
                OUTPUT_SCALE_RANGE.end(),
                self.output_scale
            )));
        }
        if !(self.z_std_multiplier.is_finite() && self.z_std_multiplier > 0.0) {
            return Err(Error::Config(format!(
                "z_std_multiplier must be positive, got {}",
                self.z_std_multiplier
            )));
        }
        if self.limits.max_lattice_vertices == 0 {
            return Err(Error::Config(
                "max_lattice_vertices must be positive".to_string(),
            ));
        }

        self.normal_config().validate()?;
        self.downsample.validate()?;
        self.poisson_config().validate()?;
        if let Some(threshold) = &self.density_trim {
            threshold.validate()?;
        }
        if let Some(quad_merge) = &self.quad_merge {
            quad_merge.validate()?;
        }
        self.thread_pool.validate()
    }
}
