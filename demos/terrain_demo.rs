//! terrain_demo: convert a synthetic LiDAR scan into a terrain mesh
//!
//! Generates a rolling terrain patch with sensor noise and a handful of
//! spurious returns, runs the full conversion and prints a summary.
//!
//! # Logging
//!
//! `RUST_LOG` takes precedence over the `-v` flags:
//! - `RUST_LOG=lidarmesh=info` - One line per pipeline stage
//! - `RUST_LOG=lidarmesh_reconstruction=debug` - Solver levels
//!
//! # Example
//!
//! ```bash
//! terrain_demo --points 500000 --psr-depth 10 -v
//! terrain_demo --config conversion.json --json
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use lidarmesh::prelude::*;
use lidarmesh::reconstruction::ThreadPoolConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Convert a synthetic terrain scan into a mesh
#[derive(Parser)]
#[command(name = "terrain_demo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Number of ground points to generate
    #[arg(long, default_value_t = 200_000)]
    points: usize,

    /// Side length of the scanned area
    #[arg(long, default_value_t = 500.0)]
    extent: f64,

    /// Seed of the point generator
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// JSON conversion config; missing fields take their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum octree depth (8-18)
    #[arg(long)]
    psr_depth: Option<u32>,

    /// Point budget for downsampling
    #[arg(long)]
    vertex_count_target: Option<usize>,

    /// Uniform scale of the output mesh
    #[arg(long)]
    output_scale: Option<f64>,

    /// Trim vertices below this density quantile
    #[arg(long)]
    trim_quantile: Option<f64>,

    /// Keep the triangle mesh instead of merging quads
    #[arg(long)]
    no_quads: bool,

    /// Worker threads (defaults to one per CPU)
    #[arg(long)]
    threads: Option<usize>,

    /// Print the conversion report as JSON
    #[arg(long)]
    json: bool,

    /// Increase output verbosity (-v for info, -vv for debug)
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        };
        EnvFilter::new(level)
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<ConversionConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("invalid conversion config in {}", path.display()))?
        }
        None => ConversionConfig::default(),
    };

    if let Some(depth) = cli.psr_depth {
        config = config.with_psr_depth(depth);
    }
    if let Some(target) = cli.vertex_count_target {
        config = config.with_vertex_count_target(target);
    }
    if let Some(scale) = cli.output_scale {
        config = config.with_output_scale(scale);
    }
    if let Some(q) = cli.trim_quantile {
        config = config.with_density_trim(TrimThreshold::Quantile(q));
    }
    if cli.no_quads {
        config = config.with_quad_merge(None);
    }
    if let Some(threads) = cli.threads {
        config = config.with_thread_pool(ThreadPoolConfig::default().with_threads(threads));
    }
    Ok(config)
}

/// Rolling hills with a ridge, sensor noise and a few birds and pits
fn synthesize_scan(n: usize, extent: f64, seed: u64) -> Vec<Point3d> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut points: Vec<Point3d> = (0..n)
        .map(|_| {
            let x: f64 = rng.gen_range(0.0..extent);
            let y: f64 = rng.gen_range(0.0..extent);
            let u = x / extent;
            let v = y / extent;
            let hills = 12.0 * (u * 6.0).sin() * (v * 4.0).cos();
            let ridge = 25.0 * (-((u - 0.6) * 8.0).powi(2)).exp();
            Point3d::new(x, y, 100.0 + hills + ridge + rng.gen_range(-0.2..0.2))
        })
        .collect();

    for _ in 0..(n / 10_000).max(3) {
        let x = rng.gen_range(0.0..extent);
        let y = rng.gen_range(0.0..extent);
        let z = if rng.gen_bool(0.5) { 2_000.0 } else { -1_500.0 };
        points.push(Point3d::new(x, y, z));
    }
    points
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    let points = synthesize_scan(cli.points, cli.extent, cli.seed);
    info!(points = points.len(), "synthesized scan");

    let converter = Converter::new(config).context("invalid conversion config")?;
    let output = converter.run(&points).context("conversion failed")?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&output.report)?);
        return Ok(());
    }

    let report = &output.report;
    println!("LiDAR terrain conversion");
    println!("  input points:      {}", report.input_points);
    println!("  after filtering:   {}", report.filtered_points);
    println!("  after downsample:  {}", report.downsampled_points);
    println!(
        "  octree depth:      {} (solved at {})",
        report.octree_depth, report.solve_depth
    );
    for level in &report.solver_levels {
        println!(
            "    level {:>2}: {:>9} unknowns, {:>4} iterations, residual {:.2e}",
            level.level, level.vertices, level.iterations, level.relative_residual
        );
    }
    println!("  refined to depth:  {}", report.output_depth);
    for level in &report.refinement_levels {
        println!(
            "    level {:>2}: {:>9} corrections, {:>4} iterations, residual {:.2e}",
            level.level, level.vertices, level.iterations, level.relative_residual
        );
    }
    println!(
        "  reconstructed:     {} vertices, {} triangles",
        report.reconstructed_vertices, report.reconstructed_faces
    );
    println!(
        "  final mesh:        {} vertices, {} quads, {} triangles",
        report.final_vertices, report.quads, report.triangles
    );
    println!(
        "  normalization:     center {:?}, scale {:.3}",
        output.normalization.center, output.normalization.scale
    );
    println!("  elapsed:           {:?}", report.elapsed);
    Ok(())
}
