//! End-to-end tests of the conversion pipeline

use lidarmesh::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Near-flat terrain over a 100 x 100 footprint
fn flat_terrain(n: usize, seed: u64) -> Vec<Point3d> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            Point3d::new(
                rng.gen_range(0.0..100.0),
                rng.gen_range(0.0..100.0),
                rng.gen_range(-0.05..0.05),
            )
        })
        .collect()
}

#[test]
fn test_flat_terrain_gives_planar_quad_mesh() {
    let points = flat_terrain(10_000, 1);
    let output = convert(&points, &ConversionConfig::default()).unwrap();
    let mesh = &output.mesh;

    assert!(mesh.validate().is_ok());
    assert!(!mesh.is_empty());
    assert!(mesh.quad_count() > mesh.triangle_count());

    let area_normal = mesh
        .faces
        .iter()
        .fold(Vector3d::zeros(), |acc, f| acc + mesh.face_normal(f));
    assert!(area_normal.normalize().z > 0.95);

    // output coordinates are normalized coordinates times the output scale
    for v in mesh.vertices.iter().filter(|v| v.x.abs() < 3.5 && v.y.abs() < 3.5) {
        assert!(v.z.abs() < 0.3, "vertex {:?}", v);
    }

    let report = &output.report;
    assert_eq!(report.input_points, 10_000);
    assert_eq!(report.filtered_points, 10_000);
    assert_eq!(report.downsampled_points, 10_000);
    assert!(!report.solver_levels.is_empty());
    assert_eq!(report.triangles + report.quads, mesh.face_count());
    assert_eq!(report.final_vertices, mesh.vertex_count());
    assert_eq!(mesh.densities.as_ref().map(Vec::len), Some(mesh.vertex_count()));
}

#[test]
fn test_empty_input_is_an_input_error() {
    let err = convert(&[], &ConversionConfig::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
}

#[test]
fn test_out_of_range_depth_fails_before_processing() {
    let config = ConversionConfig::default().with_psr_depth(7);
    // an empty cloud would be an input error, so the config check ran first
    let err = convert(&[], &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(Converter::new(config).is_err());
}

#[test]
fn test_z_outliers_are_removed_before_normalization() {
    let mut points = flat_terrain(10_000, 2);
    for i in 0..5 {
        points.push(Point3d::new(10.0 * i as f64, 50.0, 1000.0));
    }

    let output = convert(&points, &ConversionConfig::default()).unwrap();
    assert_eq!(output.report.input_points, 10_005);
    assert_eq!(output.report.filtered_points, 10_000);

    // the scale comes from the horizontal footprint, not the outliers
    assert!(output.normalization.scale < 101.0);
    assert!(output.normalization.scale > 99.0);

    let (min_z, max_z) = output
        .mesh
        .vertices
        .iter()
        .fold((f64::MAX, f64::MIN), |(lo, hi), v| (lo.min(v.z), hi.max(v.z)));
    assert!(max_z - min_z < 5.0);
}

#[test]
fn test_conversion_is_deterministic() {
    let points = flat_terrain(5_000, 3);
    let config = ConversionConfig::default().with_psr_depth(10);
    let a = convert(&points, &config).unwrap();
    let b = convert(&points, &config).unwrap();
    assert_eq!(a.mesh, b.mesh);
    assert_eq!(a.report.solver_levels, b.report.solver_levels);
}

#[test]
fn test_triangle_output_without_quad_merge() {
    let points = flat_terrain(5_000, 4);
    let config = ConversionConfig::default().with_quad_merge(None);
    let output = convert(&points, &config).unwrap();
    assert_eq!(output.mesh.quad_count(), 0);
    assert_eq!(output.mesh.face_count(), output.report.reconstructed_faces);
}

#[test]
fn test_psr_depth_controls_resolution() {
    let points = flat_terrain(10_000, 8);
    let base = ConversionConfig::default().with_quad_merge(None);
    let shallow = convert(&points, &base.clone().with_psr_depth(8)).unwrap();
    let deep = convert(&points, &base.with_psr_depth(12)).unwrap();

    assert!(shallow.report.output_depth <= 8);
    assert!(deep.report.output_depth <= 12);
    assert!(deep.report.output_depth > shallow.report.output_depth);
    assert!(deep.mesh.vertex_count() > shallow.mesh.vertex_count());
    assert_eq!(
        deep.report.refinement_levels.len() as u32,
        deep.report.output_depth - deep.report.solve_depth
    );
}

#[test]
fn test_octree_budget_is_a_resource_error() {
    let config = ConversionConfig::default()
        .with_limits(ResourceLimits::default().with_max_octree_nodes(1_000));
    let err = convert(&flat_terrain(5_000, 9), &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resource);
}

#[test]
fn test_density_trim_removes_vertices() {
    let points = flat_terrain(5_000, 5);
    let base = ConversionConfig::default().with_quad_merge(None);
    let untrimmed = convert(&points, &base).unwrap();
    let trimmed = convert(&points, &base.with_density_trim(TrimThreshold::Quantile(0.5))).unwrap();

    assert!(trimmed.mesh.vertex_count() < untrimmed.mesh.vertex_count());
    assert!(trimmed.mesh.face_count() < untrimmed.mesh.face_count());
    assert!(trimmed.mesh.validate().is_ok());
}

#[test]
fn test_output_scale_is_applied() {
    let points = flat_terrain(5_000, 6);
    let unit = convert(&points, &ConversionConfig::default().with_output_scale(1.0)).unwrap();
    let scaled = convert(&points, &ConversionConfig::default().with_output_scale(20.0)).unwrap();

    assert_eq!(unit.mesh.faces, scaled.mesh.faces);
    for (a, b) in unit.mesh.vertices.iter().zip(scaled.mesh.vertices.iter()) {
        approx::assert_relative_eq!(a * 20.0, *b, epsilon = 1e-9);
    }
}

#[test]
fn test_cancelled_converter() {
    let converter = Converter::new(ConversionConfig::default()).unwrap();
    converter.cancellation_token().cancel();
    let err = converter.run(&flat_terrain(1_000, 7)).unwrap_err();
    assert_eq!(err, Error::Cancelled);
}

#[test]
fn test_config_from_partial_json() {
    let config: ConversionConfig =
        serde_json::from_str(r#"{ "psr_depth": 10, "output_scale": 2.5, "density_trim": { "Quantile": 0.1 } }"#).unwrap();
    assert_eq!(config.psr_depth, 10);
    assert_eq!(config.output_scale, 2.5);
    assert_eq!(config.density_trim, Some(TrimThreshold::Quantile(0.1)));
    assert_eq!(config.vertex_count_target, 1_000_000);
    assert!(config.validate().is_ok());
}
