//! Multiscale zone orchestration: per-zone artifacts and polygon-space
//! stitching across resolution boundaries.

use rangeshed::config::{MultiscaleConfig, RunConfig};
use rangeshed::core::pipeline::{RunStatus, ViewshedPipeline};
use rangeshed::io::dem::InMemoryDemProvider;
use rangeshed::shutdown::ShutdownFlag;
use rangeshed::types::{AltitudeMode, BoundingBox, SensorRecord};
use tempfile::TempDir;

fn flat_provider() -> InMemoryDemProvider {
    let bbox = BoundingBox { min_lon: -0.9, max_lon: 0.9, min_lat: -0.9, max_lat: 0.9 };
    InMemoryDemProvider::flat(bbox, 0.0, 60)
}

fn multiscale_config(dirs: &TempDir) -> RunConfig {
    RunConfig {
        cache_dir: dirs.path().join("cache"),
        output_dir: dirs.path().join("output"),
        target_altitudes_m: vec![200.0],
        max_range_km: 40.0,
        multiscale: MultiscaleConfig {
            enable: true,
            near_m: 20_000.0,
            mid_m: 80_000.0,
            far_m: 160_000.0,
            res_near_m: 200.0,
            res_mid_m: 400.0,
            res_far_m: 1000.0,
        },
        min_area_m2: 100_000.0,
        ..RunConfig::default()
    }
}

fn sensor() -> SensorRecord {
    SensorRecord {
        name: "multi".to_string(),
        latitude: 0.0,
        longitude: 0.0,
        height_hint_m: Some(10.0),
        altitude_mode: AltitudeMode::ClampToGround,
        input_altitude_m: None,
    }
}

fn output_area_m2(path: &std::path::Path) -> f64 {
    use geo::Area;
    let content = std::fs::read_to_string(path).unwrap();
    let mut area_deg2 = 0.0;
    let mut search = content.as_str();
    while let Some(ring_start) = search.find("<LinearRing><coordinates>") {
        let is_inner = search[..ring_start].rfind("<innerBoundaryIs>")
            > search[..ring_start].rfind("<outerBoundaryIs>");
        let rest = &search[ring_start + "<LinearRing><coordinates>".len()..];
        let end = rest.find("</coordinates>").unwrap();
        let coords: Vec<geo::Coord<f64>> = rest[..end]
            .split_whitespace()
            .filter_map(|tuple| {
                let mut parts = tuple.split(',');
                let x: f64 = parts.next()?.parse().ok()?;
                let y: f64 = parts.next()?.parse().ok()?;
                Some(geo::Coord { x, y })
            })
            .collect();
        if coords.len() >= 4 {
            let ring = geo::Polygon::new(geo::LineString(coords), vec![]).unsigned_area();
            area_deg2 += if is_inner { -ring } else { ring };
        }
        search = &rest[end..];
    }
    area_deg2 * 110_574.0 * 111_320.0
}

#[test]
fn test_two_zone_run_produces_stitched_coverage() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dirs = TempDir::new().unwrap();
    let provider = flat_provider();
    let config = multiscale_config(&dirs);

    let pipeline = ViewshedPipeline::new(&config, &provider, ShutdownFlag::new()).unwrap();
    let report = pipeline.run(&[sensor()]).unwrap();

    assert!(report.complete);
    assert!(matches!(report.sensors[0].status, RunStatus::Completed));
    // One artifact per zone: near [0, 20 km] and mid [20, 40 km].
    assert_eq!(pipeline.cache().artifact_count(), 2);

    // At 200 m over flat terrain the whole 40 km disc is visible; a seam
    // failure at the 20 km zone boundary would show up as missing area.
    let outputs: Vec<_> = std::fs::read_dir(&config.output_dir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .collect();
    assert_eq!(outputs.len(), 1);
    let expected = std::f64::consts::PI * 40_000.0_f64 * 40_000.0;
    let actual = output_area_m2(&outputs[0]);
    let ratio = actual / expected;
    assert!(
        (0.93..1.07).contains(&ratio),
        "stitched area off by {:.1}%",
        (ratio - 1.0) * 100.0
    );
}

#[test]
fn test_second_run_hits_both_zone_artifacts() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dirs = TempDir::new().unwrap();
    let provider = flat_provider();
    let config = multiscale_config(&dirs);

    let pipeline = ViewshedPipeline::new(&config, &provider, ShutdownFlag::new()).unwrap();
    pipeline.run(&[sensor()]).unwrap();
    assert_eq!(pipeline.cache().artifact_count(), 2);

    let report = pipeline.run(&[sensor()]).unwrap();
    assert!(report.complete);
    assert_eq!(pipeline.cache().artifact_count(), 2);
    assert_eq!(report.sensors[0].outputs_written, 0);
    assert_eq!(report.sensors[0].outputs_skipped, 1);
}
