//! Run orchestration.
//!
//! Drives a request end to end: ground the sensors against the DEM, plan
//! zones, compute or load each zone's MVA, extract coverage polygons per
//! target altitude, optionally union across sensors, and emit KML outputs
//! behind the Tier-2 skip check. Sensors run in parallel on a bounded
//! worker pool; zones within a sensor run in order because each seeds the
//! next one's boundary. One sensor failing never aborts the others.

use geo::MultiPolygon;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::{AltitudeReference, RunConfig};
use crate::core::mask::MaskExtractor;
use crate::core::mva::{MvaEngine, SweepParams};
use crate::core::rings::{compute_horizons, geodesic_circle};
use crate::core::state::{output_fingerprint, should_write};
use crate::core::union::UnionBuilder;
use crate::core::zones::{check_memory_budget, plan_zones};
use crate::geo::aeqd::AeqdProjector;
use crate::geo::earth::{effective_earth_radius, mutual_horizon_distance};
use crate::io::cache::{zone_fingerprint, CacheSidecar, CachedZone, ViewshedCache, CACHE_SCHEMA_VERSION};
use crate::io::dem::{approximate_bounding_box, DemProvider};
use crate::io::kml::{
    output_filename, tag_detection_range, tag_sensor_height, tag_target_altitude,
    write_viewshed_kml, OutputMetadata,
};
use crate::shutdown::ShutdownFlag;
use crate::types::{
    MvaRaster, Sensor, SensorRecord, ViewshedError, ViewshedResult,
};

/// Final status of one sensor in a run
#[derive(Debug, Clone)]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed { zone_index: Option<usize>, phase: String, message: String },
}

/// Per-sensor outcome
#[derive(Debug, Clone)]
pub struct SensorRunReport {
    pub sensor_id: String,
    pub status: RunStatus,
    pub outputs_written: usize,
    pub outputs_skipped: usize,
}

/// Whole-run outcome; `complete` is false when any sensor failed or the run
/// was cancelled mid-way.
#[derive(Debug)]
pub struct RunReport {
    pub sensors: Vec<SensorRunReport>,
    pub union_outputs_written: usize,
    pub union_outputs_skipped: usize,
    pub complete: bool,
}

/// Polygon sets one sensor produced, keyed by target-altitude index
struct SensorCoverage {
    report: SensorRunReport,
    /// (altitude index, WGS84 polygons, outer-zone fingerprint, horizon
    /// distance in meters)
    per_altitude: Vec<(usize, MultiPolygon<f64>, String, f64)>,
}

pub struct ViewshedPipeline<'a, P: DemProvider> {
    config: &'a RunConfig,
    provider: &'a P,
    cache: ViewshedCache,
    shutdown: ShutdownFlag,
}

impl<'a, P: DemProvider> ViewshedPipeline<'a, P> {
    pub fn new(
        config: &'a RunConfig,
        provider: &'a P,
        shutdown: ShutdownFlag,
    ) -> ViewshedResult<Self> {
        config.validate()?;
        let cache = ViewshedCache::open(config.viewshed_cache_dir())?;
        Ok(Self { config, provider, cache, shutdown })
    }

    pub fn cache(&self) -> &ViewshedCache {
        &self.cache
    }

    /// Run the full request for a set of sensor records.
    pub fn run(&self, records: &[SensorRecord]) -> ViewshedResult<RunReport> {
        if records.is_empty() {
            return Err(ViewshedError::InvalidInput("no sensors to process".to_string()));
        }

        let workers = self.config.concurrency.effective_workers();
        log::info!(
            "processing {} sensor(s) x {} altitude(s) on {} worker(s)",
            records.len(),
            self.config.target_altitudes_m.len(),
            workers
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| ViewshedError::Processing(format!("failed to build worker pool: {}", e)))?;

        let coverages: Vec<SensorCoverage> = pool.install(|| {
            records
                .par_iter()
                .enumerate()
                .map(|(idx, record)| self.process_sensor(idx, record))
                .collect()
        });

        // Union stage: one polygon set per altitude across all sensors.
        let mut union_written = 0usize;
        let mut union_skipped = 0usize;
        if self.config.union_outputs && !self.shutdown.is_requested() {
            let mut by_altitude: BTreeMap<usize, Vec<(String, MultiPolygon<f64>, String, f64)>> =
                BTreeMap::new();
            for coverage in &coverages {
                for (alt_idx, polys, fp, d_max) in &coverage.per_altitude {
                    by_altitude.entry(*alt_idx).or_default().push((
                        coverage.report.sensor_id.clone(),
                        polys.clone(),
                        fp.clone(),
                        *d_max,
                    ));
                }
            }
            for (alt_idx, contributions) in by_altitude {
                match self.write_union(alt_idx, &contributions) {
                    Ok(true) => union_written += 1,
                    Ok(false) => union_skipped += 1,
                    Err(e) => log::error!(
                        "union output at altitude index {} failed: {}",
                        alt_idx, e
                    ),
                }
            }
        }

        if self.shutdown.is_requested() {
            self.cache.cleanup_temps();
        }

        let sensors: Vec<SensorRunReport> =
            coverages.into_iter().map(|c| c.report).collect();
        let complete = sensors.iter().all(|r| matches!(r.status, RunStatus::Completed))
            && !self.shutdown.is_requested();

        for report in &sensors {
            match &report.status {
                RunStatus::Completed => log::info!(
                    "sensor {}: completed ({} written, {} skipped)",
                    report.sensor_id, report.outputs_written, report.outputs_skipped
                ),
                RunStatus::Cancelled => log::warn!("sensor {}: cancelled", report.sensor_id),
                RunStatus::Failed { zone_index, phase, message } => log::error!(
                    "sensor {}: failed in {} (zone {:?}): {}",
                    report.sensor_id, phase, zone_index, message
                ),
            }
        }

        Ok(RunReport {
            sensors,
            union_outputs_written: union_written,
            union_outputs_skipped: union_skipped,
            complete,
        })
    }

    /// Ground a raw record against the DEM: sample the ground elevation and
    /// fix the mast height.
    fn ground_sensor(&self, record: &SensorRecord) -> ViewshedResult<Sensor> {
        if !record.latitude.is_finite()
            || !record.longitude.is_finite()
            || record.latitude.abs() > 90.0
            || record.longitude.abs() > 180.0
        {
            return Err(ViewshedError::InvalidInput(format!(
                "sensor '{}' has invalid coordinates ({}, {})",
                record.name, record.latitude, record.longitude
            )));
        }

        let point_bbox = approximate_bounding_box(record.longitude, record.latitude, 1000.0);
        self.provider.ensure_coverage(&point_bbox)?;
        let sampled = self.provider.sample_point(record.latitude, record.longitude)?;
        let ground = if sampled.is_nan() {
            log::warn!("no DEM data at sensor '{}', assuming sea level", record.name);
            0.0
        } else {
            sampled as f64
        };

        Ok(Sensor {
            id: record.name.clone(),
            latitude: record.latitude,
            longitude: record.longitude,
            sensor_height_agl_m: record.height_hint_m.unwrap_or(self.config.sensor_height_m_agl),
            ground_elev_msl_m: ground,
            altitude_mode: record.altitude_mode,
            input_altitude_m: record.input_altitude_m,
            refraction_k: self.config.atmospheric_k_factor,
        })
    }

    /// Target altitude in MSL terms for a sensor. AGL requests are offset by
    /// the sensor's ground elevation.
    fn target_altitude_msl(&self, sensor: &Sensor, altitude: f64) -> f64 {
        match self.config.target_altitude_reference {
            AltitudeReference::Msl => altitude,
            AltitudeReference::Agl => sensor.ground_elev_msl_m + altitude,
        }
    }

    /// Full per-sensor flow; never panics the run, converts errors into the
    /// report status.
    fn process_sensor(&self, sensor_index: usize, record: &SensorRecord) -> SensorCoverage {
        let fail = |phase: &str, zone: Option<usize>, e: &ViewshedError| SensorCoverage {
            report: SensorRunReport {
                sensor_id: record.name.clone(),
                status: if matches!(e, ViewshedError::Cancelled) {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed {
                        zone_index: zone,
                        phase: phase.to_string(),
                        message: e.to_string(),
                    }
                },
                outputs_written: 0,
                outputs_skipped: 0,
            },
            per_altitude: Vec::new(),
        };

        if self.shutdown.is_requested() {
            return fail("startup", None, &ViewshedError::Cancelled);
        }

        let sensor = match self.ground_sensor(record) {
            Ok(s) => s,
            Err(e) => return fail("grounding", None, &e),
        };
        let h_r = sensor.effective_height_msl();
        log::info!(
            "sensor {}: ground {:.1} m MSL, observer {:.1} m MSL",
            sensor.id, sensor.ground_elev_msl_m, h_r
        );

        // Resolve every target altitude once: MSL value and horizon-limited
        // range. The sweep radius serves the highest requested altitude.
        let mut altitude_plan: Vec<(f64, f64, f64)> = Vec::new();
        for &alt in &self.config.target_altitudes_m {
            let a_msl = self.target_altitude_msl(&sensor, alt);
            match mutual_horizon_distance(
                h_r.max(0.0),
                a_msl.max(0.0),
                sensor.latitude,
                sensor.refraction_k,
            ) {
                Ok(d) => altitude_plan.push((alt, a_msl, d.min(self.config.max_range_m()))),
                Err(e) => return fail("horizon", None, &e),
            }
        }
        let required_radius = altitude_plan.iter().map(|(_, _, d)| *d).fold(0.0, f64::max);

        let zones = match plan_zones(required_radius, self.config.pixel_size_m, &self.config.multiscale)
        {
            Ok(z) => z,
            Err(e) => return fail("zone planning", None, &e),
        };

        let projector = match AeqdProjector::new(sensor.latitude, sensor.longitude) {
            Ok(p) => p,
            Err(e) => return fail("projection", None, &e),
        };

        // Compute or load each zone, chaining boundaries outward.
        let mut zone_rasters: Vec<MvaRaster> = Vec::with_capacity(zones.len());
        let mut prev_boundary: Option<Vec<f64>> = None;
        for zone in &zones {
            if let Err(e) = self.shutdown.checkpoint() {
                return fail("sweep", Some(zone.index), &e);
            }
            match self.compute_zone(&sensor, zone, &projector, prev_boundary.take()) {
                Ok(entry) => {
                    prev_boundary = if entry.boundary.valid {
                        Some(entry.boundary.angles.iter().map(|&a| a as f64).collect())
                    } else {
                        None
                    };
                    zone_rasters.push(entry.mva);
                }
                Err(e) => return fail("sweep", Some(zone.index), &e),
            }
        }

        // Extraction and output per target altitude.
        let outer_zone = zones.last().expect("plan_zones never returns an empty list");
        let outer_fp = zone_fingerprint(&sensor, outer_zone, &self.config.earth_model);
        let extractor = MaskExtractor::new(self.config.simplify_tolerance_m, self.config.min_area_m2);
        let zone_refs: Vec<&MvaRaster> = zone_rasters.iter().collect();

        let mut written = 0usize;
        let mut skipped = 0usize;
        let mut per_altitude = Vec::new();
        for (alt_idx, &(alt, a_msl, d_max)) in altitude_plan.iter().enumerate() {
            if let Err(e) = self.shutdown.checkpoint() {
                return fail("extraction", None, &e);
            }
            let polygons = match extractor.extract(&zone_refs, a_msl, d_max, &projector) {
                Ok(p) => p,
                Err(e) => return fail("extraction", None, &e),
            };

            match self.write_sensor_output(sensor_index, alt_idx, &sensor, alt, a_msl, d_max, &outer_fp, &polygons) {
                Ok(true) => written += 1,
                Ok(false) => skipped += 1,
                Err(e) => return fail("output", None, &e),
            }
            per_altitude.push((alt_idx, polygons, outer_fp.clone(), d_max));
        }

        // Horizon-ring overlays: one geodesic circle per altitude at the
        // detection-range distance.
        if self.config.horizon_rings {
            let alts_msl: Vec<f64> = altitude_plan.iter().map(|(_, a, _)| *a).collect();
            let horizons = match compute_horizons(std::slice::from_ref(&sensor), &alts_msl) {
                Ok(h) => h,
                Err(e) => return fail("horizon", None, &e),
            };
            if let Some((_, rings)) = horizons.into_iter().next() {
                for (alt_idx, ring) in rings.iter().enumerate() {
                    let alt = altitude_plan[alt_idx].0;
                    let distance = ring.distance_m.min(self.config.max_range_m());
                    match self.write_ring_output(&sensor, alt, ring.altitude_msl_m, distance, &outer_fp) {
                        Ok(true) => written += 1,
                        Ok(false) => skipped += 1,
                        Err(e) => return fail("output", None, &e),
                    }
                }
            }
        }

        SensorCoverage {
            report: SensorRunReport {
                sensor_id: sensor.id,
                status: RunStatus::Completed,
                outputs_written: written,
                outputs_skipped: skipped,
            },
            per_altitude,
        }
    }

    /// One (sensor, zone) unit: Tier-1 lookup, else DEM fetch, reprojection,
    /// sweep, and store.
    fn compute_zone(
        &self,
        sensor: &Sensor,
        zone: &crate::types::Zone,
        projector: &AeqdProjector,
        starting_boundary: Option<Vec<f64>>,
    ) -> ViewshedResult<CachedZone> {
        let fp = zone_fingerprint(sensor, zone, &self.config.earth_model);
        if let Some(cached) = self.cache.lookup(&fp, zone.index) {
            if cached.outer_radius_m >= zone.r_max_m {
                return Ok(cached);
            }
            // Cached radius is too small for this request: recompute fully
            // and let the larger artifact replace it.
            log::debug!(
                "cached zone {} covers {:.0} m < required {:.0} m, recomputing",
                zone.index, cached.outer_radius_m, zone.r_max_m
            );
        }

        check_memory_budget(zone, self.config.resources.max_raster_bytes)?;

        let bbox =
            approximate_bounding_box(sensor.longitude, sensor.latitude, zone.r_max_m * 1.05);
        self.provider.ensure_coverage(&bbox)?;
        self.shutdown.checkpoint()?;

        let dem = self.provider.sample_bbox(&bbox, zone.pixel_size_m)?;
        let aeqd = projector.reproject_to_aeqd(&dem, zone.r_max_m, zone.pixel_size_m)?;
        self.shutdown.checkpoint()?;

        let engine = MvaEngine::new(SweepParams {
            sensor_height_msl: sensor.effective_height_msl(),
            r_eff: effective_earth_radius(sensor.latitude, sensor.refraction_k),
            r_min_m: zone.r_min_m,
            r_max_m: zone.r_max_m,
            starting_boundary,
        })?;
        let output = engine.compute(&aeqd)?;

        let entry = CachedZone {
            mva: output.mva,
            outer_radius_m: zone.r_max_m,
            boundary: output.boundary,
        };
        let sidecar = CacheSidecar {
            schema_version: CACHE_SCHEMA_VERSION,
            created_utc: chrono::Utc::now(),
            sensor_id: sensor.id.clone(),
            latitude: sensor.latitude,
            longitude: sensor.longitude,
            ground_elev_msl_m: sensor.ground_elev_msl_m,
            refraction_k: sensor.refraction_k,
            zone_index: zone.index,
            zone_r_min_m: zone.r_min_m,
            zone_r_max_m: zone.r_max_m,
            zone_pixel_size_m: zone.pixel_size_m,
            outer_radius_m: zone.r_max_m,
            earth_model: self.config.earth_model.clone(),
            dem_vertical_datum: self.provider.vertical_datum().to_string(),
        };
        self.cache.store(&fp, zone.index, &entry, &sidecar)?;
        Ok(entry)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_sensor_output(
        &self,
        sensor_index: usize,
        alt_idx: usize,
        sensor: &Sensor,
        altitude_request: f64,
        altitude_msl: f64,
        d_max: f64,
        outer_fp: &str,
        polygons: &MultiPolygon<f64>,
    ) -> ViewshedResult<bool> {
        let fingerprint = output_fingerprint(
            outer_fp,
            altitude_msl,
            self.config.max_range_m(),
            &self.config.style,
        );

        let reference = self.config.target_altitude_reference.to_string();
        let mut tags = vec![
            tag_target_altitude(altitude_request, &reference),
            tag_detection_range(d_max / 1000.0),
        ];
        if (sensor.sensor_height_agl_m - self.config.sensor_height_m_agl).abs() > 1e-9 {
            tags.push(tag_sensor_height(sensor.sensor_height_agl_m));
        }
        let sequence = (sensor_index * self.config.target_altitudes_m.len() + alt_idx + 1) as u32;
        let filename = output_filename(Some(sequence), "viewshed", &sensor.id, &tags, "kml");
        let path: PathBuf = self.config.output_dir.join(filename);

        if !should_write(&path, &fingerprint) {
            return Ok(false);
        }

        let metadata = OutputMetadata {
            entries: vec![
                ("sensor".to_string(), sensor.id.clone()),
                ("latitude".to_string(), format!("{:.6}", sensor.latitude)),
                ("longitude".to_string(), format!("{:.6}", sensor.longitude)),
                ("target_altitude_m".to_string(), format!("{:.1} {}", altitude_request, reference)),
                ("target_altitude_msl_m".to_string(), format!("{:.1}", altitude_msl)),
                ("horizon_distance_m".to_string(), format!("{:.0}", d_max)),
                ("refraction_k".to_string(), format!("{:.4}", sensor.refraction_k)),
                ("earth_model".to_string(), self.config.earth_model.clone()),
                ("dem_vertical_datum".to_string(), self.provider.vertical_datum().to_string()),
                ("sensor_fingerprint".to_string(), outer_fp.to_string()),
            ],
            fingerprint,
        };
        write_viewshed_kml(
            &path,
            polygons,
            Some((sensor.longitude, sensor.latitude)),
            &sensor.id,
            altitude_msl,
            &self.config.style,
            &metadata,
        )?;
        Ok(true)
    }

    /// Horizon-ring overlay for one (sensor, altitude): a geodesic circle at
    /// the detection-range distance, behind the same Tier-2 skip check.
    fn write_ring_output(
        &self,
        sensor: &Sensor,
        altitude_request: f64,
        altitude_msl: f64,
        distance_m: f64,
        outer_fp: &str,
    ) -> ViewshedResult<bool> {
        let fingerprint = output_fingerprint(
            &format!("{}|horizon", outer_fp),
            altitude_msl,
            distance_m,
            &self.config.style,
        );

        let reference = self.config.target_altitude_reference.to_string();
        let mut tags = vec![
            tag_target_altitude(altitude_request, &reference),
            tag_detection_range(distance_m / 1000.0),
        ];
        if (sensor.sensor_height_agl_m - self.config.sensor_height_m_agl).abs() > 1e-9 {
            tags.push(tag_sensor_height(sensor.sensor_height_agl_m));
        }
        let filename = output_filename(None, "horizon", &sensor.id, &tags, "kml");
        let path = self.config.output_dir.join(filename);

        if !should_write(&path, &fingerprint) {
            return Ok(false);
        }

        let circle = geodesic_circle(sensor.latitude, sensor.longitude, distance_m, 360);
        let metadata = OutputMetadata {
            entries: vec![
                ("sensor".to_string(), sensor.id.clone()),
                ("target_altitude_m".to_string(), format!("{:.1} {}", altitude_request, reference)),
                ("detection_range_m".to_string(), format!("{:.0}", distance_m)),
                ("refraction_k".to_string(), format!("{:.4}", sensor.refraction_k)),
                ("earth_model".to_string(), self.config.earth_model.clone()),
            ],
            fingerprint,
        };
        write_viewshed_kml(
            &path,
            &MultiPolygon(vec![circle]),
            None,
            &sensor.id,
            altitude_msl,
            &self.config.style,
            &metadata,
        )?;
        Ok(true)
    }

    /// Union output for one altitude across every contributing sensor.
    /// Returns Ok(true) when written, Ok(false) when skipped.
    fn write_union(
        &self,
        alt_idx: usize,
        contributions: &[(String, MultiPolygon<f64>, String, f64)],
    ) -> ViewshedResult<bool> {
        let altitude_request = self.config.target_altitudes_m[alt_idx];
        let reference = self.config.target_altitude_reference.to_string();

        // Simplification now happens in degrees.
        let tolerance_deg = self.config.simplify_tolerance_m / 111_320.0;
        let builder = UnionBuilder::new(tolerance_deg);
        let inputs: Vec<(String, MultiPolygon<f64>)> = contributions
            .iter()
            .map(|(id, polys, _, _)| (id.clone(), polys.clone()))
            .collect();
        let coverage = builder.build(&inputs)?;

        let combined_fp: String = contributions
            .iter()
            .map(|(_, _, fp, _)| fp.as_str())
            .collect::<Vec<_>>()
            .join("+");
        let fingerprint = output_fingerprint(
            &combined_fp,
            altitude_request,
            self.config.max_range_m(),
            &self.config.style,
        );

        // The union's detection range is the farthest contributing sensor's.
        let union_d_max = contributions.iter().map(|(_, _, _, d)| *d).fold(0.0, f64::max);
        let tags = vec![
            tag_target_altitude(altitude_request, &reference),
            tag_detection_range(union_d_max / 1000.0),
        ];
        let filename = output_filename(Some((alt_idx + 1) as u32), "viewshed", "union", &tags, "kml");
        let path = self.config.output_dir.join(filename);

        if !should_write(&path, &fingerprint) {
            return Ok(false);
        }

        let metadata = OutputMetadata {
            entries: vec![
                ("sensors".to_string(), coverage.contributing_sensors.join(", ")),
                ("target_altitude_m".to_string(), format!("{:.1} {}", altitude_request, reference)),
                ("earth_model".to_string(), self.config.earth_model.clone()),
            ],
            fingerprint,
        };
        write_viewshed_kml(
            &path,
            &coverage.polygons,
            None,
            "union",
            altitude_request,
            &self.config.style,
            &metadata,
        )?;
        Ok(true)
    }
}
