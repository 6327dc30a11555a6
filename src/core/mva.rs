//! Minimum-visible-altitude radial sweep.
//!
//! For every raster cell, compute the lowest MSL altitude a target needs to
//! be seen from the sensor. Each ray tracks its running maximum elevation
//! angle, which turns the per-ray visibility check into a single outward
//! pass; producing an altitude surface instead of a boolean mask lets one
//! sweep serve every target altitude afterwards.

use ndarray::Array2;
use rayon::prelude::*;
use std::f64::consts::{FRAC_PI_2, PI};

use crate::geo::earth::curvature_drop;
use crate::types::{
    AeqdRaster, BoundaryHorizon, MvaRaster, ViewshedError, ViewshedResult, MVA_NEVER,
};

/// Hard ceiling on ray count, matching the boundary-horizon bin layout
pub const N_AZ_MAX: usize = 14_400;

/// Sweep parameters for one zone
#[derive(Debug, Clone)]
pub struct SweepParams {
    /// Observer height above MSL
    pub sensor_height_msl: f64,
    /// Effective Earth radius (k * local radius)
    pub r_eff: f64,
    /// Inner radius of the annulus (0 for the innermost zone)
    pub r_min_m: f64,
    /// Outer radius of the annulus
    pub r_max_m: f64,
    /// Initial per-ray max elevation angle, for radial continuation from a
    /// previous zone or a cached boundary
    pub starting_boundary: Option<Vec<f64>>,
}

/// Result of sweeping one zone
#[derive(Debug)]
pub struct SweepOutput {
    pub mva: MvaRaster,
    /// Running max elevation angle per ray at `r_max`, length `n_az`
    pub final_boundary: Vec<f64>,
    /// `final_boundary` resampled onto the fixed persistence bins
    pub boundary: BoundaryHorizon,
    /// DEM samples along rays that had no data and were taken as sea level
    pub nodata_samples: usize,
}

/// Radial-sweep MVA engine
pub struct MvaEngine {
    params: SweepParams,
}

impl MvaEngine {
    pub fn new(params: SweepParams) -> ViewshedResult<Self> {
        let p = &params;
        if !(p.sensor_height_msl.is_finite() && p.r_eff.is_finite() && p.r_eff > 0.0) {
            return Err(ViewshedError::InvalidInput(format!(
                "sweep requires finite sensor height and positive effective radius, got h={} R={}",
                p.sensor_height_msl, p.r_eff
            )));
        }
        if !(p.r_min_m >= 0.0 && p.r_max_m > p.r_min_m && p.r_max_m.is_finite()) {
            return Err(ViewshedError::InvalidInput(format!(
                "sweep requires 0 <= r_min < r_max, got [{}, {}]",
                p.r_min_m, p.r_max_m
            )));
        }
        Ok(Self { params })
    }

    /// Ray count for an outer radius and pixel size: arc length at `r_max`
    /// of about one pixel, capped, and rounded up to even.
    pub fn azimuth_count(r_max_m: f64, pixel_size_m: f64) -> usize {
        let circumference = 2.0 * PI * r_max_m;
        let n = (circumference / pixel_size_m).ceil() as usize;
        let n = n.clamp(8, N_AZ_MAX);
        if n % 2 != 0 { n + 1 } else { n }
    }

    /// Run the sweep over an AEQD elevation raster.
    pub fn compute(&self, dem: &AeqdRaster) -> ViewshedResult<SweepOutput> {
        let p = dem.pixel_size_m();
        let h_r = self.params.sensor_height_msl;
        let r_eff = self.params.r_eff;
        let r_min = self.params.r_min_m;
        let r_max = self.params.r_max_m;

        let n_az = Self::azimuth_count(r_max, p);
        let n_r = ((r_max - r_min) / p).ceil() as usize;
        if n_r == 0 {
            return Err(ViewshedError::InvalidInput("zone has no radial extent".to_string()));
        }
        let d_phi = 2.0 * PI / n_az as f64;

        log::debug!(
            "radial sweep: {} rays x {} steps over [{:.0}, {:.0}] m at {} m",
            n_az, n_r, r_min, r_max, p
        );

        let starting = match &self.params.starting_boundary {
            Some(b) => Some(resample_boundary(b, n_az)),
            None => None,
        };

        // Ground elevation at the sensor cell; voids count as sea level.
        let sensor_ground = {
            let g = dem.sample_bilinear(0.0, 0.0);
            if g.is_nan() { 0.0 } else { g as f64 }
        };

        // Per-ray outward pass. Rays are mathematically independent.
        let ray_results: Vec<(Vec<f32>, f64, usize)> = (0..n_az)
            .into_par_iter()
            .map(|j| {
                let phi = j as f64 * d_phi;
                let (sin_phi, cos_phi) = phi.sin_cos();
                let mut m_j = starting.as_ref().map(|b| b[j]).unwrap_or(-FRAC_PI_2);
                let mut row = Vec::with_capacity(n_r);
                let mut nodata = 0usize;

                for i in 0..n_r {
                    let r = r_min + i as f64 * p;
                    if r <= 0.0 {
                        // The sensor is always visible to itself.
                        row.push(sensor_ground as f32);
                        continue;
                    }
                    let x = r * sin_phi;
                    let y = r * cos_phi;
                    let sampled = dem.sample_bilinear(x, y);
                    let h_g = if sampled.is_nan() {
                        nodata += 1;
                        0.0
                    } else {
                        sampled as f64
                    };

                    let drop = curvature_drop(r, r_eff);
                    let theta = ((h_g - drop - h_r) / r).atan();
                    if theta > m_j {
                        m_j = theta;
                    }
                    let h_req = h_r + r * m_j.tan() + drop;
                    row.push(h_req.max(h_g) as f32);
                }
                (row, m_j, nodata)
            })
            .collect();

        let mut polar = Array2::<f32>::zeros((n_az, n_r));
        let mut final_boundary = Vec::with_capacity(n_az);
        let mut nodata_samples = 0usize;
        for (j, (row, m_j, nodata)) in ray_results.into_iter().enumerate() {
            for (i, v) in row.into_iter().enumerate() {
                polar[[j, i]] = v;
            }
            final_boundary.push(m_j);
            nodata_samples += nodata;
        }

        let total_samples = n_az * n_r;
        if nodata_samples > 0 {
            let pct = 100.0 * nodata_samples as f64 / total_samples as f64;
            if pct > 5.0 {
                log::warn!(
                    "zone has {:.1}% no-data DEM samples (treated as sea level)",
                    pct
                );
            } else {
                log::debug!("{} no-data DEM samples treated as sea level", nodata_samples);
            }
        }

        let mva = self.rasterize(dem, &polar, n_az, n_r, d_phi, p);
        let boundary = BoundaryHorizon::from_ray_boundary(&final_boundary);

        Ok(SweepOutput { mva, final_boundary, boundary, nodata_samples })
    }

    /// Map the polar MVA back onto the Cartesian grid: nearest (phi, r)
    /// sample per pixel, inner sample preferred on radial ties. Pixels
    /// outside the annulus stay at the never-visible sentinel.
    fn rasterize(
        &self,
        dem: &AeqdRaster,
        polar: &Array2<f32>,
        n_az: usize,
        n_r: usize,
        d_phi: f64,
        p: f64,
    ) -> MvaRaster {
        let width = dem.width();
        let height = dem.height();
        let r_min = self.params.r_min_m;
        let r_max = self.params.r_max_m;
        let transform = dem.transform;

        let rows: Vec<Vec<f32>> = (0..height)
            .into_par_iter()
            .map(|row| {
                let mut out = Vec::with_capacity(width);
                for col in 0..width {
                    let (x, y) = transform.pixel_to_xy(col as f64, row as f64);
                    let r = (x * x + y * y).sqrt();
                    if r < r_min || r > r_max {
                        out.push(MVA_NEVER);
                        continue;
                    }
                    let mut az = x.atan2(y);
                    if az < 0.0 {
                        az += 2.0 * PI;
                    }
                    let az_idx = ((az / d_phi).round() as usize) % n_az;
                    // Inner preference: exact half-step ties round down.
                    let f = (r - r_min) / p;
                    let base = f.floor();
                    let r_idx = if f - base > 0.5 { base as usize + 1 } else { base as usize };
                    let r_idx = r_idx.min(n_r - 1);
                    out.push(polar[[az_idx, r_idx]]);
                }
                out
            })
            .collect();

        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        let data = Array2::from_shape_vec((height, width), flat)
            .expect("rasterize dimensions are consistent by construction");
        MvaRaster { data, transform, crs: dem.crs.clone() }
    }
}

/// Nearest-bin resampling of a boundary vector onto a different ray count.
fn resample_boundary(boundary: &[f64], n_az: usize) -> Vec<f64> {
    let n = boundary.len();
    if n == n_az {
        return boundary.to_vec();
    }
    (0..n_az).map(|j| boundary[(j * n) / n_az]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::earth::effective_earth_radius;
    use crate::types::GeoTransform;

    /// Flat AEQD terrain at a constant elevation.
    fn flat_dem(elevation: f32, half_extent_m: f64, pixel_m: f64) -> AeqdRaster {
        let dim = ((2.0 * half_extent_m) / pixel_m).ceil() as usize + 1;
        let dim = if dim % 2 == 0 { dim + 1 } else { dim };
        let half = dim as f64 * pixel_m / 2.0;
        AeqdRaster {
            data: Array2::from_elem((dim, dim), elevation),
            transform: GeoTransform::north_up(-half, half, pixel_m),
            crs: "+proj=aeqd +lat_0=0 +lon_0=0".to_string(),
        }
    }

    fn engine(h_r: f64, r_max: f64) -> MvaEngine {
        MvaEngine::new(SweepParams {
            sensor_height_msl: h_r,
            r_eff: effective_earth_radius(0.0, 1.333),
            r_min_m: 0.0,
            r_max_m: r_max,
            starting_boundary: None,
        })
        .unwrap()
    }

    #[test]
    fn test_azimuth_count_tracks_circumference() {
        // 50 km radius at 30 m pixels wants >10k rays, capped at the max.
        assert_eq!(MvaEngine::azimuth_count(50_000.0, 30.0), N_AZ_MAX);
        let n = MvaEngine::azimuth_count(5_000.0, 30.0);
        assert!(n >= 1000 && n < 1200);
        assert_eq!(n % 2, 0);
    }

    #[test]
    fn test_sensor_cell_equals_ground() {
        let dem = flat_dem(37.0, 5_000.0, 100.0);
        let out = engine(47.0, 5_000.0).compute(&dem).unwrap();
        let centre = out.mva.data.nrows() / 2;
        assert!((out.mva.data[[centre, centre]] - 37.0).abs() < 0.5);
    }

    #[test]
    fn test_mva_floor_is_ground() {
        let dem = flat_dem(12.0, 5_000.0, 100.0);
        let out = engine(22.0, 5_000.0).compute(&dem).unwrap();
        for v in out.mva.data.iter().filter(|v| v.is_finite()) {
            assert!(*v >= 12.0 - 1e-3);
        }
    }

    #[test]
    fn test_flat_terrain_mva_follows_smooth_earth() {
        // Inside the observer horizon the ground itself is visible, so MVA
        // equals ground; beyond it the surface grows as drop(r - r*).
        let r_eff = effective_earth_radius(0.0, 1.333);
        let h_r = 10.0;
        let r_star = (2.0 * r_eff * h_r).sqrt();
        let dem = flat_dem(0.0, 30_000.0, 100.0);
        let out = engine(h_r, 30_000.0).compute(&dem).unwrap();

        let centre = out.mva.data.nrows() / 2;
        // 8 km east: inside the horizon, ground visible.
        let inside = out.mva.data[[centre, centre + 80]];
        assert!(inside.abs() < 0.6, "expected ~0, got {}", inside);

        // 25 km east: past the horizon, compare with the closed form.
        let r = 25_000.0;
        let expected = (r - r_star).powi(2) / (2.0 * r_eff);
        let beyond = out.mva.data[[centre, centre + 250]] as f64;
        assert!(
            (beyond - expected).abs() < 2.0,
            "expected ~{:.2}, got {:.2}",
            expected,
            beyond
        );
    }

    #[test]
    fn test_mva_monotonic_beyond_horizon() {
        let dem = flat_dem(0.0, 30_000.0, 100.0);
        let out = engine(10.0, 30_000.0).compute(&dem).unwrap();
        let centre = out.mva.data.nrows() / 2;
        // Along the +x ray past the horizon, MVA never decreases.
        let mut last = 0.0f32;
        for col in centre + 140..centre + 290 {
            let v = out.mva.data[[centre, col]];
            assert!(v >= last - 1e-3, "MVA decreased from {} to {}", last, v);
            last = v;
        }
    }

    #[test]
    fn test_ridge_casts_shadow() {
        // A 100 m wall at 5 km east. Cells behind it need altitude; cells on
        // other azimuths see the smooth-earth surface.
        let mut dem = flat_dem(0.0, 10_000.0, 100.0);
        let centre = dem.data.nrows() / 2;
        let wall_col = centre + 50;
        for row in 0..dem.data.nrows() {
            dem.data[[row, wall_col]] = 100.0;
        }

        let out = engine(10.0, 10_000.0).compute(&dem).unwrap();
        // 8 km east, behind the wall: the required altitude approaches the
        // wall-top sightline, far above flat-earth values.
        let shadowed = out.mva.data[[centre, centre + 80]];
        assert!(shadowed > 100.0, "expected shadowed MVA > 100 m, got {}", shadowed);
        // 8 km north is unobstructed (inside horizon, ground visible).
        let clear = out.mva.data[[centre - 80, centre]];
        assert!(clear < 1.0, "expected clear MVA ~0, got {}", clear);
    }

    #[test]
    fn test_shadow_length_shrinks_with_altitude() {
        // Threshold the MVA at two altitudes: higher targets are visible
        // closer behind the wall.
        let mut dem = flat_dem(0.0, 10_000.0, 100.0);
        let centre = dem.data.nrows() / 2;
        for row in 0..dem.data.nrows() {
            dem.data[[row, centre + 50]] = 100.0;
        }
        let out = engine(10.0, 10_000.0).compute(&dem).unwrap();

        let visible_at = |alt: f32| -> usize {
            (centre + 51..centre + 100)
                .filter(|&col| out.mva.data[[centre, col]] <= alt)
                .count()
        };
        assert!(visible_at(500.0) > visible_at(150.0));
    }

    #[test]
    fn test_nodata_treated_as_sea_level() {
        let mut dem = flat_dem(0.0, 5_000.0, 100.0);
        let centre = dem.data.nrows() / 2;
        for col in centre + 10..centre + 20 {
            dem.data[[centre, col]] = f32::NAN;
        }
        let out = engine(10.0, 5_000.0).compute(&dem).unwrap();
        assert!(out.nodata_samples > 0);
        // The gap does not block anything: cells beyond it stay near ground.
        let beyond = out.mva.data[[centre, centre + 30]];
        assert!(beyond < 1.0);
    }

    #[test]
    fn test_outside_annulus_is_never_visible() {
        let dem = flat_dem(0.0, 10_000.0, 100.0);
        let params = SweepParams {
            sensor_height_msl: 10.0,
            r_eff: effective_earth_radius(0.0, 1.333),
            r_min_m: 4_000.0,
            r_max_m: 8_000.0,
            starting_boundary: None,
        };
        let out = MvaEngine::new(params).unwrap().compute(&dem).unwrap();
        let centre = out.mva.data.nrows() / 2;
        // Inside the hole and outside the rim: sentinel.
        assert_eq!(out.mva.data[[centre, centre + 10]], MVA_NEVER);
        assert_eq!(out.mva.data[[centre, centre + 95]], MVA_NEVER);
        // Within the annulus: finite.
        assert!(out.mva.data[[centre, centre + 60]].is_finite());
    }

    #[test]
    fn test_zone_continuation_matches_full_sweep() {
        let dem = flat_dem(0.0, 30_000.0, 100.0);
        let r_eff = effective_earth_radius(0.0, 1.333);
        let full = engine(10.0, 30_000.0).compute(&dem).unwrap();

        let inner = MvaEngine::new(SweepParams {
            sensor_height_msl: 10.0,
            r_eff,
            r_min_m: 0.0,
            r_max_m: 20_000.0,
            starting_boundary: None,
        })
        .unwrap()
        .compute(&dem)
        .unwrap();

        let outer = MvaEngine::new(SweepParams {
            sensor_height_msl: 10.0,
            r_eff,
            r_min_m: 20_000.0,
            r_max_m: 30_000.0,
            starting_boundary: Some(inner.final_boundary.clone()),
        })
        .unwrap()
        .compute(&dem)
        .unwrap();

        let centre = full.mva.data.nrows() / 2;
        for col in [centre + 220, centre + 250, centre + 280] {
            let a = full.mva.data[[centre, col]];
            let b = outer.mva.data[[centre, col]];
            assert!(
                (a - b).abs() < 1.0,
                "full sweep {} vs continued sweep {} at col {}",
                a, b, col
            );
        }
    }

    #[test]
    fn test_rejects_non_finite_inputs() {
        assert!(MvaEngine::new(SweepParams {
            sensor_height_msl: f64::NAN,
            r_eff: 8.5e6,
            r_min_m: 0.0,
            r_max_m: 1000.0,
            starting_boundary: None,
        })
        .is_err());
        assert!(MvaEngine::new(SweepParams {
            sensor_height_msl: 10.0,
            r_eff: 8.5e6,
            r_min_m: 2000.0,
            r_max_m: 1000.0,
            starting_boundary: None,
        })
        .is_err());
    }
}
