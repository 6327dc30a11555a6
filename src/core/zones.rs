//! Multiscale zone planning.
//!
//! The sweep radius is split into up to three concentric annuli of
//! increasing pixel size so that far terrain, whose angular footprint per
//! pixel shrinks anyway, is processed at coarse resolution. Zones partition
//! `[0, R]`; each is swept independently and stitched in polygon space.

use crate::config::MultiscaleConfig;
use crate::core::mva::MvaEngine;
use crate::types::{ViewshedError, ViewshedResult, Zone};

/// Guard against far zones so coarse that a radius spans almost no pixels
pub const MIN_PIXELS_PER_RADIUS: f64 = 16.0;

/// Plan the ordered zone list covering `[0, required_radius]`.
///
/// With multiscale disabled there is a single zone at the base pixel size.
/// Empty zones (entirely beyond the required radius) are dropped.
pub fn plan_zones(
    required_radius_m: f64,
    base_pixel_size_m: f64,
    multiscale: &MultiscaleConfig,
) -> ViewshedResult<Vec<Zone>> {
    if !(required_radius_m.is_finite() && required_radius_m > 0.0) {
        return Err(ViewshedError::InvalidInput(format!(
            "required radius must be positive and finite, got {}",
            required_radius_m
        )));
    }

    let raw: Vec<(f64, f64, f64)> = if !multiscale.enable {
        vec![(0.0, required_radius_m, base_pixel_size_m)]
    } else {
        vec![
            (0.0, multiscale.near_m, multiscale.res_near_m),
            (multiscale.near_m, multiscale.mid_m, multiscale.res_mid_m),
            (multiscale.mid_m, required_radius_m.max(multiscale.far_m), multiscale.res_far_m),
        ]
    };

    let mut zones = Vec::new();
    for (r_min, r_max, pixel) in raw {
        if required_radius_m <= r_min {
            continue;
        }
        let r_max = r_max.min(required_radius_m);
        if r_max <= r_min {
            continue;
        }
        let zone = Zone { index: zones.len(), r_min_m: r_min, r_max_m: r_max, pixel_size_m: pixel };
        validate_zone(&zone)?;
        zones.push(zone);
    }

    log::debug!(
        "planned {} zone(s) for radius {:.1} km: {:?}",
        zones.len(),
        required_radius_m / 1000.0,
        zones
    );
    Ok(zones)
}

fn validate_zone(zone: &Zone) -> ViewshedResult<()> {
    if zone.pixel_size_m <= 0.0 {
        return Err(ViewshedError::InvalidInput(format!(
            "zone {} has non-positive pixel size",
            zone.index
        )));
    }
    if zone.pixel_size_m > zone.r_max_m / MIN_PIXELS_PER_RADIUS {
        return Err(ViewshedError::InvalidInput(format!(
            "zone {} is under-sampled: {} m pixels over a {:.0} m radius (needs at least {} pixels per radius)",
            zone.index, zone.pixel_size_m, zone.r_max_m, MIN_PIXELS_PER_RADIUS
        )));
    }
    Ok(())
}

/// Estimated working-set bytes for sweeping one zone: the Cartesian raster
/// plus the polar grid, four bytes per sample each.
pub fn zone_memory_bytes(zone: &Zone) -> usize {
    let extent = zone.r_max_m * 1.05;
    let dim = ((2.0 * extent) / zone.pixel_size_m).ceil() as usize + 1;
    let cartesian = dim * dim * 4;

    let n_az = MvaEngine::azimuth_count(zone.r_max_m, zone.pixel_size_m);
    let n_r = ((zone.r_max_m - zone.r_min_m) / zone.pixel_size_m).ceil() as usize;
    let polar = n_az * n_r * 4;

    cartesian + polar
}

/// Reject zones whose working set exceeds the configured budget.
pub fn check_memory_budget(zone: &Zone, max_raster_bytes: usize) -> ViewshedResult<()> {
    let needed = zone_memory_bytes(zone);
    if needed > max_raster_bytes {
        return Err(ViewshedError::ResourceExhausted(format!(
            "zone {} needs ~{} MB of raster memory but the budget is {} MB; \
             raise pixel_size_m or lower max_range_km",
            zone.index,
            needed / 1024 / 1024,
            max_raster_bytes / 1024 / 1024
        )));
    }
    Ok(())
}
