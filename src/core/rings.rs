//! Geodesic horizon rings.
//!
//! For each sensor and target altitude, the mutual-horizon distance bounds
//! coverage regardless of terrain; the rings are useful as detection-range
//! overlays next to the terrain-aware polygons.

use geo::{Coord, LineString, Polygon};

use crate::geo::aeqd::geodesic_direct;
use crate::geo::earth::mutual_horizon_distance;
use crate::types::{Sensor, ViewshedResult};

/// One ring: target altitude and the horizon-limited distance
#[derive(Debug, Clone, Copy)]
pub struct HorizonRing {
    pub altitude_msl_m: f64,
    pub distance_m: f64,
}

/// Mutual-horizon distances for every (sensor, altitude) pair.
pub fn compute_horizons(
    sensors: &[Sensor],
    altitudes_msl: &[f64],
) -> ViewshedResult<Vec<(String, Vec<HorizonRing>)>> {
    let mut results = Vec::with_capacity(sensors.len());
    for sensor in sensors {
        let h_r = sensor.effective_height_msl();
        let mut rings = Vec::with_capacity(altitudes_msl.len());
        for &alt in altitudes_msl {
            let distance_m = mutual_horizon_distance(
                h_r.max(0.0),
                alt.max(0.0),
                sensor.latitude,
                sensor.refraction_k,
            )?;
            rings.push(HorizonRing { altitude_msl_m: alt, distance_m });
        }
        results.push((sensor.id.clone(), rings));
    }
    Ok(results)
}

/// Circle of geodesic radius `radius_m` around a point, as a WGS84 polygon.
pub fn geodesic_circle(lat: f64, lon: f64, radius_m: f64, segments: usize) -> Polygon<f64> {
    let mut coords = Vec::with_capacity(segments + 1);
    for i in 0..segments {
        let azimuth = 2.0 * std::f64::consts::PI * i as f64 / segments as f64;
        let (clat, clon) = geodesic_direct(lat, lon, azimuth, radius_m);
        coords.push(Coord { x: clon, y: clat });
    }
    coords.push(coords[0]);
    Polygon::new(LineString(coords), vec![])
}
