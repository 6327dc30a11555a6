//! Ellipsoidal Earth model and horizon geometry.
//!
//! All curvature handling uses the effective-radius approximation: the local
//! Gaussian radius of the WGS84 ellipsoid scaled by the atmospheric k-factor.

use crate::types::{ViewshedError, ViewshedResult};

/// WGS84 semi-major axis (m)
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;
/// WGS84 first eccentricity squared
pub const WGS84_E2: f64 = 2.0 * WGS84_F - WGS84_F * WGS84_F;

/// Meridian and prime-vertical radii of curvature (M, N) at a latitude.
pub fn local_radii_of_curvature(lat_deg: f64) -> (f64, f64) {
    let phi = lat_deg.to_radians();
    let sin_phi = phi.sin();
    let denom = (1.0 - WGS84_E2 * sin_phi * sin_phi).sqrt();
    let n = WGS84_A / denom;
    let m = WGS84_A * (1.0 - WGS84_E2) / (denom * denom * denom);
    (m, n)
}

/// Azimuthally averaged (Gaussian) radius at a latitude.
pub fn gaussian_radius(lat_deg: f64) -> f64 {
    let (m, n) = local_radii_of_curvature(lat_deg);
    (m * n).sqrt()
}

/// Effective Earth radius `k * R_local` used for refraction-corrected
/// curvature.
pub fn effective_earth_radius(lat_deg: f64, k: f64) -> f64 {
    gaussian_radius(lat_deg) * k
}

/// Geometric drop of the curved surface below the tangent plane at distance
/// `d`: `d^2 / (2 * R_eff)`.
#[inline]
pub fn curvature_drop(distance_m: f64, r_eff: f64) -> f64 {
    distance_m * distance_m / (2.0 * r_eff)
}

/// Mutual line-of-sight horizon distance (m) between an observer and a
/// target at the given heights above MSL:
/// `d_max = sqrt(2*R_eff*h_obs) + sqrt(2*R_eff*h_tgt)`.
pub fn mutual_horizon_distance(
    observer_height_m: f64,
    target_height_m: f64,
    lat_deg: f64,
    k: f64,
) -> ViewshedResult<f64> {
    if !observer_height_m.is_finite() || !target_height_m.is_finite() || !lat_deg.is_finite() {
        return Err(ViewshedError::InvalidInput(
            "horizon distance requires finite heights and latitude".to_string(),
        ));
    }
    if observer_height_m < 0.0 || target_height_m < 0.0 {
        return Err(ViewshedError::InvalidInput(format!(
            "horizon distance requires non-negative heights, got observer={} target={}",
            observer_height_m, target_height_m
        )));
    }
    let r_eff = effective_earth_radius(lat_deg, k);
    Ok((2.0 * r_eff * observer_height_m).sqrt() + (2.0 * r_eff * target_height_m).sqrt())
}

/// Horizon distance (m) for an observer alone.
pub fn single_horizon_distance(observer_height_m: f64, lat_deg: f64, k: f64) -> ViewshedResult<f64> {
    mutual_horizon_distance(observer_height_m, 0.0, lat_deg, k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gaussian_radius_bounds() {
        // The Gaussian radius lies between the polar and equatorial extremes.
        let r_equator = gaussian_radius(0.0);
        let r_pole = gaussian_radius(90.0);
        assert!(r_equator > 6.33e6 && r_equator < 6.36e6);
        assert!(r_pole > 6.39e6 && r_pole < 6.40e6);
        assert!(r_pole > r_equator);
    }

    #[test]
    fn test_radii_of_curvature_at_equator() {
        let (m, n) = local_radii_of_curvature(0.0);
        // N at the equator equals the semi-major axis.
        assert!((n - WGS84_A).abs() < 1e-6);
        assert!(m < n);
    }

    #[test]
    fn test_horizon_reduces_to_single_at_zero_target() {
        let mutual = mutual_horizon_distance(10.0, 0.0, 45.0, 1.333).unwrap();
        let single = single_horizon_distance(10.0, 45.0, 1.333).unwrap();
        assert_eq!(mutual, single);
        // ~13 km for a 10 m observer with standard refraction.
        assert!((single - 13_000.0).abs() < 200.0);
    }

    #[test]
    fn test_horizon_strictly_increasing_in_heights() {
        let base = mutual_horizon_distance(10.0, 100.0, 45.0, 1.333).unwrap();
        assert!(mutual_horizon_distance(11.0, 100.0, 45.0, 1.333).unwrap() > base);
        assert!(mutual_horizon_distance(10.0, 101.0, 45.0, 1.333).unwrap() > base);
    }

    #[test]
    fn test_horizon_rejects_bad_inputs() {
        assert!(mutual_horizon_distance(f64::NAN, 0.0, 45.0, 1.333).is_err());
        assert!(mutual_horizon_distance(-1.0, 0.0, 45.0, 1.333).is_err());
        assert!(mutual_horizon_distance(10.0, f64::INFINITY, 45.0, 1.333).is_err());
    }

    #[test]
    fn test_curvature_drop() {
        let r_eff = effective_earth_radius(45.0, 1.333);
        // 10 km path drops roughly 5.9 m under k=4/3 refraction.
        let drop = curvature_drop(10_000.0, r_eff);
        assert!((drop - 5.9).abs() < 0.3);
        assert_eq!(curvature_drop(0.0, r_eff), 0.0);
    }
}
