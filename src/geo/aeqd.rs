//! Sensor-centred azimuthal-equidistant projection.
//!
//! Radial distances from the projection centre are exact by construction,
//! which is what the radial sweep needs; angular distortion only affects
//! raster sampling and stays tolerable at 30-1000 m pixel sizes. Point
//! transforms solve the geodesic direct/inverse problems on the WGS84
//! ellipsoid (Vincenty).

use ndarray::Array2;
use rayon::prelude::*;

use crate::geo::earth::{WGS84_A, WGS84_F};
use crate::types::{AeqdRaster, GeoRaster, GeoTransform, ViewshedError, ViewshedResult};

const VINCENTY_MAX_ITER: usize = 100;
const VINCENTY_EPS: f64 = 1e-12;

/// Solve the geodesic direct problem: from a start point, along an initial
/// azimuth (radians, clockwise from north), over a distance (m).
/// Returns (lat, lon) in degrees.
pub fn geodesic_direct(lat_deg: f64, lon_deg: f64, azimuth_rad: f64, distance_m: f64) -> (f64, f64) {
    if distance_m == 0.0 {
        return (lat_deg, lon_deg);
    }
    let a = WGS84_A;
    let f = WGS84_F;
    let b = a * (1.0 - f);

    let phi1 = lat_deg.to_radians();
    let alpha1 = azimuth_rad;
    let (sin_alpha1, cos_alpha1) = alpha1.sin_cos();

    let tan_u1 = (1.0 - f) * phi1.tan();
    let cos_u1 = 1.0 / (1.0 + tan_u1 * tan_u1).sqrt();
    let sin_u1 = tan_u1 * cos_u1;

    let sigma1 = tan_u1.atan2(cos_alpha1);
    let sin_alpha = cos_u1 * sin_alpha1;
    let cos_sq_alpha = 1.0 - sin_alpha * sin_alpha;
    let u_sq = cos_sq_alpha * (a * a - b * b) / (b * b);
    let big_a = 1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
    let big_b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));

    let mut sigma = distance_m / (b * big_a);
    let mut cos_2sigma_m;
    let mut sin_sigma;
    let mut cos_sigma;
    let mut iter = 0;
    loop {
        cos_2sigma_m = (2.0 * sigma1 + sigma).cos();
        sin_sigma = sigma.sin();
        cos_sigma = sigma.cos();
        let delta_sigma = big_b
            * sin_sigma
            * (cos_2sigma_m
                + big_b / 4.0
                    * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)
                        - big_b / 6.0
                            * cos_2sigma_m
                            * (-3.0 + 4.0 * sin_sigma * sin_sigma)
                            * (-3.0 + 4.0 * cos_2sigma_m * cos_2sigma_m)));
        let sigma_next = distance_m / (b * big_a) + delta_sigma;
        let done = (sigma_next - sigma).abs() < VINCENTY_EPS || iter >= VINCENTY_MAX_ITER;
        sigma = sigma_next;
        iter += 1;
        if done {
            cos_2sigma_m = (2.0 * sigma1 + sigma).cos();
            sin_sigma = sigma.sin();
            cos_sigma = sigma.cos();
            break;
        }
    }

    let tmp = sin_u1 * sin_sigma - cos_u1 * cos_sigma * cos_alpha1;
    let phi2 = (sin_u1 * cos_sigma + cos_u1 * sin_sigma * cos_alpha1)
        .atan2((1.0 - f) * (sin_alpha * sin_alpha + tmp * tmp).sqrt());
    let lambda = (sin_sigma * sin_alpha1).atan2(cos_u1 * cos_sigma - sin_u1 * sin_sigma * cos_alpha1);
    let c = f / 16.0 * cos_sq_alpha * (4.0 + f * (4.0 - 3.0 * cos_sq_alpha));
    let l = lambda
        - (1.0 - c)
            * f
            * sin_alpha
            * (sigma
                + c * sin_sigma
                    * (cos_2sigma_m + c * cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)));

    let mut lon2 = lon_deg + l.to_degrees();
    if lon2 > 180.0 {
        lon2 -= 360.0;
    } else if lon2 < -180.0 {
        lon2 += 360.0;
    }
    (phi2.to_degrees(), lon2)
}

/// Solve the geodesic inverse problem between two points.
/// Returns (initial azimuth in radians clockwise from north, distance in m).
pub fn geodesic_inverse(
    lat1_deg: f64,
    lon1_deg: f64,
    lat2_deg: f64,
    lon2_deg: f64,
) -> ViewshedResult<(f64, f64)> {
    let a = WGS84_A;
    let f = WGS84_F;
    let b = a * (1.0 - f);

    let phi1 = lat1_deg.to_radians();
    let phi2 = lat2_deg.to_radians();
    let l = (lon2_deg - lon1_deg).to_radians();

    let tan_u1 = (1.0 - f) * phi1.tan();
    let cos_u1 = 1.0 / (1.0 + tan_u1 * tan_u1).sqrt();
    let sin_u1 = tan_u1 * cos_u1;
    let tan_u2 = (1.0 - f) * phi2.tan();
    let cos_u2 = 1.0 / (1.0 + tan_u2 * tan_u2).sqrt();
    let sin_u2 = tan_u2 * cos_u2;

    let mut lambda = l;
    let mut iter = 0;
    let (sin_sigma, cos_sigma, sigma, cos_sq_alpha, cos_2sigma_m);
    loop {
        let (sin_lambda, cos_lambda) = lambda.sin_cos();
        let t1 = cos_u2 * sin_lambda;
        let t2 = cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda;
        let ss = (t1 * t1 + t2 * t2).sqrt();
        if ss == 0.0 {
            // Coincident points
            return Ok((0.0, 0.0));
        }
        let cs = sin_u1 * sin_u2 + cos_u1 * cos_u2 * cos_lambda;
        let sig = ss.atan2(cs);
        let sa = cos_u1 * cos_u2 * sin_lambda / ss;
        let csa = 1.0 - sa * sa;
        let c2sm = if csa.abs() < 1e-12 { 0.0 } else { cs - 2.0 * sin_u1 * sin_u2 / csa };
        let c = f / 16.0 * csa * (4.0 + f * (4.0 - 3.0 * csa));
        let lambda_next = l
            + (1.0 - c)
                * f
                * sa
                * (sig + c * ss * (c2sm + c * cs * (-1.0 + 2.0 * c2sm * c2sm)));
        let converged = (lambda_next - lambda).abs() < VINCENTY_EPS;
        lambda = lambda_next;
        iter += 1;
        if converged || iter >= VINCENTY_MAX_ITER {
            if iter >= VINCENTY_MAX_ITER && !converged {
                return Err(ViewshedError::Processing(format!(
                    "geodesic inverse failed to converge between ({}, {}) and ({}, {})",
                    lat1_deg, lon1_deg, lat2_deg, lon2_deg
                )));
            }
            sin_sigma = ss;
            cos_sigma = cs;
            sigma = sig;
            cos_sq_alpha = csa;
            cos_2sigma_m = c2sm;
            break;
        }
    }

    let u_sq = cos_sq_alpha * (a * a - b * b) / (b * b);
    let big_a = 1.0 + u_sq / 16384.0 * (4096.0 + u_sq * (-768.0 + u_sq * (320.0 - 175.0 * u_sq)));
    let big_b = u_sq / 1024.0 * (256.0 + u_sq * (-128.0 + u_sq * (74.0 - 47.0 * u_sq)));
    let delta_sigma = big_b
        * sin_sigma
        * (cos_2sigma_m
            + big_b / 4.0
                * (cos_sigma * (-1.0 + 2.0 * cos_2sigma_m * cos_2sigma_m)
                    - big_b / 6.0
                        * cos_2sigma_m
                        * (-3.0 + 4.0 * sin_sigma * sin_sigma)
                        * (-3.0 + 4.0 * cos_2sigma_m * cos_2sigma_m)));
    let distance = b * big_a * (sigma - delta_sigma);

    let (sin_lambda, cos_lambda) = lambda.sin_cos();
    let azimuth = (cos_u2 * sin_lambda).atan2(cos_u1 * sin_u2 - sin_u1 * cos_u2 * cos_lambda);
    Ok((azimuth, distance))
}

/// Azimuthal-equidistant projector centred on a sensor.
///
/// Projected x points east, y north; x = d*sin(az), y = d*cos(az) with az
/// the geodesic azimuth from the centre.
#[derive(Debug, Clone)]
pub struct AeqdProjector {
    pub center_lat: f64,
    pub center_lon: f64,
    crs: String,
}

impl AeqdProjector {
    pub fn new(center_lat: f64, center_lon: f64) -> ViewshedResult<Self> {
        if !center_lat.is_finite() || !center_lon.is_finite() || center_lat.abs() > 90.0 {
            return Err(ViewshedError::InvalidInput(format!(
                "invalid projection centre ({}, {})",
                center_lat, center_lon
            )));
        }
        let crs = format!(
            "+proj=aeqd +lat_0={} +lon_0={} +x_0=0 +y_0=0 +datum=WGS84 +units=m +no_defs",
            center_lat, center_lon
        );
        Ok(Self { center_lat, center_lon, crs })
    }

    /// PROJ definition of this CRS, as persisted in cache artifacts.
    pub fn crs(&self) -> &str {
        &self.crs
    }

    /// WGS84 -> projected meters.
    pub fn forward(&self, lat: f64, lon: f64) -> ViewshedResult<(f64, f64)> {
        let (az, dist) = geodesic_inverse(self.center_lat, self.center_lon, lat, lon)?;
        Ok((dist * az.sin(), dist * az.cos()))
    }

    /// Projected meters -> WGS84.
    pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
        let dist = (x * x + y * y).sqrt();
        if dist == 0.0 {
            return (self.center_lat, self.center_lon);
        }
        let az = x.atan2(y);
        geodesic_direct(self.center_lat, self.center_lon, az, dist)
    }

    /// Build the square grid covering a radius: extent = 1.05 * radius with
    /// the sensor at the centre pixel. Returns (transform, width, height).
    pub fn grid_for_radius(&self, radius_m: f64, pixel_size_m: f64) -> (GeoTransform, usize, usize) {
        let extent = radius_m * 1.05;
        let dim = ((2.0 * extent) / pixel_size_m).ceil() as usize;
        // Odd dimension keeps the sensor exactly on the centre pixel.
        let dim = if dim % 2 == 0 { dim + 1 } else { dim };
        let half = (dim as f64) * pixel_size_m / 2.0;
        (GeoTransform::north_up(-half, half, pixel_size_m), dim, dim)
    }

    /// Reproject a WGS84 elevation raster onto an AEQD grid by backward
    /// mapping: every target pixel is carried through the geodesic direct
    /// problem and bilinearly sampled from the source. No-data propagates as
    /// NaN; cells outside the source coverage become NaN.
    pub fn reproject_to_aeqd(
        &self,
        dem: &GeoRaster,
        radius_m: f64,
        pixel_size_m: f64,
    ) -> ViewshedResult<AeqdRaster> {
        if !(radius_m.is_finite() && radius_m > 0.0 && pixel_size_m > 0.0) {
            return Err(ViewshedError::InvalidInput(format!(
                "reprojection needs positive radius and pixel size, got r={} p={}",
                radius_m, pixel_size_m
            )));
        }
        let (transform, width, height) = self.grid_for_radius(radius_m, pixel_size_m);
        log::debug!(
            "reprojecting DEM to AEQD: {}x{} pixels at {} m centred on ({:.5}, {:.5})",
            width, height, pixel_size_m, self.center_lat, self.center_lon
        );

        let rows: Vec<Vec<f32>> = (0..height)
            .into_par_iter()
            .map(|row| {
                let mut out = Vec::with_capacity(width);
                for col in 0..width {
                    let (x, y) = transform.pixel_to_xy(col as f64, row as f64);
                    let (lat, lon) = self.inverse(x, y);
                    out.push(dem.sample_bilinear(lon, lat));
                }
                out
            })
            .collect();

        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        let data = Array2::from_shape_vec((height, width), flat)
            .map_err(|e| ViewshedError::Processing(format!("failed to shape AEQD raster: {}", e)))?;

        let nodata = data.iter().filter(|v| v.is_nan()).count();
        let total = data.len();
        if nodata > 0 {
            log::debug!(
                "AEQD raster has {} / {} no-data cells ({:.1}%)",
                nodata, total, 100.0 * nodata as f64 / total as f64
            );
        }

        Ok(AeqdRaster { data, transform, crs: self.crs.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use ndarray::Array2;

    #[test]
    fn test_direct_inverse_roundtrip() {
        let (lat, lon) = geodesic_direct(48.5, 9.1, 1.0, 150_000.0);
        let (az, dist) = geodesic_inverse(48.5, 9.1, lat, lon).unwrap();
        assert!((dist - 150_000.0).abs() < 0.01);
        assert!((az - 1.0).abs() < 1e-8);
    }

    #[test]
    fn test_direct_north_increases_latitude() {
        let (lat, lon) = geodesic_direct(10.0, 20.0, 0.0, 111_000.0);
        assert!(lat > 10.9 && lat < 11.1);
        assert!((lon - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_inverse_known_meridian_arc() {
        // One degree of latitude near the equator is ~110.57 km.
        let (_, dist) = geodesic_inverse(0.0, 0.0, 1.0, 0.0).unwrap();
        assert!((dist - 110_574.0).abs() < 10.0);
    }

    #[test]
    fn test_projector_roundtrip() {
        let p = AeqdProjector::new(47.0, 11.0).unwrap();
        let (x, y) = p.forward(47.3, 11.4).unwrap();
        let (lat, lon) = p.inverse(x, y);
        assert!((lat - 47.3).abs() < 1e-8);
        assert!((lon - 11.4).abs() < 1e-8);
    }

    #[test]
    fn test_projector_centre_maps_to_origin() {
        let p = AeqdProjector::new(-33.9, 18.4).unwrap();
        let (x, y) = p.forward(-33.9, 18.4).unwrap();
        assert!(x.abs() < 1e-6 && y.abs() < 1e-6);
        let (lat, lon) = p.inverse(0.0, 0.0);
        assert_eq!((lat, lon), (-33.9, 18.4));
    }

    #[test]
    fn test_grid_sensor_on_centre_pixel() {
        let p = AeqdProjector::new(0.0, 0.0).unwrap();
        let (transform, width, height) = p.grid_for_radius(10_000.0, 30.0);
        assert_eq!(width, height);
        assert_eq!(width % 2, 1);
        let centre = (width / 2) as f64;
        let (x, y) = transform.pixel_to_xy(centre, centre);
        assert!(x.abs() < 1e-6 && y.abs() < 1e-6);
    }

    #[test]
    fn test_reproject_constant_dem() {
        // A constant-elevation DEM must reproject to a constant AEQD raster.
        let data = Array2::from_elem((201, 201), 42.0f32);
        let transform = GeoTransform::north_up(-1.0, 1.0, 0.01);
        let dem = GeoRaster { data, transform };
        let p = AeqdProjector::new(0.0, 0.0).unwrap();
        let raster = p.reproject_to_aeqd(&dem, 5_000.0, 500.0).unwrap();
        let centre = raster.height() / 2;
        assert_eq!(raster.data[[centre, centre]], 42.0);
        let finite = raster.data.iter().filter(|v| !v.is_nan()).count();
        assert!(finite > 0);
        assert!(raster.data.iter().all(|v| v.is_nan() || (*v - 42.0).abs() < 1e-3));
    }
}
