use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Real-valued elevation or MVA raster data
pub type ElevationGrid = Array2<f32>;

/// Number of azimuth bins in a persisted boundary horizon (0.025° resolution)
pub const N_BOUNDARY_AZ: usize = 14_400;

/// Sentinel used for "never visible at any altitude within numeric range"
pub const MVA_NEVER: f32 = f32::INFINITY;

/// Altitude semantics of a sensor placemark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AltitudeMode {
    ClampToGround,
    RelativeToGround,
    Absolute,
}

impl AltitudeMode {
    /// Decode a KML altitudeMode string; unknown values clamp to ground.
    pub fn from_kml(s: &str) -> Self {
        match s.trim() {
            "relativeToGround" => AltitudeMode::RelativeToGround,
            "absolute" => AltitudeMode::Absolute,
            _ => AltitudeMode::ClampToGround,
        }
    }
}

impl std::fmt::Display for AltitudeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AltitudeMode::ClampToGround => write!(f, "clampToGround"),
            AltitudeMode::RelativeToGround => write!(f, "relativeToGround"),
            AltitudeMode::Absolute => write!(f, "absolute"),
        }
    }
}

/// Raw sensor record as parsed from a KML or CSV source, before the DEM has
/// been queried for ground elevation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorRecord {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Mast height above ground, if the source supplied one
    pub height_hint_m: Option<f64>,
    pub altitude_mode: AltitudeMode,
    /// Raw altitude value from the source document (may be 0 or absent)
    pub input_altitude_m: Option<f64>,
}

/// A fully grounded sensor: position, mast height, and the DEM elevation at
/// the sensor point. Constructed once per request, immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Mast/antenna height above ground level in meters
    pub sensor_height_agl_m: f64,
    /// Ground elevation MSL at the sensor point, sampled from the DEM
    pub ground_elev_msl_m: f64,
    pub altitude_mode: AltitudeMode,
    /// Raw altitude from the source document (used by Relative/Absolute modes)
    pub input_altitude_m: Option<f64>,
    /// Atmospheric refraction factor (typ. 1.333)
    pub refraction_k: f64,
}

impl Sensor {
    /// Effective observer height above MSL.
    ///
    /// ClampToGround ignores the document altitude; RelativeToGround adds it
    /// above ground; Absolute treats it as the platform altitude MSL. The
    /// mast height is added in every mode.
    pub fn effective_height_msl(&self) -> f64 {
        match self.altitude_mode {
            AltitudeMode::ClampToGround => self.ground_elev_msl_m + self.sensor_height_agl_m,
            AltitudeMode::RelativeToGround => {
                self.ground_elev_msl_m
                    + self.input_altitude_m.unwrap_or(0.0)
                    + self.sensor_height_agl_m
            }
            AltitudeMode::Absolute => {
                self.input_altitude_m.unwrap_or(self.ground_elev_msl_m) + self.sensor_height_agl_m
            }
        }
    }
}

/// One concentric annulus of the multiscale sweep
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub index: usize,
    pub r_min_m: f64,
    pub r_max_m: f64,
    pub pixel_size_m: f64,
}

/// Geospatial bounding box in WGS84 degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.min_lon && lon <= self.max_lon && lat >= self.min_lat && lat <= self.max_lat
    }
}

/// Affine georeference of a north-up raster (GDAL-style six coefficients)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform with square pixels and no rotation.
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_size: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: pixel_size,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_size,
        }
    }

    /// Map pixel (col, row) to projected (x, y) at the pixel centre.
    pub fn pixel_to_xy(&self, col: f64, row: f64) -> (f64, f64) {
        let x = self.top_left_x + (col + 0.5) * self.pixel_width + (row + 0.5) * self.rotation_x;
        let y = self.top_left_y + (col + 0.5) * self.rotation_y + (row + 0.5) * self.pixel_height;
        (x, y)
    }

    /// Map projected (x, y) to fractional pixel (col, row) relative to pixel centres.
    ///
    /// Valid for north-up transforms (no rotation terms).
    pub fn xy_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let col = (x - self.top_left_x) / self.pixel_width - 0.5;
        let row = (y - self.top_left_y) / self.pixel_height - 0.5;
        (col, row)
    }

    pub fn as_array(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    pub fn from_array(a: [f64; 6]) -> Self {
        Self {
            top_left_x: a[0],
            pixel_width: a[1],
            rotation_x: a[2],
            top_left_y: a[3],
            rotation_y: a[4],
            pixel_height: a[5],
        }
    }
}

/// Elevation raster georeferenced in WGS84 degrees.
///
/// No-data is NaN. Rows run north to south (negative pixel height).
#[derive(Debug, Clone)]
pub struct GeoRaster {
    pub data: ElevationGrid,
    pub transform: GeoTransform,
}

impl GeoRaster {
    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    /// Bilinearly sample the raster at a lon/lat position.
    ///
    /// Returns NaN outside the raster or where any contributing cell is
    /// no-data.
    pub fn sample_bilinear(&self, lon: f64, lat: f64) -> f32 {
        bilinear_sample(&self.data, &self.transform, lon, lat)
    }
}

/// Bilinear sampling over any north-up raster; NaN outside the grid, nearest
/// neighbour when a contributing cell is void so isolated voids do not grow.
pub(crate) fn bilinear_sample(data: &ElevationGrid, transform: &GeoTransform, x: f64, y: f64) -> f32 {
    let (col, row) = transform.xy_to_pixel(x, y);
    let (h, w) = data.dim();
    if col < 0.0 || row < 0.0 || col > (w - 1) as f64 || row > (h - 1) as f64 {
        return f32::NAN;
    }
    let c0 = col.floor() as usize;
    let r0 = row.floor() as usize;
    let c1 = (c0 + 1).min(w - 1);
    let r1 = (r0 + 1).min(h - 1);
    let fc = (col - c0 as f64) as f32;
    let fr = (row - r0 as f64) as f32;

    let v00 = data[[r0, c0]];
    let v01 = data[[r0, c1]];
    let v10 = data[[r1, c0]];
    let v11 = data[[r1, c1]];
    if v00.is_nan() || v01.is_nan() || v10.is_nan() || v11.is_nan() {
        return data[[row.round() as usize, col.round() as usize]];
    }
    let top = v00 + (v01 - v00) * fc;
    let bottom = v10 + (v11 - v10) * fc;
    top + (bottom - top) * fr
}

/// Elevation raster in a sensor-centred azimuthal-equidistant frame.
///
/// Square pixels, no rotation; no-data is NaN.
#[derive(Debug, Clone)]
pub struct AeqdRaster {
    pub data: ElevationGrid,
    pub transform: GeoTransform,
    /// PROJ definition of the sensor-centred CRS
    pub crs: String,
}

impl AeqdRaster {
    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    pub fn pixel_size_m(&self) -> f64 {
        self.transform.pixel_width
    }

    /// Bilinearly sample at a projected (x, y) position; NaN outside.
    pub fn sample_bilinear(&self, x: f64, y: f64) -> f32 {
        bilinear_sample(&self.data, &self.transform, x, y)
    }
}

/// Minimum-visible-altitude surface over an AEQD grid.
///
/// Values are meters MSL; `MVA_NEVER` marks cells that are never visible.
#[derive(Debug, Clone)]
pub struct MvaRaster {
    pub data: ElevationGrid,
    pub transform: GeoTransform,
    pub crs: String,
}

/// Per-azimuth running maximum elevation angle (radians) at a cache's outer
/// radius. Fixed 14 400-bin layout so artifacts stay forward-compatible;
/// `valid = false` means the vector is a zero-filled placeholder.
#[derive(Debug, Clone)]
pub struct BoundaryHorizon {
    pub angles: Vec<f32>,
    pub valid: bool,
}

impl BoundaryHorizon {
    pub fn zero_filled() -> Self {
        Self { angles: vec![0.0; N_BOUNDARY_AZ], valid: false }
    }

    /// Resample a per-ray boundary of arbitrary length onto the fixed bins.
    pub fn from_ray_boundary(final_boundary: &[f64]) -> Self {
        let n = final_boundary.len();
        if n == 0 {
            return Self::zero_filled();
        }
        let mut angles = Vec::with_capacity(N_BOUNDARY_AZ);
        for i in 0..N_BOUNDARY_AZ {
            let src = (i * n) / N_BOUNDARY_AZ;
            angles.push(final_boundary[src] as f32);
        }
        Self { angles, valid: true }
    }
}

/// Error types for viewshed processing
#[derive(Debug, thiserror::Error)]
pub enum ViewshedError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not authenticated with DEM service: {0}")]
    NotAuthenticated(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("DEM tile unavailable: {0}")]
    TileUnavailable(String),

    #[error("Corrupt DEM tile: {0}")]
    CorruptTile(String),

    #[error("Corrupt cache artifact: {0}")]
    CorruptArtifact(String),

    #[error("cancellation requested")]
    Cancelled,

    #[error("Resource limit exceeded: {0}")]
    ResourceExhausted(String),

    #[error("Geometry error: {0}")]
    Geometry(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),
}

/// Result type for viewshed operations
pub type ViewshedResult<T> = Result<T, ViewshedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_altitude_mode_decoding() {
        assert_eq!(AltitudeMode::from_kml("absolute"), AltitudeMode::Absolute);
        assert_eq!(AltitudeMode::from_kml("relativeToGround"), AltitudeMode::RelativeToGround);
        assert_eq!(AltitudeMode::from_kml("clampToGround"), AltitudeMode::ClampToGround);
        assert_eq!(AltitudeMode::from_kml("seaFloor"), AltitudeMode::ClampToGround);
    }

    fn sensor_with_mode(mode: AltitudeMode, input_altitude: Option<f64>) -> Sensor {
        Sensor {
            id: "test".to_string(),
            latitude: 51.0,
            longitude: 7.0,
            sensor_height_agl_m: 5.0,
            ground_elev_msl_m: 100.0,
            altitude_mode: mode,
            input_altitude_m: input_altitude,
            refraction_k: 1.333,
        }
    }

    #[test]
    fn test_effective_height_clamp_ignores_document_altitude() {
        let s = sensor_with_mode(AltitudeMode::ClampToGround, Some(40.0));
        assert_eq!(s.effective_height_msl(), 105.0);
    }

    #[test]
    fn test_effective_height_relative_adds_offset() {
        let s = sensor_with_mode(AltitudeMode::RelativeToGround, Some(40.0));
        assert_eq!(s.effective_height_msl(), 145.0);
    }

    #[test]
    fn test_effective_height_absolute_replaces_ground() {
        let s = sensor_with_mode(AltitudeMode::Absolute, Some(300.0));
        assert_eq!(s.effective_height_msl(), 305.0);
        // Without a document altitude, fall back to the DEM ground elevation.
        let s = sensor_with_mode(AltitudeMode::Absolute, None);
        assert_eq!(s.effective_height_msl(), 105.0);
    }

    #[test]
    fn test_geotransform_roundtrip() {
        let t = GeoTransform::north_up(-15_000.0, 15_000.0, 30.0);
        let (x, y) = t.pixel_to_xy(10.0, 20.0);
        let (col, row) = t.xy_to_pixel(x, y);
        assert!((col - 10.0).abs() < 1e-9);
        assert!((row - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_boundary_horizon_resampling() {
        let per_ray = vec![0.25f64; 720];
        let bh = BoundaryHorizon::from_ray_boundary(&per_ray);
        assert!(bh.valid);
        assert_eq!(bh.angles.len(), N_BOUNDARY_AZ);
        assert!(bh.angles.iter().all(|&a| (a - 0.25).abs() < 1e-6));
    }
}
