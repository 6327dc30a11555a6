//! Run configuration.
//!
//! One explicit value passed through the pipeline; nothing is read from
//! process-global state. Loaded from YAML, every field has a default so a
//! partial file is enough.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::{ViewshedError, ViewshedResult};

/// Output styling for emitted KML polygons
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleConfig {
    /// Line colour as "#RRGGBB"
    pub line_color: String,
    pub line_width: u32,
    /// Fill colour as "#RRGGBB"; empty disables fill
    pub fill_color: Option<String>,
    pub fill_opacity: f64,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            line_color: "#FFA500".to_string(),
            line_width: 2,
            fill_color: None,
            fill_opacity: 0.0,
        }
    }
}

/// Concentric-annulus resolution schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiscaleConfig {
    pub enable: bool,
    pub near_m: f64,
    pub mid_m: f64,
    pub far_m: f64,
    pub res_near_m: f64,
    pub res_mid_m: f64,
    pub res_far_m: f64,
}

impl Default for MultiscaleConfig {
    fn default() -> Self {
        Self {
            enable: true,
            near_m: 50_000.0,
            mid_m: 200_000.0,
            far_m: 800_000.0,
            res_near_m: 30.0,
            res_mid_m: 120.0,
            res_far_m: 1000.0,
        }
    }
}

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// 0 means derive from core count
    pub max_workers: usize,
    pub reserve_cpus: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_workers: 0, reserve_cpus: 2 }
    }
}

impl ConcurrencyConfig {
    /// Effective worker count: min(cores - reserve, 80% of cores), at least 1.
    pub fn effective_workers(&self) -> usize {
        if self.max_workers > 0 {
            return self.max_workers.max(1);
        }
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let reserved = cores.saturating_sub(self.reserve_cpus);
        let fraction = ((cores as f64) * 0.8).floor() as usize;
        reserved.min(fraction).max(1)
    }
}

/// In-process memory limits for zone rasters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Upper bound on (cartesian + polar) working-set bytes per zone
    pub max_raster_bytes: usize,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self { max_raster_bytes: 4 * 1024 * 1024 * 1024 }
    }
}

/// Reference frame of the requested target altitudes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AltitudeReference {
    #[serde(rename = "msl", alias = "MSL")]
    Msl,
    #[serde(rename = "agl", alias = "AGL")]
    Agl,
}

impl std::fmt::Display for AltitudeReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AltitudeReference::Msl => write!(f, "MSL"),
            AltitudeReference::Agl => write!(f, "AGL"),
        }
    }
}

/// Complete run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Target altitudes in meters, interpreted per `target_altitude_reference`
    pub target_altitudes_m: Vec<f64>,
    pub target_altitude_reference: AltitudeReference,
    /// Default mast height for sensors without a height hint
    pub sensor_height_m_agl: f64,
    pub atmospheric_k_factor: f64,
    /// Only "WGS84" is recognised
    pub earth_model: String,
    /// Hard clamp on the sweep radius
    pub max_range_km: f64,
    /// Pixel size used when multiscale is disabled
    pub pixel_size_m: f64,
    pub simplify_tolerance_m: f64,
    /// Polygons below this area are dropped as slivers
    pub min_area_m2: f64,
    /// Merge all sensors into one polygon set per altitude
    pub union_outputs: bool,
    /// Also emit a geodesic horizon-ring overlay per sensor and altitude
    pub horizon_rings: bool,
    /// Vertical datum of the DEM, surfaced into artifact metadata
    pub dem_vertical_datum: String,
    /// Additive correction applied to every DEM sample
    pub dem_vertical_offset_m: f64,
    pub multiscale: MultiscaleConfig,
    pub style: StyleConfig,
    pub concurrency: ConcurrencyConfig,
    pub resources: ResourcesConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data_cache"),
            output_dir: PathBuf::from("output"),
            target_altitudes_m: vec![100.0],
            target_altitude_reference: AltitudeReference::Msl,
            sensor_height_m_agl: 5.0,
            atmospheric_k_factor: 1.333,
            earth_model: "WGS84".to_string(),
            max_range_km: 500.0,
            pixel_size_m: 30.0,
            simplify_tolerance_m: 5.0,
            min_area_m2: 10_000.0,
            union_outputs: false,
            horizon_rings: false,
            dem_vertical_datum: "EGM2008".to_string(),
            dem_vertical_offset_m: 0.0,
            multiscale: MultiscaleConfig::default(),
            style: StyleConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            resources: ResourcesConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load from a YAML file.
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> ViewshedResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut cfg: RunConfig = serde_yaml::from_str(&content)
            .map_err(|e| ViewshedError::Config(format!("failed to parse config: {}", e)))?;
        cfg.target_altitudes_m.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        cfg.target_altitudes_m.dedup();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field invariants before any work begins.
    pub fn validate(&self) -> ViewshedResult<()> {
        if self.earth_model != "WGS84" {
            return Err(ViewshedError::Config(format!(
                "unsupported earth_model '{}'; only WGS84 is available",
                self.earth_model
            )));
        }
        if !self.atmospheric_k_factor.is_finite() || self.atmospheric_k_factor <= 0.0 {
            return Err(ViewshedError::Config(format!(
                "atmospheric_k_factor must be positive and finite, got {}",
                self.atmospheric_k_factor
            )));
        }
        if !self.max_range_km.is_finite() || self.max_range_km <= 0.0 {
            return Err(ViewshedError::Config("max_range_km must be positive".to_string()));
        }
        if self.pixel_size_m <= 0.0 {
            return Err(ViewshedError::Config("pixel_size_m must be positive".to_string()));
        }
        let ms = &self.multiscale;
        if ms.enable && !(ms.near_m < ms.mid_m && ms.mid_m < ms.far_m) {
            return Err(ViewshedError::Config(
                "multiscale zone boundaries must satisfy near_m < mid_m < far_m".to_string(),
            ));
        }
        for alt in &self.target_altitudes_m {
            if !alt.is_finite() {
                return Err(ViewshedError::Config("target altitudes must be finite".to_string()));
            }
        }
        Ok(())
    }

    pub fn max_range_m(&self) -> f64 {
        self.max_range_km * 1000.0
    }

    pub fn viewshed_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("viewsheds")
    }

    pub fn dem_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("dem")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = RunConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.atmospheric_k_factor, 1.333);
        assert_eq!(cfg.multiscale.res_far_m, 1000.0);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "max_range_km: 120\ntarget_altitudes_m: [300, 100, 300]\n";
        let mut cfg: RunConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.target_altitudes_m.sort_by(|a, b| a.partial_cmp(b).unwrap());
        cfg.target_altitudes_m.dedup();
        assert_eq!(cfg.max_range_km, 120.0);
        assert_eq!(cfg.target_altitudes_m, vec![100.0, 300.0]);
        assert_eq!(cfg.sensor_height_m_agl, 5.0);
    }

    #[test]
    fn test_rejects_non_wgs84() {
        let cfg = RunConfig { earth_model: "GRS80".to_string(), ..RunConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_unordered_multiscale() {
        let mut cfg = RunConfig::default();
        cfg.multiscale.mid_m = cfg.multiscale.far_m + 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_effective_workers_at_least_one() {
        let c = ConcurrencyConfig { max_workers: 0, reserve_cpus: 10_000 };
        assert_eq!(c.effective_workers(), 1);
        let c = ConcurrencyConfig { max_workers: 6, reserve_cpus: 0 };
        assert_eq!(c.effective_workers(), 6);
    }

    #[test]
    fn test_altitude_reference_aliases() {
        let r: AltitudeReference = serde_yaml::from_str("AGL").unwrap();
        assert_eq!(r, AltitudeReference::Agl);
        let r: AltitudeReference = serde_yaml::from_str("msl").unwrap();
        assert_eq!(r, AltitudeReference::Msl);
    }
}
