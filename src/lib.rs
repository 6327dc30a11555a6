//! RangeShed: terrain-aware viewshed computation for ground-based sensors
//!
//! Computes, for each point within a sensor's range, the minimum altitude at
//! which a target becomes visible (the MVA surface), accounting for Earth
//! curvature, atmospheric refraction, and terrain masking from a 30 m global
//! DEM. Thresholding the MVA at a target altitude yields coverage polygons;
//! a two-tier cache makes repeated runs over varying altitudes and styles
//! near-instant.

pub mod config;
pub mod core;
pub mod geo;
pub mod io;
pub mod shutdown;
pub mod types;

// Re-export main types
pub use config::{AltitudeReference, RunConfig, StyleConfig};
pub use types::{
    AeqdRaster, AltitudeMode, BoundaryHorizon, BoundingBox, GeoTransform, MvaRaster, Sensor,
    SensorRecord, ViewshedError, ViewshedResult, Zone,
};
