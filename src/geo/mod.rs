//! Geodesy: ellipsoid model, horizon geometry, and the sensor-centred
//! azimuthal-equidistant projection.

pub mod aeqd;
pub mod earth;

pub use aeqd::AeqdProjector;
pub use earth::{
    curvature_drop, effective_earth_radius, gaussian_radius, mutual_horizon_distance,
    single_horizon_distance,
};
