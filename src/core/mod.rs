//! Core viewshed computation: the radial sweep, zone planning, polygon
//! extraction, multi-sensor union, the Tier-2 output cache, and the run
//! orchestrator.

pub mod mask;
pub mod mva;
pub mod pipeline;
pub mod rings;
pub mod state;
pub mod union;
pub mod zones;

// Re-export main types
pub use mask::MaskExtractor;
pub use mva::{MvaEngine, SweepOutput, SweepParams};
pub use pipeline::{RunReport, RunStatus, SensorRunReport, ViewshedPipeline};
pub use rings::{compute_horizons, geodesic_circle, HorizonRing};
pub use state::{output_fingerprint, should_write, style_fingerprint};
pub use union::{UnionBuilder, UnionCoverage};
pub use zones::{plan_zones, MIN_PIXELS_PER_RADIUS};
