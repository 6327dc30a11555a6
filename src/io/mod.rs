//! I/O modules: DEM acquisition, sensor sources, KML output, and the Tier-1
//! viewshed cache.

pub mod cache;
pub mod dem;
pub mod kml;
pub mod sensors;

pub use cache::{zone_fingerprint, CachedZone, ViewshedCache};
pub use dem::{approximate_bounding_box, DemProvider, InMemoryDemProvider, SrtmDemProvider};
