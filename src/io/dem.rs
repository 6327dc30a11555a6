//! DEM acquisition and sampling.
//!
//! Elevation comes from 1°x1° SRTM/Copernicus tiles in raw HGT form. Tiles
//! are downloaded once into the cache directory and decoded natively
//! (big-endian 16-bit, -32768 void). A provider yields WGS84 elevation
//! rasters over a bounding box at a requested resolution; the projector
//! consumes those.

use ndarray::Array2;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::types::{BoundingBox, GeoRaster, GeoTransform, ViewshedError, ViewshedResult};

/// SRTM void marker in raw tiles
pub const HGT_VOID: i16 = -32768;

/// Meters per degree of latitude, for bbox and grid approximations
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Elevation source over WGS84 bounding boxes.
///
/// `ensure_coverage` may download; `sample_bbox` and `sample_point` only read
/// what is already cached. Cells with no data are NaN.
pub trait DemProvider: Send + Sync {
    /// Download or otherwise make available every tile intersecting the box.
    fn ensure_coverage(&self, bbox: &BoundingBox) -> ViewshedResult<()>;

    /// Build a WGS84 elevation raster covering the box at roughly the given
    /// ground resolution.
    fn sample_bbox(&self, bbox: &BoundingBox, resolution_m: f64) -> ViewshedResult<GeoRaster>;

    /// Elevation at a single point, NaN when unknown.
    fn sample_point(&self, lat: f64, lon: f64) -> ViewshedResult<f32>;

    /// Vertical datum of the elevation data, for artifact metadata.
    fn vertical_datum(&self) -> &str;
}

/// Approximate lon/lat bounding box around a point for a ground radius.
pub fn approximate_bounding_box(lon: f64, lat: f64, radius_m: f64) -> BoundingBox {
    let dlat = radius_m / METERS_PER_DEGREE;
    let dlon = radius_m / (METERS_PER_DEGREE * lat.to_radians().cos().max(0.1));
    BoundingBox {
        min_lon: lon - dlon,
        max_lon: lon + dlon,
        min_lat: lat - dlat,
        max_lat: lat + dlat,
    }
}

/// State of one 1°x1° tile in the local cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TileState {
    /// HGT file present on disk
    Cached,
    /// All sources returned not-found; treated as open water (sea level)
    Absent,
}

/// SRTM tile provider: skadi primary source, mirror fallbacks, bounded
/// retries, magic-byte sniffing, atomic tmp+rename writes.
pub struct SrtmDemProvider {
    cache_dir: PathBuf,
    vertical_datum: String,
    /// Additive correction applied to every sample
    vertical_offset_m: f64,
    /// Never touch the network; missing tiles are an error
    offline: bool,
    /// Decoded tiles, keyed by tile name
    tiles: Mutex<HashMap<String, GeoRaster>>,
    states: Mutex<HashMap<String, TileState>>,
}

impl SrtmDemProvider {
    pub fn new<P: AsRef<Path>>(cache_dir: P) -> ViewshedResult<Self> {
        std::fs::create_dir_all(cache_dir.as_ref())?;
        Ok(Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            vertical_datum: "EGM96".to_string(),
            vertical_offset_m: 0.0,
            offline: false,
            tiles: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_vertical_offset(mut self, offset_m: f64) -> Self {
        self.vertical_offset_m = offset_m;
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    /// Names of the 1°x1° tiles intersecting a bounding box.
    pub fn tiles_for_bbox(bbox: &BoundingBox) -> Vec<String> {
        let min_lat = bbox.min_lat.floor() as i32;
        let max_lat = bbox.max_lat.ceil() as i32;
        let min_lon = bbox.min_lon.floor() as i32;
        let max_lon = bbox.max_lon.ceil() as i32;

        let mut tiles = Vec::new();
        for lat in min_lat..max_lat {
            for lon in min_lon..max_lon {
                tiles.push(Self::tile_name(lat, lon));
            }
        }
        tiles
    }

    /// SRTM naming convention: N/S + 2-digit latitude, E/W + 3-digit longitude.
    pub fn tile_name(lat: i32, lon: i32) -> String {
        let lat_prefix = if lat >= 0 { "N" } else { "S" };
        let lon_prefix = if lon >= 0 { "E" } else { "W" };
        format!("{}{:02}{}{:03}", lat_prefix, lat.abs(), lon_prefix, lon.abs())
    }

    /// Parse a tile name back to its south-west corner.
    fn parse_tile_name(tile: &str) -> ViewshedResult<(i32, i32)> {
        if tile.len() < 7 {
            return Err(ViewshedError::CorruptTile(format!("invalid tile name: {}", tile)));
        }
        let lat: i32 = tile[1..3]
            .parse()
            .map_err(|_| ViewshedError::CorruptTile(format!("invalid latitude in tile name: {}", tile)))?;
        let lon: i32 = tile[4..7]
            .parse()
            .map_err(|_| ViewshedError::CorruptTile(format!("invalid longitude in tile name: {}", tile)))?;
        let lat = if tile.starts_with('S') { -lat } else { lat };
        let lon = if &tile[3..4] == "W" { -lon } else { lon };
        Ok((lat, lon))
    }

    fn tile_path(&self, tile: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.hgt", tile))
    }

    /// Skadi directory layout groups tiles by latitude band ("N50/N50E012").
    fn skadi_directory(tile: &str) -> &str {
        &tile[0..3]
    }

    /// Candidate download URLs in order of preference.
    fn tile_urls(tile: &str) -> Vec<String> {
        vec![
            format!(
                "https://s3.amazonaws.com/elevation-tiles-prod/skadi/{}/{}.hgt.gz",
                Self::skadi_directory(tile),
                tile
            ),
            format!(
                "https://e4ftl01.cr.usgs.gov/MEASURES/SRTMGL1.003/2000.02.11/{}.SRTMGL1.hgt.zip",
                tile
            ),
        ]
    }

    fn is_gzip(content: &[u8]) -> bool {
        content.len() >= 2 && content[0] == 0x1F && content[1] == 0x8B
    }

    fn is_zip(content: &[u8]) -> bool {
        content.len() >= 4 && content[0..4] == [0x50, 0x4B, 0x03, 0x04]
    }

    /// Download a tile, trying each source with bounded retries. Returns
    /// false when every source reported not-found (open-water tile).
    fn download_tile(&self, tile: &str) -> ViewshedResult<bool> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .user_agent("rangeshed/0.1 (viewshed tool)")
            .build()
            .map_err(|e| ViewshedError::Network(format!("failed to create HTTP client: {}", e)))?;

        let output_path = self.tile_path(tile);
        let mut all_not_found = true;

        for (i, url) in Self::tile_urls(tile).iter().enumerate() {
            log::debug!("downloading tile {} from source {}: {}", tile, i + 1, url);

            let max_retries = 3;
            for attempt in 1..=max_retries {
                match self.try_download_once(&client, url, &output_path) {
                    Ok(()) => {
                        log::info!("downloaded DEM tile {}", tile);
                        return Ok(true);
                    }
                    Err(ViewshedError::TileUnavailable(_)) => {
                        // Not-found is definitive for this source, move on.
                        break;
                    }
                    Err(ViewshedError::NotAuthenticated(msg)) => {
                        log::warn!("source {} requires authentication: {}", i + 1, msg);
                        all_not_found = false;
                        break;
                    }
                    Err(e) => {
                        all_not_found = false;
                        if attempt < max_retries {
                            log::warn!(
                                "download attempt {} for {} failed ({}), retrying",
                                attempt, tile, e
                            );
                            std::thread::sleep(std::time::Duration::from_secs(2));
                        } else {
                            log::warn!("source {} failed for {}: {}", i + 1, tile, e);
                        }
                    }
                }
            }
        }

        if all_not_found {
            // SRTM has no tiles over open water; missing everywhere means sea.
            log::debug!("tile {} not present at any source, treating as open water", tile);
            Ok(false)
        } else {
            Err(ViewshedError::Network(format!(
                "failed to download DEM tile {} from all sources",
                tile
            )))
        }
    }

    fn try_download_once(
        &self,
        client: &reqwest::blocking::Client,
        url: &str,
        output_path: &Path,
    ) -> ViewshedResult<()> {
        let response = client
            .get(url)
            .send()
            .map_err(|e| ViewshedError::Network(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ViewshedError::NotAuthenticated(format!("HTTP {} from {}", status, url)));
        }
        if status.as_u16() == 404 {
            return Err(ViewshedError::TileUnavailable(format!("HTTP 404 from {}", url)));
        }
        if !status.is_success() {
            return Err(ViewshedError::Network(format!("HTTP {} from {}", status, url)));
        }

        let content = response
            .bytes()
            .map_err(|e| ViewshedError::Network(format!("failed to read response body: {}", e)))?;

        // Anything below a few KB is an error page, not elevation data.
        if content.len() < 1024 {
            return Err(ViewshedError::CorruptTile(format!(
                "downloaded file too small ({} bytes) from {}",
                content.len(),
                url
            )));
        }

        let hgt = if Self::is_gzip(&content) {
            let mut decoder = flate2::read::GzDecoder::new(&content[..]);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| ViewshedError::CorruptTile(format!("gzip decode failed: {}", e)))?;
            decompressed
        } else if Self::is_zip(&content) {
            Self::extract_hgt_from_zip(&content)?
        } else {
            content.to_vec()
        };

        if hgt.is_empty() {
            return Err(ViewshedError::CorruptTile("decoded tile is empty".to_string()));
        }

        // Atomic write: temp file then rename, same discipline as the cache.
        let tmp_path = output_path.with_extension(format!("tmp.{:x}", std::process::id()));
        std::fs::write(&tmp_path, &hgt)?;
        std::fs::rename(&tmp_path, output_path)?;
        Ok(())
    }

    fn extract_hgt_from_zip(content: &[u8]) -> ViewshedResult<Vec<u8>> {
        let reader = std::io::Cursor::new(content);
        let mut archive = zip::ZipArchive::new(reader)
            .map_err(|e| ViewshedError::CorruptTile(format!("failed to open ZIP archive: {}", e)))?;

        for i in 0..archive.len() {
            let mut file = archive
                .by_index(i)
                .map_err(|e| ViewshedError::CorruptTile(format!("failed to read ZIP entry: {}", e)))?;
            if file.name().to_lowercase().ends_with(".hgt") {
                let mut buffer = Vec::new();
                std::io::copy(&mut file, &mut buffer)?;
                return Ok(buffer);
            }
        }
        Err(ViewshedError::CorruptTile("no HGT file found in ZIP archive".to_string()))
    }

    /// Decode a raw HGT tile: square grid of big-endian 16-bit elevations,
    /// row-major from the north-west corner, void = -32768.
    fn read_hgt(path: &Path, tile: &str) -> ViewshedResult<GeoRaster> {
        let buffer = std::fs::read(path)?;
        if buffer.len() < 2 || buffer.len() % 2 != 0 {
            return Err(ViewshedError::CorruptTile(format!(
                "HGT file {} has odd size {} bytes",
                path.display(),
                buffer.len()
            )));
        }
        let samples = buffer.len() / 2;
        let side = (samples as f64).sqrt() as usize;
        if side * side != samples {
            return Err(ViewshedError::CorruptTile(format!(
                "HGT file {} is not square: {} samples",
                path.display(),
                samples
            )));
        }

        let mut data = Vec::with_capacity(samples);
        for i in 0..samples {
            let v = i16::from_be_bytes([buffer[2 * i], buffer[2 * i + 1]]);
            data.push(if v == HGT_VOID { f32::NAN } else { v as f32 });
        }
        let grid = Array2::from_shape_vec((side, side), data)
            .map_err(|e| ViewshedError::Processing(format!("failed to shape HGT data: {}", e)))?;

        let (lat, lon) = Self::parse_tile_name(tile)?;
        // Tiles span exactly one degree; edge rows/columns overlap neighbours.
        let pixel_size = 1.0 / (side - 1).max(1) as f64;
        let transform = GeoTransform {
            top_left_x: lon as f64 - pixel_size / 2.0,
            pixel_width: pixel_size,
            rotation_x: 0.0,
            top_left_y: (lat + 1) as f64 + pixel_size / 2.0,
            rotation_y: 0.0,
            pixel_height: -pixel_size,
        };
        Ok(GeoRaster { data: grid, transform })
    }

    /// Load a tile into the in-memory map, decoding it on first use.
    /// Returns None for open-water tiles.
    fn load_tile(&self, tile: &str) -> ViewshedResult<Option<()>> {
        if self.tiles.lock().unwrap().contains_key(tile) {
            return Ok(Some(()));
        }
        if self.states.lock().unwrap().get(tile) == Some(&TileState::Absent) {
            return Ok(None);
        }
        let path = self.tile_path(tile);
        if !path.exists() {
            return Ok(None);
        }
        match Self::read_hgt(&path, tile) {
            Ok(raster) => {
                self.tiles.lock().unwrap().insert(tile.to_string(), raster);
                Ok(Some(()))
            }
            Err(e) => {
                // A corrupt cached tile is treated as absent and removed so
                // the next ensure_coverage re-downloads it.
                log::warn!("corrupt cached tile {}: {}; removing", tile, e);
                let _ = std::fs::remove_file(&path);
                Ok(None)
            }
        }
    }

    fn sample_from_tiles(&self, lon: f64, lat: f64) -> f32 {
        let tile = Self::tile_name(lat.floor() as i32, lon.floor() as i32);
        if self.load_tile(&tile).ok().flatten().is_none() {
            return f32::NAN;
        }
        let tiles = self.tiles.lock().unwrap();
        match tiles.get(&tile) {
            Some(raster) => raster.sample_bilinear(lon, lat) + self.vertical_offset_m as f32,
            None => f32::NAN,
        }
    }
}

impl DemProvider for SrtmDemProvider {
    fn ensure_coverage(&self, bbox: &BoundingBox) -> ViewshedResult<()> {
        let tiles = Self::tiles_for_bbox(bbox);
        let cached = tiles.iter().filter(|t| self.tile_path(t).exists()).count();
        log::info!(
            "DEM coverage for {:?}: {} tile(s) required, {} cached",
            bbox,
            tiles.len(),
            cached
        );

        for tile in &tiles {
            if self.tile_path(tile).exists() {
                continue;
            }
            if self.states.lock().unwrap().get(tile.as_str()) == Some(&TileState::Absent) {
                continue;
            }
            if self.offline {
                return Err(ViewshedError::TileUnavailable(format!(
                    "tile {} not cached and provider is offline",
                    tile
                )));
            }
            let state = if self.download_tile(tile)? { TileState::Cached } else { TileState::Absent };
            self.states.lock().unwrap().insert(tile.clone(), state);
        }
        Ok(())
    }

    fn sample_bbox(&self, bbox: &BoundingBox, resolution_m: f64) -> ViewshedResult<GeoRaster> {
        if resolution_m <= 0.0 {
            return Err(ViewshedError::InvalidInput(format!(
                "sample_bbox needs a positive resolution, got {}",
                resolution_m
            )));
        }
        let mid_lat = (bbox.min_lat + bbox.max_lat) / 2.0;
        let dlat = resolution_m / METERS_PER_DEGREE;
        let dlon = resolution_m / (METERS_PER_DEGREE * mid_lat.to_radians().cos().max(0.1));

        let width = (((bbox.max_lon - bbox.min_lon) / dlon).ceil() as usize).max(2);
        let height = (((bbox.max_lat - bbox.min_lat) / dlat).ceil() as usize).max(2);
        let transform = GeoTransform {
            top_left_x: bbox.min_lon,
            pixel_width: dlon,
            rotation_x: 0.0,
            top_left_y: bbox.max_lat,
            rotation_y: 0.0,
            pixel_height: -dlat,
        };

        log::debug!(
            "sampling DEM mosaic: {}x{} at {} m ({:.5}° lon, {:.5}° lat per pixel)",
            width, height, resolution_m, dlon, dlat
        );

        let mut data = Array2::from_elem((height, width), f32::NAN);
        for row in 0..height {
            for col in 0..width {
                let (lon, lat) = transform.pixel_to_xy(col as f64, row as f64);
                data[[row, col]] = self.sample_from_tiles(lon, lat);
            }
        }
        Ok(GeoRaster { data, transform })
    }

    fn sample_point(&self, lat: f64, lon: f64) -> ViewshedResult<f32> {
        Ok(self.sample_from_tiles(lon, lat))
    }

    fn vertical_datum(&self) -> &str {
        &self.vertical_datum
    }
}

/// Provider backed by a single in-memory raster. Used by tests and by
/// callers that already hold elevation data.
pub struct InMemoryDemProvider {
    raster: GeoRaster,
    vertical_datum: String,
}

impl InMemoryDemProvider {
    pub fn new(raster: GeoRaster) -> Self {
        Self { raster, vertical_datum: "EGM96".to_string() }
    }

    /// Constant-elevation terrain over a bounding box.
    pub fn flat(bbox: BoundingBox, elevation_m: f32, pixels_per_degree: usize) -> Self {
        let width =
            (((bbox.max_lon - bbox.min_lon) * pixels_per_degree as f64).ceil() as usize).max(2);
        let height =
            (((bbox.max_lat - bbox.min_lat) * pixels_per_degree as f64).ceil() as usize).max(2);
        let data = Array2::from_elem((height, width), elevation_m);
        let transform = GeoTransform {
            top_left_x: bbox.min_lon,
            pixel_width: (bbox.max_lon - bbox.min_lon) / width as f64,
            rotation_x: 0.0,
            top_left_y: bbox.max_lat,
            rotation_y: 0.0,
            pixel_height: -(bbox.max_lat - bbox.min_lat) / height as f64,
        };
        Self::new(GeoRaster { data, transform })
    }

    pub fn raster_mut(&mut self) -> &mut GeoRaster {
        &mut self.raster
    }
}

impl DemProvider for InMemoryDemProvider {
    fn ensure_coverage(&self, _bbox: &BoundingBox) -> ViewshedResult<()> {
        Ok(())
    }

    fn sample_bbox(&self, bbox: &BoundingBox, resolution_m: f64) -> ViewshedResult<GeoRaster> {
        let mid_lat = (bbox.min_lat + bbox.max_lat) / 2.0;
        let dlat = resolution_m / METERS_PER_DEGREE;
        let dlon = resolution_m / (METERS_PER_DEGREE * mid_lat.to_radians().cos().max(0.1));
        let width = (((bbox.max_lon - bbox.min_lon) / dlon).ceil() as usize).max(2);
        let height = (((bbox.max_lat - bbox.min_lat) / dlat).ceil() as usize).max(2);
        let transform = GeoTransform {
            top_left_x: bbox.min_lon,
            pixel_width: dlon,
            rotation_x: 0.0,
            top_left_y: bbox.max_lat,
            rotation_y: 0.0,
            pixel_height: -dlat,
        };
        let mut data = Array2::from_elem((height, width), f32::NAN);
        for row in 0..height {
            for col in 0..width {
                let (lon, lat) = transform.pixel_to_xy(col as f64, row as f64);
                data[[row, col]] = self.raster.sample_bilinear(lon, lat);
            }
        }
        Ok(GeoRaster { data, transform })
    }

    fn sample_point(&self, lat: f64, lon: f64) -> ViewshedResult<f32> {
        Ok(self.raster.sample_bilinear(lon, lat))
    }

    fn vertical_datum(&self) -> &str {
        &self.vertical_datum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_naming() {
        assert_eq!(SrtmDemProvider::tile_name(50, 12), "N50E012");
        assert_eq!(SrtmDemProvider::tile_name(-23, -45), "S23W045");
        assert_eq!(SrtmDemProvider::tile_name(0, 0), "N00E000");
    }

    #[test]
    fn test_tile_name_roundtrip() {
        for (lat, lon) in [(50, 12), (-23, -45), (0, -1), (-1, 179)] {
            let name = SrtmDemProvider::tile_name(lat, lon);
            assert_eq!(SrtmDemProvider::parse_tile_name(&name).unwrap(), (lat, lon));
        }
    }

    #[test]
    fn test_tiles_for_bbox_spans_boundaries() {
        let bbox = BoundingBox { min_lon: 11.7, max_lon: 12.3, min_lat: 49.8, max_lat: 50.2 };
        let tiles = SrtmDemProvider::tiles_for_bbox(&bbox);
        assert_eq!(tiles.len(), 4);
        assert!(tiles.contains(&"N49E011".to_string()));
        assert!(tiles.contains(&"N50E012".to_string()));
    }

    #[test]
    fn test_skadi_directory_is_latitude_band() {
        assert_eq!(SrtmDemProvider::skadi_directory("N50E012"), "N50");
        assert_eq!(SrtmDemProvider::skadi_directory("S01W072"), "S01");
    }

    #[test]
    fn test_magic_byte_sniffing() {
        assert!(SrtmDemProvider::is_gzip(&[0x1F, 0x8B, 0x08, 0x00]));
        assert!(!SrtmDemProvider::is_gzip(&[0x50, 0x4B, 0x03, 0x04]));
        assert!(SrtmDemProvider::is_zip(&[0x50, 0x4B, 0x03, 0x04]));
    }

    #[test]
    fn test_read_hgt_decodes_voids_and_georeference() {
        let dir = tempfile::tempdir().unwrap();
        // 3x3 synthetic tile: row-major from the NW corner, one void.
        let values: [i16; 9] = [100, 110, 120, 130, HGT_VOID, 150, 160, 170, 180];
        let mut bytes = Vec::new();
        for v in values {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        let path = dir.path().join("N50E012.hgt");
        std::fs::write(&path, &bytes).unwrap();

        let raster = SrtmDemProvider::read_hgt(&path, "N50E012").unwrap();
        assert_eq!(raster.data.dim(), (3, 3));
        assert_eq!(raster.data[[0, 0]], 100.0);
        assert!(raster.data[[1, 1]].is_nan());
        // NW sample sits exactly at (12.0, 51.0).
        let (lon, lat) = raster.transform.pixel_to_xy(0.0, 0.0);
        assert!((lon - 12.0).abs() < 1e-9);
        assert!((lat - 51.0).abs() < 1e-9);
    }

    #[test]
    fn test_read_hgt_rejects_non_square() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("N50E012.hgt");
        std::fs::write(&path, [0u8; 10]).unwrap();
        assert!(matches!(
            SrtmDemProvider::read_hgt(&path, "N50E012"),
            Err(ViewshedError::CorruptTile(_))
        ));
    }

    #[test]
    fn test_offline_provider_errors_on_missing_tile() {
        let dir = tempfile::tempdir().unwrap();
        let provider = SrtmDemProvider::new(dir.path()).unwrap().with_offline(true);
        let bbox = BoundingBox { min_lon: 12.1, max_lon: 12.2, min_lat: 50.1, max_lat: 50.2 };
        assert!(matches!(
            provider.ensure_coverage(&bbox),
            Err(ViewshedError::TileUnavailable(_))
        ));
    }

    #[test]
    fn test_in_memory_flat_sampling() {
        let bbox = BoundingBox { min_lon: -1.0, max_lon: 1.0, min_lat: -1.0, max_lat: 1.0 };
        let provider = InMemoryDemProvider::flat(bbox, 250.0, 60);
        assert_eq!(provider.sample_point(0.0, 0.0).unwrap(), 250.0);
        let raster = provider.sample_bbox(&bbox, 1000.0).unwrap();
        let finite = raster.data.iter().filter(|v| !v.is_nan()).count();
        assert!(finite > raster.data.len() / 2);
    }

    #[test]
    fn test_approximate_bbox_widens_with_latitude() {
        let equator = approximate_bounding_box(0.0, 0.0, 100_000.0);
        let north = approximate_bounding_box(0.0, 60.0, 100_000.0);
        let eq_width = equator.max_lon - equator.min_lon;
        let north_width = north.max_lon - north.min_lon;
        assert!(north_width > eq_width * 1.5);
    }
}
