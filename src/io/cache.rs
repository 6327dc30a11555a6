//! Tier-1 viewshed cache.
//!
//! Content-addressed store of MVA rasters keyed by sensor-intrinsic
//! parameters only; target altitude and styling never enter the key, so one
//! artifact serves every altitude query. Each (sensor, zone) pair persists
//! as one gzip-compressed binary record plus a human-readable JSON sidecar.
//! Writers use temp-file + rename; readers treat anything unreadable as
//! absent.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array2;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::shutdown::sweep_temp_files;
use crate::types::{
    BoundaryHorizon, GeoTransform, MvaRaster, Sensor, ViewshedError, ViewshedResult, Zone,
    MVA_NEVER, N_BOUNDARY_AZ,
};

/// Bump to invalidate every existing artifact when the algorithm changes.
pub const CACHE_SCHEMA_VERSION: u16 = 1;

const ARTIFACT_MAGIC: &[u8; 4] = b"RSMV";
/// MVA quantisation: u16 with 0.5 m steps, NoData = 65535
const MVA_SCALE: f32 = 0.5;
const MVA_NODATA_U16: u16 = u16::MAX;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// SHA-256 fingerprint over everything that affects obstruction geometry for
/// one sensor-zone pair. Fixed decimal precisions keep the key stable across
/// float jitter.
pub fn zone_fingerprint(sensor: &Sensor, zone: &Zone, earth_model: &str) -> String {
    let input = format!(
        "version={}|lat={:.6}|lon={:.6}|ground_elev={:.1}|sensor_h_agl={:.2}|\
         k_factor={:.4}|z_min={}|z_max={}|z_res={}|earth_model={}",
        CACHE_SCHEMA_VERSION,
        sensor.latitude,
        sensor.longitude,
        sensor.ground_elev_msl_m,
        sensor.effective_height_msl() - sensor.ground_elev_msl_m,
        sensor.refraction_k,
        zone.r_min_m.round() as i64,
        zone.r_max_m.round() as i64,
        zone.pixel_size_m.round() as i64,
        earth_model,
    );
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn quantize(v: f32) -> u16 {
    if !v.is_finite() {
        return MVA_NODATA_U16;
    }
    let q = (v.max(0.0) / MVA_SCALE).round();
    if q >= MVA_NODATA_U16 as f32 {
        MVA_NODATA_U16 - 1
    } else {
        q as u16
    }
}

fn dequantize(q: u16) -> f32 {
    if q == MVA_NODATA_U16 {
        MVA_NEVER
    } else {
        q as f32 * MVA_SCALE
    }
}

/// One cached sensor-zone computation
#[derive(Debug, Clone)]
pub struct CachedZone {
    pub mva: MvaRaster,
    pub outer_radius_m: f64,
    pub boundary: BoundaryHorizon,
}

/// Sidecar metadata written next to every artifact
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct CacheSidecar {
    pub schema_version: u16,
    pub created_utc: chrono::DateTime<chrono::Utc>,
    pub sensor_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub ground_elev_msl_m: f64,
    pub refraction_k: f64,
    pub zone_index: usize,
    pub zone_r_min_m: f64,
    pub zone_r_max_m: f64,
    pub zone_pixel_size_m: f64,
    pub outer_radius_m: f64,
    pub earth_model: String,
    pub dem_vertical_datum: String,
}

pub struct ViewshedCache {
    dir: PathBuf,
}

impl ViewshedCache {
    /// Open (and create) the cache directory, sweeping stale temp files.
    pub fn open<P: AsRef<Path>>(dir: P) -> ViewshedResult<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        sweep_temp_files(dir.as_ref());
        log::debug!("viewshed cache at {}", dir.as_ref().display());
        Ok(Self { dir: dir.as_ref().to_path_buf() })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn artifact_path(&self, fingerprint: &str, zone_index: usize) -> PathBuf {
        self.dir.join(format!("{}_{}.mva.gz", fingerprint, zone_index))
    }

    fn sidecar_path(&self, fingerprint: &str, zone_index: usize) -> PathBuf {
        self.dir.join(format!("{}_{}.json", fingerprint, zone_index))
    }

    /// Fetch a cached zone. Corrupt or stale artifacts are removed and
    /// reported as a miss.
    pub fn lookup(&self, fingerprint: &str, zone_index: usize) -> Option<CachedZone> {
        let path = self.artifact_path(fingerprint, zone_index);
        if !path.exists() {
            return None;
        }
        match Self::read_artifact(&path) {
            Ok(entry) => {
                log::debug!("cache HIT {}_{}", &fingerprint[..12.min(fingerprint.len())], zone_index);
                Some(entry)
            }
            Err(e) => {
                log::warn!("discarding unreadable cache artifact {}: {}", path.display(), e);
                let _ = std::fs::remove_file(&path);
                let _ = std::fs::remove_file(self.sidecar_path(fingerprint, zone_index));
                None
            }
        }
    }

    /// Persist a zone computation atomically. An existing entry is replaced
    /// only when the new outer radius is at least as large.
    pub fn store(
        &self,
        fingerprint: &str,
        zone_index: usize,
        entry: &CachedZone,
        sidecar: &CacheSidecar,
    ) -> ViewshedResult<()> {
        let path = self.artifact_path(fingerprint, zone_index);
        if let Some(existing) = self.lookup(fingerprint, zone_index) {
            if existing.outer_radius_m > entry.outer_radius_m {
                log::debug!(
                    "keeping cached artifact with larger radius ({:.0} m > {:.0} m)",
                    existing.outer_radius_m, entry.outer_radius_m
                );
                return Ok(());
            }
        }

        let payload = Self::encode_artifact(entry)?;
        let suffix = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp = self.dir.join(format!(
            "{}_{}.tmp.{:x}-{:x}",
            fingerprint, zone_index, std::process::id(), suffix
        ));
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&payload)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;

        let sidecar_json = serde_json::to_string_pretty(sidecar)?;
        let tmp_sidecar = self.dir.join(format!(
            "{}_{}.tmp.{:x}-{:x}s",
            fingerprint, zone_index, std::process::id(), suffix
        ));
        std::fs::write(&tmp_sidecar, sidecar_json)?;
        std::fs::rename(&tmp_sidecar, self.sidecar_path(fingerprint, zone_index))?;

        log::debug!(
            "cache PUT {}_{} ({:.1} MB)",
            &fingerprint[..12.min(fingerprint.len())],
            zone_index,
            payload.len() as f64 / 1024.0 / 1024.0
        );
        Ok(())
    }

    /// Remove leftover partial writes.
    pub fn cleanup_temps(&self) -> usize {
        sweep_temp_files(&self.dir)
    }

    /// Number of artifacts currently stored.
    pub fn artifact_count(&self) -> usize {
        std::fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.file_name().to_string_lossy().ends_with(".mva.gz"))
                    .count()
            })
            .unwrap_or(0)
    }

    fn encode_artifact(entry: &CachedZone) -> ViewshedResult<Vec<u8>> {
        let (height, width) = entry.mva.data.dim();
        let mut raw = Vec::with_capacity(64 + entry.mva.crs.len() + N_BOUNDARY_AZ * 4 + width * height * 2);

        raw.extend_from_slice(ARTIFACT_MAGIC);
        raw.extend_from_slice(&CACHE_SCHEMA_VERSION.to_le_bytes());
        raw.push(entry.boundary.valid as u8);
        raw.extend_from_slice(&(width as u32).to_le_bytes());
        raw.extend_from_slice(&(height as u32).to_le_bytes());
        for v in entry.mva.transform.as_array() {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        raw.extend_from_slice(&entry.outer_radius_m.to_le_bytes());
        raw.extend_from_slice(&(entry.mva.crs.len() as u32).to_le_bytes());
        raw.extend_from_slice(entry.mva.crs.as_bytes());

        if entry.boundary.angles.len() != N_BOUNDARY_AZ {
            return Err(ViewshedError::Processing(format!(
                "boundary horizon has {} bins, expected {}",
                entry.boundary.angles.len(),
                N_BOUNDARY_AZ
            )));
        }
        raw.extend_from_slice(&(N_BOUNDARY_AZ as u32).to_le_bytes());
        for a in &entry.boundary.angles {
            raw.extend_from_slice(&a.to_le_bytes());
        }
        for v in entry.mva.data.iter() {
            raw.extend_from_slice(&quantize(*v).to_le_bytes());
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&raw)?;
        Ok(encoder.finish()?)
    }

    fn read_artifact(path: &Path) -> ViewshedResult<CachedZone> {
        let compressed = std::fs::read(path)?;
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut raw = Vec::new();
        decoder
            .read_to_end(&mut raw)
            .map_err(|e| ViewshedError::CorruptArtifact(format!("gzip decode failed: {}", e)))?;

        let mut cursor = 0usize;
        let take = |cursor: &mut usize, n: usize| -> ViewshedResult<&[u8]> {
            if *cursor + n > raw.len() {
                return Err(ViewshedError::CorruptArtifact("artifact truncated".to_string()));
            }
            let slice = &raw[*cursor..*cursor + n];
            *cursor += n;
            Ok(slice)
        };

        if take(&mut cursor, 4)? != ARTIFACT_MAGIC {
            return Err(ViewshedError::CorruptArtifact("bad magic".to_string()));
        }
        let version = u16::from_le_bytes(take(&mut cursor, 2)?.try_into().unwrap());
        if version != CACHE_SCHEMA_VERSION {
            return Err(ViewshedError::CorruptArtifact(format!(
                "schema version {} does not match {}",
                version, CACHE_SCHEMA_VERSION
            )));
        }
        let boundary_valid = take(&mut cursor, 1)?[0] != 0;
        let width = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap()) as usize;
        let height = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap()) as usize;
        let mut affine = [0.0f64; 6];
        for a in affine.iter_mut() {
            *a = f64::from_le_bytes(take(&mut cursor, 8)?.try_into().unwrap());
        }
        let outer_radius_m = f64::from_le_bytes(take(&mut cursor, 8)?.try_into().unwrap());
        let crs_len = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap()) as usize;
        let crs = String::from_utf8(take(&mut cursor, crs_len)?.to_vec())
            .map_err(|_| ViewshedError::CorruptArtifact("CRS is not UTF-8".to_string()))?;

        let boundary_len = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap()) as usize;
        if boundary_len != N_BOUNDARY_AZ {
            return Err(ViewshedError::CorruptArtifact(format!(
                "boundary horizon has {} bins, expected {}",
                boundary_len, N_BOUNDARY_AZ
            )));
        }
        let mut angles = Vec::with_capacity(boundary_len);
        for _ in 0..boundary_len {
            angles.push(f32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap()));
        }

        let n_cells = width
            .checked_mul(height)
            .ok_or_else(|| ViewshedError::CorruptArtifact("raster dimensions overflow".to_string()))?;
        let mut values = Vec::with_capacity(n_cells);
        for _ in 0..n_cells {
            let q = u16::from_le_bytes(take(&mut cursor, 2)?.try_into().unwrap());
            values.push(dequantize(q));
        }
        if cursor != raw.len() {
            return Err(ViewshedError::CorruptArtifact("trailing bytes in artifact".to_string()));
        }

        let data = Array2::from_shape_vec((height, width), values)
            .map_err(|e| ViewshedError::CorruptArtifact(format!("bad raster shape: {}", e)))?;

        Ok(CachedZone {
            mva: MvaRaster { data, transform: GeoTransform::from_array(affine), crs },
            outer_radius_m,
            boundary: BoundaryHorizon { angles, valid: boundary_valid },
        })
    }
}
