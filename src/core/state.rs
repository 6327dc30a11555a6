//! Tier-2 output state cache.
//!
//! Every emitted artifact embeds a hash of all parameters that influenced
//! it. Before writing, the would-be hash is compared against the one in the
//! existing file; a match means the write can be skipped. Missing or
//! unreadable hashes simply trigger a normal rewrite, so this tier can
//! never affect correctness.

use sha2::{Digest, Sha256};
use std::path::Path;

use crate::config::StyleConfig;
use crate::io::kml::read_embedded_fingerprint;

/// Bump when the output format changes so stale artifacts regenerate.
pub const OUTPUT_SCHEMA_VERSION: u16 = 1;

/// Hash of the style fields that alter an output's appearance.
pub fn style_fingerprint(style: &StyleConfig) -> String {
    let input = format!(
        "line_color={}|line_width={}|fill_color={}|fill_opacity={:.3}",
        style.line_color,
        style.line_width,
        style.fill_color.as_deref().unwrap_or("none"),
        style.fill_opacity
    );
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Content hash of everything that influences one output artifact.
///
/// `sensor_fingerprint` is the Tier-1 key of the outermost zone for a
/// single-sensor output, or the concatenated sensor keys for a union.
pub fn output_fingerprint(
    sensor_fingerprint: &str,
    target_altitude_m: f64,
    max_range_m: f64,
    style: &StyleConfig,
) -> String {
    let input = format!(
        "v={}|sensor={}|tgt_alt={:.2}|max_range={:.0}|style={}",
        OUTPUT_SCHEMA_VERSION,
        sensor_fingerprint,
        target_altitude_m,
        max_range_m,
        style_fingerprint(style)
    );
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Decide whether an output with this fingerprint needs to be (re)written.
///
/// Returns false only when the existing file carries the identical
/// fingerprint.
pub fn should_write(path: &Path, fingerprint: &str) -> bool {
    if !path.exists() {
        return true;
    }
    match read_embedded_fingerprint(path) {
        Some(existing) if existing == fingerprint => {
            log::info!("output {} is current, skipping", path.display());
            false
        }
        Some(_) => {
            log::debug!("output {} is stale, regenerating", path.display());
            true
        }
        None => {
            log::debug!("output {} has no fingerprint, regenerating", path.display());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StyleConfig;
    use crate::io::kml::{write_viewshed_kml, OutputMetadata};
    use geo::{polygon, MultiPolygon};

    fn style() -> StyleConfig {
        StyleConfig::default()
    }

    #[test]
    fn test_fingerprint_changes_with_each_input() {
        let base = output_fingerprint("fp1", 100.0, 50_000.0, &style());
        assert_ne!(base, output_fingerprint("fp2", 100.0, 50_000.0, &style()));
        assert_ne!(base, output_fingerprint("fp1", 200.0, 50_000.0, &style()));
        assert_ne!(base, output_fingerprint("fp1", 100.0, 60_000.0, &style()));
        let restyled = StyleConfig { fill_color: Some("#00FF00".to_string()), ..style() };
        assert_ne!(base, output_fingerprint("fp1", 100.0, 50_000.0, &restyled));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(
            output_fingerprint("fp1", 100.0, 50_000.0, &style()),
            output_fingerprint("fp1", 100.0, 50_000.0, &style())
        );
    }

    #[test]
    fn test_should_write_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.kml");
        let fp = output_fingerprint("fp1", 100.0, 50_000.0, &style());

        // Missing file: write.
        assert!(should_write(&path, &fp));

        let polys = MultiPolygon(vec![polygon![
            (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0),
        ]]);
        write_viewshed_kml(
            &path,
            &polys,
            None,
            "test",
            100.0,
            &style(),
            &OutputMetadata { entries: vec![], fingerprint: fp.clone() },
        )
        .unwrap();

        // Identical parameters: skip.
        assert!(!should_write(&path, &fp));

        // A style change produces a different hash: rewrite.
        let restyled = StyleConfig { fill_color: Some("#00FF00".to_string()), ..style() };
        let fp2 = output_fingerprint("fp1", 100.0, 50_000.0, &restyled);
        assert!(should_write(&path, &fp2));
    }

    #[test]
    fn test_foreign_file_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.kml");
        std::fs::write(&path, "<kml/>").unwrap();
        assert!(should_write(&path, "anything"));
    }
}
