//! KML output sink.
//!
//! Each output is a self-contained document: sensor placemark, coverage
//! polygons with interior rings, and an ExtendedData block carrying the
//! output fingerprint plus the parameters that produced it. The fingerprint
//! is written atomically with the polygons so the Tier-2 cache stays
//! coherent.

use geo::MultiPolygon;
use std::path::Path;

use crate::config::StyleConfig;
use crate::types::ViewshedResult;

/// Convert "#RRGGBB" + opacity to the KML aabbggrr byte order.
pub fn to_kml_color(hex: &str, opacity: f64) -> String {
    let hex = hex.trim_start_matches('#');
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return "ff0000ff".to_string();
    }
    let rr = &hex[0..2];
    let gg = &hex[2..4];
    let bb = &hex[4..6];
    let aa = (opacity.clamp(0.0, 1.0) * 255.0).round() as u8;
    format!("{:02x}{}{}{}", aa, bb, gg, rr).to_lowercase()
}

/// Escape the five XML special characters.
pub fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Key/value pair carried into the output's ExtendedData block
#[derive(Debug, Clone)]
pub struct OutputMetadata {
    pub entries: Vec<(String, String)>,
    /// Tier-2 content hash of everything that influenced this artifact
    pub fingerprint: String,
}

fn ring_coords(ring: &geo::LineString<f64>, altitude: f64) -> String {
    ring.coords()
        .map(|c| format!("{:.7},{:.7},{}", c.x, c.y, altitude))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Serialise a polygon set to KML placemark geometry.
fn polygons_to_kml(polygons: &MultiPolygon<f64>, altitude: f64) -> String {
    let mut body = String::new();
    for poly in &polygons.0 {
        if poly.exterior().0.is_empty() {
            continue;
        }
        body.push_str("        <Polygon>\n");
        body.push_str("          <altitudeMode>absolute</altitudeMode>\n");
        body.push_str("          <outerBoundaryIs><LinearRing><coordinates>\n");
        body.push_str(&ring_coords(poly.exterior(), altitude));
        body.push_str("\n          </coordinates></LinearRing></outerBoundaryIs>\n");
        for interior in poly.interiors() {
            body.push_str("          <innerBoundaryIs><LinearRing><coordinates>\n");
            body.push_str(&ring_coords(interior, altitude));
            body.push_str("\n          </coordinates></LinearRing></innerBoundaryIs>\n");
        }
        body.push_str("        </Polygon>\n");
    }
    body
}

/// Write a viewshed (or union) polygon set to a KML file.
///
/// `sensor_location` places a marker placemark when given. The write is
/// atomic: content goes to a temp file which is renamed over the target.
pub fn write_viewshed_kml(
    path: &Path,
    polygons: &MultiPolygon<f64>,
    sensor_location: Option<(f64, f64)>,
    document_name: &str,
    altitude: f64,
    style: &StyleConfig,
    metadata: &OutputMetadata,
) -> ViewshedResult<()> {
    let line_kml = to_kml_color(&style.line_color, 1.0);
    let (fill_flag, fill_kml) = match (&style.fill_color, style.fill_opacity) {
        (Some(color), opacity) if opacity > 0.0 => ("1", to_kml_color(color, opacity)),
        _ => ("0", "00000000".to_string()),
    };

    let mut kml = String::new();
    kml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    kml.push_str("<kml xmlns=\"http://www.opengis.net/kml/2.2\">\n");
    kml.push_str("  <Document>\n");
    kml.push_str(&format!("    <name>{}</name>\n", xml_escape(document_name)));

    kml.push_str("    <ExtendedData>\n");
    kml.push_str(&format!(
        "      <Data name=\"output_fingerprint\"><value>{}</value></Data>\n",
        xml_escape(&metadata.fingerprint)
    ));
    for (key, value) in &metadata.entries {
        kml.push_str(&format!(
            "      <Data name=\"{}\"><value>{}</value></Data>\n",
            xml_escape(key),
            xml_escape(value)
        ));
    }
    kml.push_str("    </ExtendedData>\n");

    kml.push_str("    <Style id=\"polyStyle\">\n");
    kml.push_str("      <LineStyle>\n");
    kml.push_str(&format!("        <color>{}</color>\n", line_kml));
    kml.push_str(&format!("        <width>{}</width>\n", style.line_width));
    kml.push_str("      </LineStyle>\n");
    kml.push_str("      <PolyStyle>\n");
    kml.push_str(&format!("        <color>{}</color>\n", fill_kml));
    kml.push_str(&format!("        <fill>{}</fill>\n", fill_flag));
    kml.push_str("      </PolyStyle>\n");
    kml.push_str("    </Style>\n");

    if let Some((lon, lat)) = sensor_location {
        kml.push_str("    <Placemark>\n");
        kml.push_str(&format!("      <name>{} Location</name>\n", xml_escape(document_name)));
        kml.push_str("      <Point>\n");
        kml.push_str(&format!("        <coordinates>{},{},0</coordinates>\n", lon, lat));
        kml.push_str("      </Point>\n");
        kml.push_str("    </Placemark>\n");
    }

    kml.push_str("    <Placemark>\n");
    kml.push_str(&format!("      <name>Coverage @ {}m</name>\n", altitude));
    kml.push_str("      <styleUrl>#polyStyle</styleUrl>\n");
    kml.push_str("      <MultiGeometry>\n");
    kml.push_str(&polygons_to_kml(polygons, altitude));
    kml.push_str("      </MultiGeometry>\n");
    kml.push_str("    </Placemark>\n");
    kml.push_str("  </Document>\n");
    kml.push_str("</kml>\n");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp.{:x}", std::process::id()));
    std::fs::write(&tmp, kml.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    log::info!("wrote {}", path.display());
    Ok(())
}

/// Read back the fingerprint embedded in an existing output, if any.
pub fn read_embedded_fingerprint(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let marker = "<Data name=\"output_fingerprint\"><value>";
    let start = content.find(marker)? + marker.len();
    let end = content[start..].find("</value>")? + start;
    let fp = content[start..end].trim();
    if fp.is_empty() {
        None
    } else {
        Some(fp.to_string())
    }
}

/// Build an output filename following the documented pattern:
/// `[NN_]<tool>-<sensor|union>-<key=value>-...<ext>`.
pub fn output_filename(
    sequence: Option<u32>,
    tool: &str,
    subject: &str,
    tags: &[String],
    extension: &str,
) -> String {
    let safe_subject: String = subject
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    let mut parts = vec![tool.to_string(), safe_subject];
    parts.extend(tags.iter().cloned());
    let stem = parts.join("-");
    match sequence {
        Some(n) => format!("{:02}_{}.{}", n, stem, extension),
        None => format!("{}.{}", stem, extension),
    }
}

/// Tag for a target altitude, e.g. `tgt_alt_100_MSL`.
pub fn tag_target_altitude(altitude_m: f64, reference: &str) -> String {
    format!("tgt_alt_{}_{}", altitude_m.round() as i64, reference)
}

/// Tag for a detection range in kilometers, e.g. `det_rng_50`.
pub fn tag_detection_range(range_km: f64) -> String {
    format!("det_rng_{}", range_km.round() as i64)
}

/// Tag for a non-default sensor height, e.g. `sh_12`.
pub fn tag_sensor_height(height_m: f64) -> String {
    format!("sh_{}", height_m.round() as i64)
}
