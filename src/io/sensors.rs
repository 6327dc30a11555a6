//! Sensor placemark loading from KML and CSV sources.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::path::Path;

use crate::types::{AltitudeMode, SensorRecord, ViewshedError, ViewshedResult};

/// Parse sensor placemarks from a KML document.
///
/// Every `<Placemark>` with a `<Point>` becomes a record, regardless of
/// folder nesting. The altitude mode is decoded from the document's
/// `<altitudeMode>`; the third coordinate component, when present, is kept
/// as the raw document altitude.
pub fn load_kml<P: AsRef<Path>>(path: P, default_height_m: f64) -> ViewshedResult<Vec<SensorRecord>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse_kml(&content, default_height_m)
}

pub fn parse_kml(content: &str, default_height_m: f64) -> ViewshedResult<Vec<SensorRecord>> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut records = Vec::new();
    let mut buf = Vec::new();

    let mut in_placemark = false;
    let mut in_point = false;
    let mut current_tag = String::new();
    let mut name: Option<String> = None;
    let mut altitude_mode = AltitudeMode::ClampToGround;
    let mut coordinates: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match tag.as_str() {
                    "Placemark" => {
                        in_placemark = true;
                        name = None;
                        altitude_mode = AltitudeMode::ClampToGround;
                        coordinates = None;
                    }
                    "Point" if in_placemark => in_point = true,
                    _ => {}
                }
                current_tag = tag;
            }
            Ok(Event::Text(t)) if in_placemark => {
                let text = t
                    .unescape()
                    .map_err(|e| ViewshedError::InvalidInput(format!("bad KML text: {}", e)))?
                    .to_string();
                match current_tag.as_str() {
                    "name" if name.is_none() => name = Some(text.trim().to_string()),
                    "altitudeMode" => altitude_mode = AltitudeMode::from_kml(&text),
                    "coordinates" if in_point => coordinates = Some(text),
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                let tag = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match tag.as_str() {
                    "Point" => in_point = false,
                    "Placemark" => {
                        in_placemark = false;
                        if let Some(coord_text) = coordinates.take() {
                            match parse_coordinates(&coord_text) {
                                Some((lon, lat, alt)) => records.push(SensorRecord {
                                    name: name.take().unwrap_or_else(|| "Unnamed".to_string()),
                                    latitude: lat,
                                    longitude: lon,
                                    height_hint_m: Some(default_height_m),
                                    altitude_mode,
                                    input_altitude_m: alt,
                                }),
                                None => log::warn!(
                                    "skipping placemark '{}': unparseable coordinates",
                                    name.as_deref().unwrap_or("Unnamed")
                                ),
                            }
                        }
                    }
                    _ => {}
                }
                current_tag.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ViewshedError::InvalidInput(format!("KML parse error: {}", e)));
            }
            _ => {}
        }
        buf.clear();
    }

    log::info!("parsed {} sensor placemark(s) from KML", records.len());
    Ok(records)
}

/// Split a KML coordinate tuple "lon,lat[,alt]".
fn parse_coordinates(text: &str) -> Option<(f64, f64, Option<f64>)> {
    // A Point has a single tuple; take the first whitespace-separated token.
    let tuple = text.split_whitespace().next()?;
    let mut parts = tuple.split(',');
    let lon: f64 = parts.next()?.trim().parse().ok()?;
    let lat: f64 = parts.next()?.trim().parse().ok()?;
    let alt = parts.next().and_then(|p| p.trim().parse().ok());
    Some((lon, lat, alt))
}

/// Parse sensor sites from a CSV file.
///
/// Required columns (case-insensitive): Name, Latitude, Longitude; `lat` and
/// `lon` are accepted as aliases. An optional Height_AGL column overrides the
/// default mast height. Invalid rows are skipped with a warning.
pub fn load_csv<P: AsRef<Path>>(path: P, default_height_m: f64) -> ViewshedResult<Vec<SensorRecord>> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse_csv(&content, default_height_m)
}

pub fn parse_csv(content: &str, default_height_m: f64) -> ViewshedResult<Vec<SensorRecord>> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let mut lines = content.lines();

    let header = lines
        .next()
        .ok_or_else(|| ViewshedError::InvalidInput("CSV file is empty".to_string()))?;
    let columns: Vec<String> = header.split(',').map(|h| h.trim().to_lowercase()).collect();

    let find = |names: &[&str]| -> Option<usize> {
        names.iter().find_map(|n| columns.iter().position(|c| c == n))
    };
    let name_idx = find(&["name"]);
    let lat_idx = find(&["latitude", "lat"]);
    let lon_idx = find(&["longitude", "lon"]);
    let height_idx = find(&["height_agl"]);

    let (name_idx, lat_idx, lon_idx) = match (name_idx, lat_idx, lon_idx) {
        (Some(n), Some(la), Some(lo)) => (n, la, lo),
        _ => {
            return Err(ViewshedError::InvalidInput(
                "CSV is missing required columns (Name, Latitude, Longitude)".to_string(),
            ))
        }
    };

    let mut records = Vec::new();
    for (line_no, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
        let parsed = (|| -> Option<SensorRecord> {
            let name = fields.get(name_idx)?.to_string();
            let lat: f64 = fields.get(lat_idx)?.parse().ok()?;
            let lon: f64 = fields.get(lon_idx)?.parse().ok()?;
            let height = height_idx
                .and_then(|i| fields.get(i))
                .and_then(|f| f.parse::<f64>().ok())
                .unwrap_or(default_height_m);
            Some(SensorRecord {
                name,
                latitude: lat,
                longitude: lon,
                height_hint_m: Some(height),
                altitude_mode: AltitudeMode::ClampToGround,
                input_altitude_m: Some(0.0),
            })
        })();
        match parsed {
            Some(r) => records.push(r),
            None => log::warn!("skipping invalid CSV row {}", line_no + 2),
        }
    }

    log::info!("parsed {} sensor site(s) from CSV", records.len());
    Ok(records)
}
