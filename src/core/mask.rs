//! Coverage mask extraction.
//!
//! Thresholds MVA rasters at a target altitude, vectorises the boolean mask
//! into polygons with holes, stitches zones in polygon space, clips to the
//! horizon disc, simplifies, and transforms to WGS84 for emission.

use geo::{Area, BooleanOps, Contains, Coord, LineString, MultiPolygon, Point, Polygon, Simplify};
use ndarray::Array2;
use std::collections::HashMap;

use crate::geo::aeqd::AeqdProjector;
use crate::types::{GeoTransform, MvaRaster, ViewshedResult};

/// Visible cells at altitude `a` are exactly those with `mva <= a`.
pub fn threshold_mask(mva: &MvaRaster, altitude_msl: f64) -> Array2<bool> {
    mva.data.mapv(|v| v <= altitude_msl as f32)
}

/// Directed pixel-edge with the foreground on its left (raster frame,
/// row-down). Corner coordinates are lattice points (col, row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Corner {
    c: i64,
    r: i64,
}

/// Vectorise a 4-connected boolean mask into rings on the pixel-corner
/// lattice, then into polygons with holes in projected coordinates.
///
/// Directed boundary edges keep the foreground on the left; at saddle
/// corners the walk takes the sharpest left turn, which keeps diagonally
/// touching regions separate (4-connected foreground). With the north-up
/// transform (negative pixel height) exterior rings come out
/// counter-clockwise in projected space and holes clockwise.
pub fn polygonize(mask: &Array2<bool>, transform: &GeoTransform) -> MultiPolygon<f64> {
    let (height, width) = mask.dim();
    let at = |r: i64, c: i64| -> bool {
        r >= 0 && c >= 0 && (r as usize) < height && (c as usize) < width && mask[[r as usize, c as usize]]
    };

    // Outgoing directed edges indexed by start corner.
    let mut edges: HashMap<Corner, Vec<Corner>> = HashMap::new();
    let mut edge_count = 0usize;
    for r in 0..height as i64 {
        for c in 0..width as i64 {
            if !at(r, c) {
                continue;
            }
            if !at(r - 1, c) {
                // North edge, walking west.
                edges.entry(Corner { c: c + 1, r }).or_default().push(Corner { c, r });
                edge_count += 1;
            }
            if !at(r + 1, c) {
                // South edge, walking east.
                edges.entry(Corner { c, r: r + 1 }).or_default().push(Corner { c: c + 1, r: r + 1 });
                edge_count += 1;
            }
            if !at(r, c - 1) {
                // West edge, walking south.
                edges.entry(Corner { c, r }).or_default().push(Corner { c, r: r + 1 });
                edge_count += 1;
            }
            if !at(r, c + 1) {
                // East edge, walking north.
                edges.entry(Corner { c: c + 1, r: r + 1 }).or_default().push(Corner { c: c + 1, r });
                edge_count += 1;
            }
        }
    }
    if edge_count == 0 {
        return MultiPolygon(vec![]);
    }

    // Walk edges into closed rings, taking the sharpest left turn at
    // saddle corners.
    let mut rings: Vec<Vec<Corner>> = Vec::new();
    let mut starts: Vec<Corner> = edges.keys().copied().collect();
    starts.sort_by_key(|k| (k.r, k.c));

    for start in starts {
        loop {
            let first = match edges.get_mut(&start).and_then(|v| v.pop()) {
                Some(e) => e,
                None => break,
            };
            let mut ring = vec![start, first];
            let mut prev = start;
            let mut current = first;
            while current != start {
                let dir = (current.c - prev.c, current.r - prev.r);
                let next = {
                    let candidates = edges.get_mut(&current).expect("boundary edges form closed rings");
                    let pick = if candidates.len() == 1 {
                        0
                    } else {
                        // Left-most turn relative to the incoming direction.
                        let mut best = 0;
                        let mut best_rank = i8::MIN;
                        for (idx, cand) in candidates.iter().enumerate() {
                            let out = (cand.c - current.c, cand.r - current.r);
                            // Cross product in the row-down frame: positive
                            // cross means a left turn in projected space.
                            let cross = (dir.0 * out.1 - dir.1 * out.0) as i8;
                            let rank = -cross;
                            if rank > best_rank {
                                best_rank = rank;
                                best = idx;
                            }
                        }
                        best
                    };
                    candidates.swap_remove(pick)
                };
                ring.push(next);
                prev = current;
                current = next;
            }
            rings.push(ring);
        }
    }

    // Corner lattice -> projected coordinates, collapsing collinear runs.
    let to_xy = |corner: &Corner| -> Coord<f64> {
        Coord {
            x: transform.top_left_x + corner.c as f64 * transform.pixel_width,
            y: transform.top_left_y + corner.r as f64 * transform.pixel_height,
        }
    };
    let mut shells: Vec<LineString<f64>> = Vec::new();
    let mut holes: Vec<LineString<f64>> = Vec::new();
    for ring in rings {
        let mut coords: Vec<Coord<f64>> = Vec::with_capacity(ring.len());
        for (i, corner) in ring.iter().enumerate() {
            if i >= 1 && i + 1 < ring.len() {
                let a = &ring[i - 1];
                let b = &ring[i + 1];
                // Drop interior lattice points on straight runs.
                if (corner.c - a.c) == (b.c - corner.c) && (corner.r - a.r) == (b.r - corner.r) {
                    continue;
                }
            }
            coords.push(to_xy(corner));
        }
        if coords.len() < 4 {
            continue;
        }
        let ls = LineString(coords);
        if signed_area(&ls) >= 0.0 {
            shells.push(ls);
        } else {
            holes.push(ls);
        }
    }

    // Assign each hole to the smallest shell containing it.
    let mut shell_polys: Vec<(Polygon<f64>, Vec<LineString<f64>>)> = shells
        .into_iter()
        .map(|s| (Polygon::new(s, vec![]), Vec::new()))
        .collect();
    shell_polys.sort_by(|a, b| {
        a.0.unsigned_area().partial_cmp(&b.0.unsigned_area()).unwrap_or(std::cmp::Ordering::Equal)
    });
    for hole in holes {
        let probe = hole_probe_point(&hole, transform);
        if let Some((_, shell_holes)) =
            shell_polys.iter_mut().find(|(shell, _)| shell.contains(&probe))
        {
            shell_holes.push(hole);
        }
    }

    MultiPolygon(
        shell_polys
            .into_iter()
            .map(|(shell, hs)| Polygon::new(shell.into_inner().0, hs))
            .collect(),
    )
}

/// A point just inside a hole ring: the midpoint of its first segment,
/// nudged off the boundary toward the hole's interior.
fn hole_probe_point(hole: &LineString<f64>, transform: &GeoTransform) -> Point<f64> {
    let a = hole.0[0];
    let b = hole.0[1];
    let mx = (a.x + b.x) / 2.0;
    let my = (a.y + b.y) / 2.0;
    // Foreground is left of the directed ring, so the hole interior lies to
    // the right of travel.
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len = (dx * dx + dy * dy).sqrt().max(1e-12);
    let nudge = transform.pixel_width.abs() / 4.0;
    Point::new(mx + dy / len * nudge, my - dx / len * nudge)
}

fn signed_area(ring: &LineString<f64>) -> f64 {
    let coords = &ring.0;
    let mut sum = 0.0;
    for w in coords.windows(2) {
        sum += w[0].x * w[1].y - w[1].x * w[0].y;
    }
    let first = coords.first();
    let last = coords.last();
    if let (Some(f), Some(l)) = (first, last) {
        if f != l {
            sum += l.x * f.y - f.x * l.y;
        }
    }
    sum / 2.0
}

/// Disc of a given radius around the projection origin, used for the
/// horizon clip.
pub fn horizon_disc(radius_m: f64, segments: usize) -> Polygon<f64> {
    let mut coords = Vec::with_capacity(segments + 1);
    for i in 0..segments {
        let angle = 2.0 * std::f64::consts::PI * i as f64 / segments as f64;
        coords.push(Coord { x: radius_m * angle.sin(), y: radius_m * angle.cos() });
    }
    coords.push(coords[0]);
    Polygon::new(LineString(coords), vec![])
}

/// Coverage polygon extraction pipeline for one sensor.
pub struct MaskExtractor {
    pub simplify_tolerance_m: f64,
    pub min_area_m2: f64,
}

impl MaskExtractor {
    pub fn new(simplify_tolerance_m: f64, min_area_m2: f64) -> Self {
        Self { simplify_tolerance_m, min_area_m2 }
    }

    /// Threshold and vectorise one zone.
    pub fn zone_polygons(&self, mva: &MvaRaster, altitude_msl: f64) -> MultiPolygon<f64> {
        let mask = threshold_mask(mva, altitude_msl);
        polygonize(&mask, &mva.transform)
    }

    /// Full extraction: per-zone polygons, zone stitching, horizon clip,
    /// simplification, sliver removal, and projection to WGS84.
    ///
    /// Zone grids differ in resolution, so stitching happens in polygon
    /// space; the boundary mismatch is at most one coarse pixel.
    pub fn extract(
        &self,
        zones: &[&MvaRaster],
        altitude_msl: f64,
        horizon_radius_m: f64,
        projector: &AeqdProjector,
    ) -> ViewshedResult<MultiPolygon<f64>> {
        let mut stitched = MultiPolygon::<f64>(vec![]);
        for mva in zones {
            let polys = self.zone_polygons(mva, altitude_msl);
            if polys.0.is_empty() {
                continue;
            }
            stitched = if stitched.0.is_empty() { polys } else { stitched.union(&polys) };
        }
        if stitched.0.is_empty() {
            return Ok(MultiPolygon(vec![]));
        }

        let disc = MultiPolygon(vec![horizon_disc(horizon_radius_m, 360)]);
        let clipped = stitched.intersection(&disc);

        let simplified = clipped.simplify(&self.simplify_tolerance_m);

        // Drop slivers and degenerate rings left by simplification.
        let cleaned: Vec<Polygon<f64>> = simplified
            .0
            .into_iter()
            .filter(|p| p.exterior().0.len() >= 4 && p.unsigned_area() >= self.min_area_m2)
            .map(|p| {
                let (exterior, interiors) = p.into_inner();
                let kept: Vec<LineString<f64>> = interiors
                    .into_iter()
                    .filter(|ring| {
                        ring.0.len() >= 4
                            && Polygon::new(ring.clone(), vec![]).unsigned_area() >= self.min_area_m2
                    })
                    .collect();
                Polygon::new(exterior, kept)
            })
            .collect();

        // AEQD -> WGS84 vertex transform; geo coordinates become (lon, lat).
        let wgs84 = MultiPolygon(cleaned)
            .0
            .into_iter()
            .map(|p| {
                let map_ring = |ring: &LineString<f64>| -> LineString<f64> {
                    LineString(
                        ring.0
                            .iter()
                            .map(|c| {
                                let (lat, lon) = projector.inverse(c.x, c.y);
                                Coord { x: lon, y: lat }
                            })
                            .collect(),
                    )
                };
                let exterior = map_ring(p.exterior());
                let interiors = p.interiors().iter().map(map_ring).collect();
                Polygon::new(exterior, interiors)
            })
            .collect();

        Ok(MultiPolygon(wgs84))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MVA_NEVER;

    fn mask_from(rows: &[&str]) -> Array2<bool> {
        let height = rows.len();
        let width = rows[0].len();
        let mut mask = Array2::from_elem((height, width), false);
        for (r, row) in rows.iter().enumerate() {
            for (c, ch) in row.chars().enumerate() {
                mask[[r, c]] = ch == '#';
            }
        }
        mask
    }

    fn unit_transform() -> GeoTransform {
        // One-meter pixels, top-left at (0, 0), y down in raster = south.
        GeoTransform::north_up(0.0, 0.0, 1.0)
    }

    #[test]
    fn test_threshold_equivalence() {
        let data = ndarray::arr2(&[[50.0f32, 100.0, 150.0], [MVA_NEVER, 99.9, 100.1]]);
        let mva = MvaRaster { data, transform: unit_transform(), crs: String::new() };
        let mask = threshold_mask(&mva, 100.0);
        assert_eq!(mask[[0, 0]], true);
        assert_eq!(mask[[0, 1]], true); // boundary: mva <= a
        assert_eq!(mask[[0, 2]], false);
        assert_eq!(mask[[1, 0]], false); // never visible
        assert_eq!(mask[[1, 1]], true);
        assert_eq!(mask[[1, 2]], false);
    }

    #[test]
    fn test_polygonize_single_square() {
        let mask = mask_from(&["....", ".##.", ".##.", "...."]);
        let polys = polygonize(&mask, &unit_transform());
        assert_eq!(polys.0.len(), 1);
        let poly = &polys.0[0];
        assert_eq!(poly.interiors().len(), 0);
        assert!((poly.unsigned_area() - 4.0).abs() < 1e-9);
        // Exterior winds counter-clockwise in projected space.
        assert!(signed_area(poly.exterior()) > 0.0);
    }

    #[test]
    fn test_polygonize_ring_with_hole() {
        let mask = mask_from(&["#####", "#...#", "#.#.#", "#...#", "#####"]);
        let polys = polygonize(&mask, &unit_transform());
        // Outer ring with a hole, plus the lone centre pixel inside the hole.
        assert_eq!(polys.0.len(), 2);
        let outer = polys.0.iter().find(|p| p.unsigned_area() > 10.0).unwrap();
        assert_eq!(outer.interiors().len(), 1);
        // 5x5 minus the 3x3 hole.
        assert!((outer.unsigned_area() - 16.0).abs() < 1e-9);
        let inner = polys.0.iter().find(|p| p.unsigned_area() < 10.0).unwrap();
        assert!((inner.unsigned_area() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_polygonize_diagonal_cells_stay_separate() {
        // 4-connected foreground: diagonal neighbours are distinct regions.
        let mask = mask_from(&["#.", ".#"]);
        let polys = polygonize(&mask, &unit_transform());
        assert_eq!(polys.0.len(), 2);
        for p in &polys.0 {
            assert!((p.unsigned_area() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_polygonize_two_regions() {
        let mask = mask_from(&["##..##", "##..##"]);
        let polys = polygonize(&mask, &unit_transform());
        assert_eq!(polys.0.len(), 2);
        let total: f64 = polys.0.iter().map(|p| p.unsigned_area()).sum();
        assert!((total - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_polygonize_empty_mask() {
        let mask = Array2::from_elem((4, 4), false);
        assert!(polygonize(&mask, &unit_transform()).0.is_empty());
    }

    #[test]
    fn test_collinear_corners_are_collapsed() {
        let mask = mask_from(&["####", "####"]);
        let polys = polygonize(&mask, &unit_transform());
        assert_eq!(polys.0.len(), 1);
        // A rectangle needs only its 4 corners (plus closing point).
        assert_eq!(polys.0[0].exterior().0.len(), 5);
    }

    #[test]
    fn test_horizon_disc_area() {
        let disc = horizon_disc(1000.0, 720);
        let expected = std::f64::consts::PI * 1000.0 * 1000.0;
        assert!((disc.unsigned_area() - expected).abs() / expected < 1e-3);
    }

    #[test]
    fn test_extract_clips_to_horizon() {
        // Everything visible at 0 m over a 4 km square grid, but the horizon
        // disc only reaches 1 km: the output must be the disc.
        let dim = 81;
        let transform = GeoTransform::north_up(-2025.0, 2025.0, 50.0);
        let data = Array2::from_elem((dim, dim), 0.0f32);
        let mva = MvaRaster { data, transform, crs: String::new() };
        let projector = AeqdProjector::new(0.0, 0.0).unwrap();
        let extractor = MaskExtractor::new(1.0, 100.0);

        let polys = extractor.extract(&[&mva], 0.0, 1000.0, &projector).unwrap();
        assert_eq!(polys.0.len(), 1);
        // Compare areas in degrees: 1 km is ~0.009 degrees of latitude, so
        // convert the expected disc area instead of the polygon.
        let area_deg2 = polys.0[0].unsigned_area();
        let deg_per_m_lat = 1.0 / 110_574.0;
        let deg_per_m_lon = 1.0 / 111_320.0;
        let expected = std::f64::consts::PI * (1000.0 * deg_per_m_lat) * (1000.0 * deg_per_m_lon);
        assert!((area_deg2 - expected).abs() / expected < 0.05);
    }

    #[test]
    fn test_extract_drops_slivers() {
        // A single visible pixel of 50x50 m = 2500 m2 is below min_area.
        let dim = 41;
        let transform = GeoTransform::north_up(-1025.0, 1025.0, 50.0);
        let mut data = Array2::from_elem((dim, dim), MVA_NEVER);
        data[[20, 25]] = 0.0;
        let mva = MvaRaster { data, transform, crs: String::new() };
        let projector = AeqdProjector::new(0.0, 0.0).unwrap();

        let strict = MaskExtractor::new(1.0, 10_000.0);
        let polys = strict.extract(&[&mva], 0.0, 2000.0, &projector).unwrap();
        assert!(polys.0.is_empty());

        let lenient = MaskExtractor::new(1.0, 100.0);
        let polys = lenient.extract(&[&mva], 0.0, 2000.0, &projector).unwrap();
        assert_eq!(polys.0.len(), 1);
    }
}
