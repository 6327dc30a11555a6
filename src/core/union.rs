//! Multi-sensor coverage union.
//!
//! Merges per-sensor polygon sets at a common target altitude into one set,
//! preserving interior holes (terrain shadows shared by every contributor).

use geo::{Area, BooleanOps, MultiPolygon, Simplify};

use crate::types::ViewshedResult;

/// Union result with provenance
#[derive(Debug, Clone)]
pub struct UnionCoverage {
    pub polygons: MultiPolygon<f64>,
    /// Ids of the sensors that contributed, in input order
    pub contributing_sensors: Vec<String>,
}

pub struct UnionBuilder {
    /// Re-simplification tolerance applied after the union, in the unit of
    /// the input coordinates
    pub simplify_tolerance: f64,
}

impl UnionBuilder {
    pub fn new(simplify_tolerance: f64) -> Self {
        Self { simplify_tolerance }
    }

    /// Union the given per-sensor polygon sets. Empty inputs contribute
    /// nothing but are still listed as contributors.
    pub fn build(
        &self,
        inputs: &[(String, MultiPolygon<f64>)],
    ) -> ViewshedResult<UnionCoverage> {
        let mut merged = MultiPolygon::<f64>(vec![]);
        let mut contributing = Vec::with_capacity(inputs.len());

        for (sensor_id, polygons) in inputs {
            contributing.push(sensor_id.clone());
            if polygons.0.is_empty() {
                continue;
            }
            merged = if merged.0.is_empty() {
                polygons.clone()
            } else {
                merged.union(polygons)
            };
        }

        let simplified = if merged.0.is_empty() || self.simplify_tolerance <= 0.0 {
            merged
        } else {
            merged.simplify(&self.simplify_tolerance)
        };

        log::debug!(
            "union of {} sensor(s): {} polygon(s), area {:.1}",
            contributing.len(),
            simplified.0.len(),
            simplified.unsigned_area()
        );

        Ok(UnionCoverage { polygons: simplified, contributing_sensors: contributing })
    }
}
