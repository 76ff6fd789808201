//! # Aggregation Engine
//!
//! Sums point weights into named areas.
//!
//! For every area the engine:
//! 1. Queries the [`PointIndex`] with the area's bounding box (coarse prune)
//! 2. Tests each candidate with `intersects` (boundary points count)
//! 3. Sums effective weights and counts accepted points
//!
//! Every area yields an entry, including areas with no points and areas whose
//! geometry could not be processed. Entries are ranked by total weight,
//! descending; ties keep the order of the areas in the dataset.
//!
//! With N points, M areas and K candidate tests the cost is
//! O((N + M) log N + K).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use geo::{Intersects, MultiPolygon};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::DuplicateNames;
use crate::error::{AggregateError, AreaError};
use crate::geo_utils::{area_bounds, format_thousands, validate_area};
use crate::index::PointIndex;
use crate::{AdminArea, Bounds, PointSet, PolygonSet};

// ============================================================================
// Result Types
// ============================================================================

/// Weight accumulated by one area.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AreaTotal {
    pub name: String,
    pub province: Option<String>,
    pub canton: Option<String>,
    /// Sum of effective weights of the points inside the area
    pub total_weight: f64,
    /// Number of points inside the area
    pub point_count: u32,
}

/// Ranked totals for one aggregation pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AggregationResult {
    /// One entry per distinct area name, sorted by `total_weight` descending
    pub entries: Vec<AreaTotal>,
    /// Areas that could not be processed (they still have a zero entry)
    pub failed_areas: Vec<(String, AreaError)>,
    /// Names that appeared more than once in the area dataset
    pub duplicate_names: Vec<String>,
}

/// Output record for one area, as served to map consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub province: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canton: Option<String>,
    pub population: u64,
    pub formatted_population: String,
    pub points_count: u32,
}

impl AggregationResult {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all entry totals.
    pub fn total_weight(&self) -> f64 {
        self.entries.iter().map(|e| e.total_weight).sum()
    }

    /// Total number of points counted across all entries.
    pub fn total_points(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.point_count)).sum()
    }

    pub fn get(&self, name: &str) -> Option<&AreaTotal> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// The `n` highest-ranked entries.
    pub fn top(&self, n: usize) -> &[AreaTotal] {
        &self.entries[..n.min(self.entries.len())]
    }

    /// Convert to output records. Populations are truncated to integers.
    pub fn to_records(&self, thousands_separator: char) -> Vec<PopulationRecord> {
        self.entries
            .iter()
            .map(|e| {
                let population = population_of(e.total_weight);
                PopulationRecord {
                    name: e.name.clone(),
                    province: e.province.clone(),
                    canton: e.canton.clone(),
                    population,
                    formatted_population: format_thousands(population, thousands_separator),
                    points_count: e.point_count,
                }
            })
            .collect()
    }
}

fn population_of(weight: f64) -> u64 {
    if weight.is_finite() && weight > 0.0 {
        weight.trunc() as u64
    } else {
        0
    }
}

// ============================================================================
// Aggregation
// ============================================================================

/// Aggregate `points` into `polygons` with last-write-wins for duplicate names.
///
/// # Errors
///
/// [`AggregateError::StaleIndex`] if `index` was not built from `points`.
/// Per-area problems never fail the pass; see [`AggregationResult::failed_areas`].
pub fn aggregate(
    polygons: &PolygonSet,
    points: &PointSet,
    index: &PointIndex,
) -> Result<AggregationResult, AggregateError> {
    aggregate_with(polygons, points, index, DuplicateNames::LastWriteWins)
}

/// Aggregate with an explicit duplicate-name policy.
pub fn aggregate_with(
    polygons: &PolygonSet,
    points: &PointSet,
    index: &PointIndex,
    duplicates: DuplicateNames,
) -> Result<AggregationResult, AggregateError> {
    check_index(points, index)?;
    let start = Instant::now();

    let totals: Vec<Result<(f64, u32), AreaError>> = polygons
        .items()
        .iter()
        .map(|area| area_total(area, points, index))
        .collect();

    let result = assemble(polygons.items(), totals, duplicates);
    log_summary(polygons.name(), points, &result, start.elapsed());
    Ok(result)
}

/// Aggregate using parallel processing.
///
/// Produces the same result as [`aggregate_with`]; areas are tested
/// concurrently and assembled in dataset order.
#[cfg(feature = "parallel")]
pub fn aggregate_parallel(
    polygons: &PolygonSet,
    points: &PointSet,
    index: &PointIndex,
    duplicates: DuplicateNames,
) -> Result<AggregationResult, AggregateError> {
    use rayon::prelude::*;

    check_index(points, index)?;
    let start = Instant::now();

    let totals: Vec<Result<(f64, u32), AreaError>> = polygons
        .items()
        .par_iter()
        .map(|area| area_total(area, points, index))
        .collect();

    let result = assemble(polygons.items(), totals, duplicates);
    log_summary(polygons.name(), points, &result, start.elapsed());
    Ok(result)
}

fn check_index(points: &PointSet, index: &PointIndex) -> Result<(), AggregateError> {
    if index.dataset() != points.id() {
        return Err(AggregateError::StaleIndex {
            index: index.dataset(),
            points: points.id(),
        });
    }
    Ok(())
}

/// Weight and point count inside one area.
fn area_total(area: &AdminArea, points: &PointSet, index: &PointIndex) -> Result<(f64, u32), AreaError> {
    let geometry = area.geometry.as_ref().ok_or(AreaError::MissingGeometry)?;
    validate_area(geometry)?;
    let bounds = area_bounds(geometry).ok_or(AreaError::MissingGeometry)?;

    let items = points.items();
    let mut total = 0.0;
    let mut count = 0u32;
    for p in index.query(&bounds).into_iter().filter_map(|idx| items.get(idx)) {
        if geometry.intersects(&p.point()) {
            total += p.effective_weight();
            count += 1;
        }
    }
    Ok((total, count))
}

/// Fold per-area totals into ranked entries, resolving duplicate names.
fn assemble(
    areas: &[AdminArea],
    totals: Vec<Result<(f64, u32), AreaError>>,
    duplicates: DuplicateNames,
) -> AggregationResult {
    let mut entries: Vec<AreaTotal> = Vec::with_capacity(areas.len());
    let mut slot_of: HashMap<&str, usize> = HashMap::with_capacity(areas.len());
    let mut failed_areas = Vec::new();
    let mut duplicate_names: Vec<String> = Vec::new();

    for (area, outcome) in areas.iter().zip(totals) {
        let (weight, count) = match outcome {
            Ok(t) => t,
            Err(e) => {
                warn!("[Aggregation] Area '{}' skipped: {}", area.name, e);
                failed_areas.push((area.name.clone(), e));
                (0.0, 0)
            }
        };

        match slot_of.get(area.name.as_str()) {
            Some(&slot) => {
                warn!(
                    "[Aggregation] Duplicate area name '{}' ({:?})",
                    area.name, duplicates
                );
                if !duplicate_names.contains(&area.name) {
                    duplicate_names.push(area.name.clone());
                }
                let entry = &mut entries[slot];
                match duplicates {
                    DuplicateNames::LastWriteWins => {
                        entry.province = area.province.clone();
                        entry.canton = area.canton.clone();
                        entry.total_weight = weight;
                        entry.point_count = count;
                    }
                    DuplicateNames::Merge => {
                        entry.total_weight += weight;
                        entry.point_count += count;
                    }
                }
            }
            None => {
                slot_of.insert(area.name.as_str(), entries.len());
                entries.push(AreaTotal {
                    name: area.name.clone(),
                    province: area.province.clone(),
                    canton: area.canton.clone(),
                    total_weight: weight,
                    point_count: count,
                });
            }
        }
    }

    // Stable: ties keep dataset order.
    entries.sort_by(|a, b| b.total_weight.total_cmp(&a.total_weight));

    AggregationResult {
        entries,
        failed_areas,
        duplicate_names,
    }
}

fn log_summary(label: &str, points: &PointSet, result: &AggregationResult, elapsed: Duration) {
    info!(
        "[Aggregation] '{}': {} areas, {:.0} of {:.0} weight assigned ({} points) in {:?}",
        label,
        result.len(),
        result.total_weight(),
        points.total_weight(),
        result.total_points(),
        elapsed
    );
    for (rank, entry) in result.top(5).iter().enumerate() {
        info!(
            "[Aggregation]   {}. {}: {}",
            rank + 1,
            entry.name,
            format_thousands(population_of(entry.total_weight), '.')
        );
    }
    if !result.failed_areas.is_empty() {
        debug!("[Aggregation] {} areas failed", result.failed_areas.len());
    }
}

// ============================================================================
// Outline Filter
// ============================================================================

/// Keep only the points that intersect at least one outline area.
///
/// Both datasets must share a CRS. Outline areas without usable geometry are
/// ignored; if none remain, every point is kept.
pub fn clip_to_outline(points: &PointSet, outline: &PolygonSet) -> PointSet {
    let shapes: Vec<(Bounds, &MultiPolygon<f64>)> = outline
        .items()
        .iter()
        .filter_map(|area| {
            let geometry = area.geometry.as_ref()?;
            validate_area(geometry).ok()?;
            Some((area_bounds(geometry)?, geometry))
        })
        .collect();

    if shapes.is_empty() {
        warn!(
            "[Aggregation] Outline '{}' has no usable geometry; keeping all points",
            outline.name()
        );
        return points.derive(points.crs().clone(), points.items().to_vec());
    }

    let kept: Vec<_> = points
        .items()
        .iter()
        .filter(|p| {
            p.is_finite()
                && shapes.iter().any(|(bounds, geometry)| {
                    bounds.contains(p.x, p.y) && geometry.intersects(&p.point())
                })
        })
        .copied()
        .collect();

    info!(
        "[Aggregation] Outline filter kept {} of {} points",
        kept.len(),
        points.len()
    );
    points.derive(points.crs().clone(), kept)
}

// ============================================================================
// Unit Tests
// ============================================================================
