//! Point subset and styling for map rendering.
//!
//! Maps cannot draw every population sample, so the displayed layer is capped:
//! the highest-population points are always shown, and the remainder of the
//! budget is a seeded uniform sample of everything else for spatial coverage.
//! Aggregation always uses the full point set, never this subset.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;

use crate::classify::{classify, DensityColor};
use crate::{PopulationPoint, Region};

/// A point ready to be drawn as a circle marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyledPoint {
    pub longitude: f64,
    pub latitude: f64,
    pub population: f64,
    pub region: Option<Region>,
    /// Fill color, hex
    pub color: &'static str,
    pub opacity: f32,
    pub bucket: DensityColor,
    /// Marker radius in pixels
    pub radius: f64,
}

/// Choose at most `max_points` points for display.
///
/// The `high_share` fraction of the budget goes to the points with the largest
/// weights (ties keep input order); the rest is sampled uniformly from the
/// remaining points with a generator seeded by `seed`, so repeated calls on the
/// same input return the same subset. Inputs within budget are returned as-is.
pub fn sample_for_display(
    points: &[PopulationPoint],
    max_points: usize,
    high_share: f64,
    seed: u64,
) -> Vec<PopulationPoint> {
    if points.len() <= max_points {
        return points.to_vec();
    }

    let share = if high_share.is_finite() { high_share.clamp(0.0, 1.0) } else { 0.0 };
    let high_count = ((max_points as f64) * share).floor() as usize;
    let remaining_count = max_points - high_count;

    let mut ranked: Vec<&PopulationPoint> = points.iter().collect();
    ranked.sort_by(|a, b| b.effective_weight().total_cmp(&a.effective_weight()));
    let (high, rest) = ranked.split_at(high_count);

    let mut rng = StdRng::seed_from_u64(seed);
    let mut selected: Vec<PopulationPoint> = high.iter().map(|p| **p).collect();
    selected.extend(rest.choose_multiple(&mut rng, remaining_count).map(|p| **p));

    log::info!(
        "[Display] Mixed subset: {} high-population + {} sampled of {} points",
        high.len(),
        selected.len() - high.len(),
        points.len()
    );
    selected
}

/// Attach classification and marker size to each point.
pub fn style_points(points: &[PopulationPoint]) -> Vec<StyledPoint> {
    points
        .iter()
        .map(|p| {
            let population = p.effective_weight();
            let (bucket, opacity) = classify(population);
            StyledPoint {
                longitude: p.x,
                latitude: p.y,
                population,
                region: p.region,
                color: bucket.hex(),
                opacity,
                bucket,
                radius: marker_radius(population, p.region),
            }
        })
        .collect()
}

/// Island samples are sparse, so they scale with population instead of using a fixed size.
fn marker_radius(population: f64, region: Option<Region>) -> f64 {
    match region {
        Some(Region::Galapagos) => (population * 0.2).clamp(2.0, 6.0),
        _ => 3.0,
    }
}
