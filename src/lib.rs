//! # Density Atlas
//!
//! Population point aggregation over administrative boundaries.
//!
//! This library provides:
//! - GeoJSON dataset loading with an ordered fallback chain of file variants
//! - CRS normalisation between point and boundary datasets
//! - R-tree indexed point-in-polygon aggregation of population weights
//! - A concurrent result cache with per-key single-flight computation
//! - Density classification and a display subset for map rendering
//!
//! ## Features
//!
//! - **`parallel`** - Enable parallel aggregation with rayon
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use density_atlas::{
//!     aggregate, AdminArea, Crs, Dataset, PointIndex, PopulationPoint,
//! };
//! use geo::{polygon, MultiPolygon};
//!
//! let square = polygon![
//!     (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0)
//! ];
//! let areas = Dataset::new(
//!     "areas",
//!     Crs::Wgs84,
//!     vec![AdminArea::new("square", MultiPolygon::new(vec![square]))],
//! );
//! let points = Dataset::new(
//!     "points",
//!     Crs::Wgs84,
//!     vec![
//!         PopulationPoint::new(0.5, 0.5, 10.0),
//!         PopulationPoint::new(2.0, 2.0, 5.0),
//!     ],
//! );
//!
//! let index = PointIndex::build(&points);
//! let result = aggregate(&areas, &points, &index).unwrap();
//!
//! assert_eq!(result.entries.len(), 1);
//! assert_eq!(result.entries[0].total_weight, 10.0);
//! assert_eq!(result.entries[0].point_count, 1);
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use geo::{MultiPolygon, Point};
use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod cache;
pub mod classify;
pub mod config;
pub mod crs;
pub mod display;
pub mod error;
pub mod geo_utils;
pub mod index;
pub mod service;
pub mod store;

pub use aggregate::{aggregate, aggregate_with, clip_to_outline, AggregationResult, AreaTotal, PopulationRecord};
#[cfg(feature = "parallel")]
pub use aggregate::aggregate_parallel;
pub use cache::{CacheStats, ResultCache};
pub use classify::{classify, DensityColor};
pub use config::{AreaFields, AreaLevel, DensityConfig, DisplayConfig, DuplicateNames, FallbackConfig};
pub use crs::{normalize, reproject, Crs, Reproject};
pub use display::{sample_for_display, style_points, StyledPoint};
pub use error::{AggregateError, AreaError, CandidateError, CrsError, LoadError, ServiceError};
pub use index::PointIndex;
pub use service::{DensityService, IndexBuilder, PointLayer, Province};
pub use store::{simplify_areas, Candidate, DatasetKind, DatasetSource, FallbackChain, GeometryStore};

/// JSON object holding a feature's attributes.
pub type Properties = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Core Types
// ============================================================================

/// Process-unique identity of a loaded dataset.
///
/// Every load (and every reprojection) yields a fresh id, so cache keys built
/// from ids never collide with results computed from older data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DatasetId(u64);

impl DatasetId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Classification tag carried by population points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Continental,
    Galapagos,
}

impl Region {
    /// Parse a region tag, case-insensitively. Unknown tags yield `None`.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "continental" => Some(Region::Continental),
            "galapagos" | "galápagos" => Some(Region::Galapagos),
            _ => None,
        }
    }
}

/// A population sample: a coordinate pair plus the weight summed during aggregation.
///
/// # Example
/// ```
/// use density_atlas::PopulationPoint;
/// let quito = PopulationPoint::new(-78.5, -0.2, 1250.0);
/// assert_eq!(quito.weight, 1250.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PopulationPoint {
    /// Longitude (or easting in projected CRSs)
    pub x: f64,
    /// Latitude (or northing in projected CRSs)
    pub y: f64,
    /// Population value
    pub weight: f64,
    pub region: Option<Region>,
}

impl PopulationPoint {
    /// Create a new point without a region tag.
    pub fn new(x: f64, y: f64, weight: f64) -> Self {
        Self { x, y, weight, region: None }
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    /// The weight used for summation. Negative and non-finite weights count as zero.
    #[inline]
    pub fn effective_weight(&self) -> f64 {
        if self.weight.is_finite() && self.weight > 0.0 {
            self.weight
        } else {
            0.0
        }
    }

    /// Check if both coordinates are finite.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn point(&self) -> Point<f64> {
        Point::new(self.x, self.y)
    }
}

/// Axis-aligned bounding box in dataset coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    /// Inclusive containment test.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// A named administrative unit (canton or parish).
#[derive(Debug, Clone, PartialEq)]
pub struct AdminArea {
    /// Identity key within a dataset (not guaranteed unique upstream)
    pub name: String,
    /// Parent province name, when the dataset carries one
    pub province: Option<String>,
    /// Parent canton name (parishes only)
    pub canton: Option<String>,
    /// Boundary; `None` when the feature had no usable polygon geometry
    pub geometry: Option<MultiPolygon<f64>>,
    /// Raw feature attributes
    pub properties: Properties,
}

impl AdminArea {
    /// Create an area with a name and boundary and no parent references.
    pub fn new(name: impl Into<String>, geometry: MultiPolygon<f64>) -> Self {
        Self {
            name: name.into(),
            province: None,
            canton: None,
            geometry: Some(geometry),
            properties: Properties::new(),
        }
    }

    pub fn with_parents(mut self, province: Option<String>, canton: Option<String>) -> Self {
        self.province = province;
        self.canton = canton;
        self
    }

    /// Look up a raw attribute as a string (numbers are rendered).
    pub fn property_str(&self, key: &str) -> Option<String> {
        match self.properties.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// A read-only collection of points or areas bound to one CRS.
///
/// Datasets are immutable once built; transformations produce a new dataset
/// with a new [`DatasetId`].
#[derive(Debug, Clone)]
pub struct Dataset<T> {
    id: DatasetId,
    name: String,
    source: Option<PathBuf>,
    crs: crs::Crs,
    items: Vec<T>,
}

/// A dataset of population points.
pub type PointSet = Dataset<PopulationPoint>;

/// A dataset of administrative areas.
pub type PolygonSet = Dataset<AdminArea>;

impl<T> Dataset<T> {
    /// Create a dataset with a fresh identity.
    pub fn new(name: impl Into<String>, crs: crs::Crs, items: Vec<T>) -> Self {
        Self {
            id: DatasetId::next(),
            name: name.into(),
            source: None,
            crs,
            items,
        }
    }

    /// Record the file this dataset was read from.
    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(path.into());
        self
    }

    pub fn id(&self) -> DatasetId {
        self.id
    }

    /// Logical name the dataset was requested under.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn crs(&self) -> &crs::Crs {
        &self.crs
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Build a sibling dataset (same name, source and CRS) with new items and a new id.
    pub(crate) fn derive<U>(&self, crs: crs::Crs, items: Vec<U>) -> Dataset<U> {
        Dataset {
            id: DatasetId::next(),
            name: self.name.clone(),
            source: self.source.clone(),
            crs,
            items,
        }
    }
}

impl PointSet {
    /// Sum of effective weights over all points.
    pub fn total_weight(&self) -> f64 {
        self.items.iter().map(|p| p.effective_weight()).sum()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_ids_are_unique() {
        let a: PointSet = Dataset::new("a", crs::Crs::Wgs84, vec![]);
        let b: PointSet = Dataset::new("a", crs::Crs::Wgs84, vec![]);
        assert_ne!(a.id(), b.id());

        let c = a.derive(crs::Crs::WebMercator, Vec::<PopulationPoint>::new());
        assert_ne!(a.id(), c.id());
        assert_eq!(c.name(), "a");
    }

    #[test]
    fn test_effective_weight() {
        assert_eq!(PopulationPoint::new(0.0, 0.0, 3.5).effective_weight(), 3.5);
        assert_eq!(PopulationPoint::new(0.0, 0.0, -1.0).effective_weight(), 0.0);
        assert_eq!(PopulationPoint::new(0.0, 0.0, f64::NAN).effective_weight(), 0.0);
        assert_eq!(PopulationPoint::new(0.0, 0.0, f64::INFINITY).effective_weight(), 0.0);
    }

    #[test]
    fn test_region_parse() {
        assert_eq!(Region::parse("galapagos"), Some(Region::Galapagos));
        assert_eq!(Region::parse(" Continental "), Some(Region::Continental));
        assert_eq!(Region::parse("amazonia"), None);
    }

    #[test]
    fn test_bounds_contains_is_inclusive() {
        let bounds = Bounds { min_x: -79.0, min_y: -1.0, max_x: -78.0, max_y: 0.0 };
        assert!(bounds.contains(-78.5, -0.5));
        assert!(bounds.contains(-79.0, 0.0));
        assert!(!bounds.contains(-77.9, -0.5));
        assert!(!bounds.contains(-78.5, f64::NAN));
    }

    #[test]
    fn test_total_weight_ignores_invalid() {
        let points = Dataset::new(
            "p",
            crs::Crs::Wgs84,
            vec![
                PopulationPoint::new(0.0, 0.0, 2.0),
                PopulationPoint::new(0.0, 0.0, -5.0),
                PopulationPoint::new(0.0, 0.0, 3.0),
            ],
        );
        assert_eq!(points.total_weight(), 5.0);
    }
}
