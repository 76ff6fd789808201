//! # Geometry Utilities
//!
//! Small geometric helpers shared by the loader and the aggregation engine.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`area_bounds`] | Bounding box of an area boundary |
//! | [`validate_area`] | Reject boundaries the point-in-polygon test cannot use |
//! | [`representative_point`] | Point standing in for a non-point geometry |
//! | [`simplify_area`] | Douglas-Peucker simplification that never degenerates |
//! | [`format_thousands`] | Integer rendering with a thousands separator |
//!
//! ## Example
//!
//! ```rust
//! use density_atlas::geo_utils;
//! use geo::{polygon, MultiPolygon};
//!
//! let square = MultiPolygon::new(vec![polygon![
//!     (x: -79.0, y: -1.0), (x: -78.0, y: -1.0), (x: -78.0, y: 0.0), (x: -79.0, y: 0.0)
//! ]]);
//!
//! let bounds = geo_utils::area_bounds(&square).unwrap();
//! assert_eq!(bounds.min_x, -79.0);
//! assert_eq!(bounds.max_y, 0.0);
//!
//! assert_eq!(geo_utils::format_thousands(1_234_567, '.'), "1.234.567");
//! ```
//!
//! ## Coordinate System
//!
//! Nothing here assumes a particular CRS. Bounds and tolerances are expressed
//! in whatever units the input coordinates use.

use geo::{BoundingRect, Centroid, Geometry, MultiPolygon, Point, Simplify};

use crate::error::AreaError;
use crate::Bounds;

// =============================================================================
// Bounding Box Functions
// =============================================================================

/// Compute the bounding box of an area boundary.
///
/// Returns `None` for a multipolygon without coordinates.
pub fn area_bounds(geometry: &MultiPolygon<f64>) -> Option<Bounds> {
    let rect = geometry.bounding_rect()?;
    Some(Bounds {
        min_x: rect.min().x,
        min_y: rect.min().y,
        max_x: rect.max().x,
        max_y: rect.max().y,
    })
}

// =============================================================================
// Validation
// =============================================================================

/// Check that a boundary can take part in point-in-polygon tests.
///
/// # Errors
///
/// - [`AreaError::MissingGeometry`] if there are no polygons
/// - [`AreaError::NonFiniteCoordinate`] if any vertex is NaN or infinite
/// - [`AreaError::DegenerateRing`] if an exterior ring has fewer than four
///   vertices (a closed triangle is the minimum)
pub fn validate_area(geometry: &MultiPolygon<f64>) -> Result<(), AreaError> {
    if geometry.0.is_empty() {
        return Err(AreaError::MissingGeometry);
    }
    for polygon in &geometry.0 {
        let rings = std::iter::once(polygon.exterior()).chain(polygon.interiors());
        for ring in rings {
            if ring.0.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
                return Err(AreaError::NonFiniteCoordinate);
            }
        }
        if polygon.exterior().0.len() < 4 {
            return Err(AreaError::DegenerateRing);
        }
    }
    Ok(())
}

// =============================================================================
// Geometry Reduction
// =============================================================================

/// Point standing in for a geometry inside a point dataset.
///
/// Points are returned as-is; anything else collapses to its centroid.
/// Returns `None` for empty geometries.
pub fn representative_point(geometry: &Geometry<f64>) -> Option<Point<f64>> {
    match geometry {
        Geometry::Point(p) => Some(*p),
        other => other.centroid(),
    }
}

/// Simplify a boundary with the Douglas-Peucker algorithm.
///
/// Returns `None` when the simplified boundary would fail [`validate_area`];
/// callers keep the original in that case.
pub fn simplify_area(geometry: &MultiPolygon<f64>, tolerance: f64) -> Option<MultiPolygon<f64>> {
    if !(tolerance > 0.0) {
        return None;
    }
    let simplified = geometry.simplify(&tolerance);
    validate_area(&simplified).ok().map(|_| simplified)
}

// =============================================================================
// Formatting
// =============================================================================

/// Render an integer with `separator` between groups of three digits.
pub fn format_thousands(value: u64, separator: char) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(separator);
        }
        out.push(ch);
    }
    out
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, LineString, Polygon};

    fn unit_square() -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 0.0, y: 1.0),
        ]])
    }

    #[test]
    fn test_area_bounds() {
        let bounds = area_bounds(&unit_square()).unwrap();
        assert_eq!(bounds, Bounds { min_x: 0.0, min_y: 0.0, max_x: 1.0, max_y: 1.0 });
        assert!(area_bounds(&MultiPolygon::new(vec![])).is_none());
    }

    #[test]
    fn test_validate_area() {
        assert_eq!(validate_area(&unit_square()), Ok(()));
        assert_eq!(
            validate_area(&MultiPolygon::new(vec![])),
            Err(AreaError::MissingGeometry)
        );

        let sliver = Polygon::new(LineString::from(vec![(0.0, 0.0), (1.0, 1.0)]), vec![]);
        assert_eq!(
            validate_area(&MultiPolygon::new(vec![sliver])),
            Err(AreaError::DegenerateRing)
        );

        let broken = Polygon::new(
            LineString::from(vec![(0.0, 0.0), (f64::NAN, 0.0), (1.0, 1.0), (0.0, 0.0)]),
            vec![],
        );
        assert_eq!(
            validate_area(&MultiPolygon::new(vec![broken])),
            Err(AreaError::NonFiniteCoordinate)
        );
    }

    #[test]
    fn test_representative_point() {
        let point = Geometry::Point(Point::new(3.0, 4.0));
        assert_eq!(representative_point(&point), Some(Point::new(3.0, 4.0)));

        let square = Geometry::MultiPolygon(unit_square());
        let centroid = representative_point(&square).unwrap();
        assert!((centroid.x() - 0.5).abs() < 1e-12);
        assert!((centroid.y() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_simplify_keeps_shape() {
        let mut coords: Vec<(f64, f64)> = (0..=100).map(|i| (i as f64 / 100.0, 0.0)).collect();
        coords.extend([(1.0, 1.0), (0.0, 1.0), (0.0, 0.0)]);
        let dense = MultiPolygon::new(vec![Polygon::new(LineString::from(coords), vec![])]);

        let simplified = simplify_area(&dense, 0.01).unwrap();
        assert!(simplified.0[0].exterior().0.len() < dense.0[0].exterior().0.len());
        assert_eq!(area_bounds(&simplified), area_bounds(&dense));
    }

    #[test]
    fn test_simplify_rejects_bad_tolerance() {
        assert!(simplify_area(&unit_square(), 0.0).is_none());
        assert!(simplify_area(&unit_square(), f64::NAN).is_none());
    }

    #[test]
    fn test_format_thousands() {
        assert_eq!(format_thousands(0, '.'), "0");
        assert_eq!(format_thousands(999, '.'), "999");
        assert_eq!(format_thousands(1000, '.'), "1.000");
        assert_eq!(format_thousands(2_781_641, ','), "2,781,641");
    }
}
