//! Error types.
//!
//! Load and per-area failures are recoverable: callers log them and degrade to
//! empty or zero results. Only [`AggregateError`] is meant to reach the caller
//! as a hard failure.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::{crs::Crs, DatasetId};

/// Convenience alias for results carrying a [`LoadError`].
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Why a single fallback candidate was rejected.
#[derive(Debug, Error)]
pub enum CandidateError {
    #[error("file does not exist")]
    Missing,
    #[error("file is empty")]
    Empty,
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not a valid GeoJSON object: {0}")]
    NotGeoJson(#[from] geojson::Error),
    #[error("unsupported GeoJSON type: {0}")]
    UnsupportedType(String),
    #[error("no features")]
    NoFeatures,
    #[error("unusable crs member: {0}")]
    Crs(#[from] CrsError),
}

/// A rejected candidate file and the reason it was skipped.
#[derive(Debug)]
pub struct CandidateFailure {
    pub path: PathBuf,
    pub reason: CandidateError,
}

impl fmt::Display for CandidateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}

/// Every candidate for a logical dataset failed.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no data directory found (searched {searched:?})")]
    NoDataDirectory { searched: Vec<PathBuf> },

    #[error("could not load '{logical_name}': {}", format_attempts(.attempts))]
    Exhausted {
        logical_name: String,
        attempts: Vec<CandidateFailure>,
    },
}

fn format_attempts(attempts: &[CandidateFailure]) -> String {
    if attempts.is_empty() {
        return "no candidates".to_string();
    }
    attempts
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Coordinate reference system failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CrsError {
    #[error("unrecognized CRS identifier '{0}'")]
    Unrecognized(String),
    #[error("no transform from {from} to {to}")]
    UnsupportedTransform { from: Crs, to: Crs },
    #[error("coordinate ({x}, {y}) is not representable in the target CRS")]
    NonFiniteCoordinate { x: f64, y: f64 },
}

/// A single area could not be processed. Contained by the aggregation engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AreaError {
    #[error("area has no polygon geometry")]
    MissingGeometry,
    #[error("area has a degenerate ring")]
    DegenerateRing,
    #[error("area has a non-finite coordinate")]
    NonFiniteCoordinate,
}

/// Hard aggregation failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AggregateError {
    #[error("index was built for point dataset {index}, not {points}")]
    StaleIndex { index: DatasetId, points: DatasetId },
}

/// Request-level validation failures in [`crate::service::DensityService`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    #[error("invalid province code '{0}' (expected 1-24)")]
    InvalidProvince(String),
}
