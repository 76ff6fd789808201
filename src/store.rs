//! # Geometry Store
//!
//! Loads point and area datasets from GeoJSON files.
//!
//! A logical dataset name resolves to a file through an ordered
//! [`FallbackChain`]: the exact file, then `_simple` and `_minimal` variants,
//! then (points only) a boundary file whose shapes collapse to centroid points.
//! Candidates that are missing, empty, unparseable or featureless are skipped
//! with a warning; only when every candidate fails does loading fail.
//!
//! ```no_run
//! use density_atlas::{AreaFields, DatasetSource, GeometryStore};
//!
//! let store = GeometryStore::with_data_dir("./data");
//! let cantons = store.load_polygons("cantones.geojson", &AreaFields::canton())?;
//! println!("{} cantons in {}", cantons.len(), cantons.crs());
//! # Ok::<(), density_atlas::LoadError>(())
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use geo::{Geometry, MultiPolygon};
use geojson::{FeatureCollection, GeoJson};
use log::{debug, error, info, warn};
use serde_json::Value;

use crate::config::{AreaFields, DensityConfig, FallbackConfig};
use crate::crs::Crs;
use crate::error::{CandidateError, CandidateFailure, LoadError, LoadResult};
use crate::geo_utils::{representative_point, simplify_area};
use crate::{AdminArea, Dataset, PointSet, PolygonSet, PopulationPoint, Properties, Region};

/// Point attribute holding the weight.
pub const WEIGHT_FIELD: &str = "population";
/// Point attribute holding the region tag.
pub const REGION_FIELD: &str = "region";

// ============================================================================
// Fallback Chain
// ============================================================================

/// One way of turning a logical dataset name into a file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// The logical name itself
    Exact,
    /// The logical name with a suffix inserted before the extension
    Suffixed(String),
    /// A fixed file, regardless of the logical name
    Fixed(String),
}

impl Candidate {
    pub fn resolve(&self, logical_name: &str) -> String {
        match self {
            Candidate::Exact => logical_name.to_string(),
            Candidate::Fixed(file) => file.clone(),
            Candidate::Suffixed(suffix) => {
                let path = Path::new(logical_name);
                match (path.file_stem(), path.extension()) {
                    (Some(stem), Some(ext)) => {
                        let file = format!("{}{}.{}", stem.to_string_lossy(), suffix, ext.to_string_lossy());
                        match path.parent().filter(|p| !p.as_os_str().is_empty()) {
                            Some(parent) => parent.join(file).to_string_lossy().into_owned(),
                            None => file,
                        }
                    }
                    _ => format!("{}{}", logical_name, suffix),
                }
            }
        }
    }
}

/// Which loader a fallback chain serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatasetKind {
    Points,
    Polygons,
}

/// Ordered candidate resolvers shared by every dataset of one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackChain {
    candidates: Vec<Candidate>,
}

impl FallbackChain {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }

    /// Chain for `kind`: exact name, each suffix variant, then the point last resort.
    pub fn for_kind(kind: DatasetKind, config: &FallbackConfig) -> Self {
        let mut candidates = vec![Candidate::Exact];
        candidates.extend(config.suffixes.iter().cloned().map(Candidate::Suffixed));
        if kind == DatasetKind::Points {
            if let Some(file) = &config.point_last_resort {
                candidates.push(Candidate::Fixed(file.clone()));
            }
        }
        Self { candidates }
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// File names to try for `logical_name`, in order, without repeats.
    pub fn file_names(&self, logical_name: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.candidates.len());
        for candidate in &self.candidates {
            let name = candidate.resolve(logical_name);
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

// ============================================================================
// Dataset Source
// ============================================================================

/// Something that can produce datasets by logical name.
///
/// [`GeometryStore`] reads them from disk; tests and hosts can supply their own.
pub trait DatasetSource: Send + Sync {
    fn load_points(&self, logical_name: &str) -> LoadResult<PointSet>;
    fn load_polygons(&self, logical_name: &str, fields: &AreaFields) -> LoadResult<PolygonSet>;
}

/// Loads datasets from the first existing data directory.
#[derive(Debug, Clone)]
pub struct GeometryStore {
    data_dirs: Vec<PathBuf>,
    point_chain: FallbackChain,
    polygon_chain: FallbackChain,
}

impl GeometryStore {
    pub fn new(config: &DensityConfig) -> Self {
        Self {
            data_dirs: config.data_dirs.clone(),
            point_chain: FallbackChain::for_kind(DatasetKind::Points, &config.fallback),
            polygon_chain: FallbackChain::for_kind(DatasetKind::Polygons, &config.fallback),
        }
    }

    /// Store over a single directory with the default fallback chains.
    pub fn with_data_dir(dir: impl Into<PathBuf>) -> Self {
        let fallback = FallbackConfig::default();
        Self {
            data_dirs: vec![dir.into()],
            point_chain: FallbackChain::for_kind(DatasetKind::Points, &fallback),
            polygon_chain: FallbackChain::for_kind(DatasetKind::Polygons, &fallback),
        }
    }

    pub fn chain(&self, kind: DatasetKind) -> &FallbackChain {
        match kind {
            DatasetKind::Points => &self.point_chain,
            DatasetKind::Polygons => &self.polygon_chain,
        }
    }

    /// The first configured data directory that exists.
    pub fn data_directory(&self) -> LoadResult<PathBuf> {
        let Some(dir) = self.data_dirs.iter().find(|d| d.is_dir()) else {
            error!("[GeometryStore] No data directory found in {:?}", self.data_dirs);
            return Err(LoadError::NoDataDirectory {
                searched: self.data_dirs.clone(),
            });
        };

        if log::log_enabled!(log::Level::Debug) {
            let mut files: Vec<String> = fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .filter(|name| name.ends_with(".geojson") || name.ends_with(".json"))
                        .collect()
                })
                .unwrap_or_default();
            files.sort();
            debug!("[GeometryStore] Data directory {} has {:?}", dir.display(), files);
        }
        Ok(dir.clone())
    }

    /// Walk the chain for `kind` and return the first usable collection.
    fn load_collection(&self, kind: DatasetKind, logical_name: &str) -> LoadResult<(PathBuf, Crs, FeatureCollection)> {
        let dir = self.data_directory()?;
        let mut attempts = Vec::new();

        for file_name in self.chain(kind).file_names(logical_name) {
            let path = dir.join(&file_name);
            match read_candidate(&path) {
                Ok((crs, collection)) => {
                    info!(
                        "[GeometryStore] Loaded '{}' from {} ({} features, {})",
                        logical_name,
                        path.display(),
                        collection.features.len(),
                        crs
                    );
                    return Ok((path, crs, collection));
                }
                Err(reason) => {
                    warn!("[GeometryStore] Skipping {}: {}", path.display(), reason);
                    attempts.push(CandidateFailure { path, reason });
                }
            }
        }

        let err = LoadError::Exhausted {
            logical_name: logical_name.to_string(),
            attempts,
        };
        error!("[GeometryStore] {}", err);
        Err(err)
    }
}

impl DatasetSource for GeometryStore {
    fn load_points(&self, logical_name: &str) -> LoadResult<PointSet> {
        let (path, crs, collection) = self.load_collection(DatasetKind::Points, logical_name)?;
        Ok(points_from_collection(logical_name, crs, collection).with_source(path))
    }

    fn load_polygons(&self, logical_name: &str, fields: &AreaFields) -> LoadResult<PolygonSet> {
        let (path, crs, collection) = self.load_collection(DatasetKind::Polygons, logical_name)?;
        Ok(areas_from_collection(logical_name, crs, collection, fields).with_source(path))
    }
}

// ============================================================================
// Candidate Validation
// ============================================================================

/// Read and validate one candidate file.
///
/// The file must hold a `FeatureCollection` (or a single `Feature`, treated as
/// a one-feature collection) with at least one feature. A legacy top-level
/// `crs` member sets the dataset CRS; without one the data is WGS 84.
pub fn read_candidate(path: &Path) -> Result<(Crs, FeatureCollection), CandidateError> {
    if !path.is_file() {
        return Err(CandidateError::Missing);
    }
    let bytes = fs::read(path)?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(CandidateError::Empty);
    }

    let value: Value = serde_json::from_slice(&bytes)?;
    let crs = match value.get("crs") {
        Some(member) if !member.is_null() => Crs::from_geojson_member(member)?,
        _ => Crs::default(),
    };

    let collection = match value.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") | Some("Feature") => match GeoJson::from_json_value(value)? {
            GeoJson::FeatureCollection(fc) => fc,
            GeoJson::Feature(feature) => FeatureCollection {
                bbox: None,
                features: vec![feature],
                foreign_members: None,
            },
            GeoJson::Geometry(_) => return Err(CandidateError::UnsupportedType("Geometry".to_string())),
        },
        Some(other) => return Err(CandidateError::UnsupportedType(other.to_string())),
        None => return Err(CandidateError::UnsupportedType("<missing>".to_string())),
    };

    if collection.features.is_empty() {
        return Err(CandidateError::NoFeatures);
    }
    Ok((crs, collection))
}

// ============================================================================
// Feature Conversion
// ============================================================================

fn to_geo(geometry: geojson::Geometry) -> Option<Geometry<f64>> {
    Geometry::<f64>::try_from(geometry).ok()
}

/// Build points from features. Non-point geometries contribute their centroid.
pub(crate) fn points_from_collection(logical_name: &str, crs: Crs, collection: FeatureCollection) -> PointSet {
    let total = collection.features.len();
    let mut points = Vec::with_capacity(total);
    let mut without_position = 0usize;
    let mut reduced = 0usize;
    let mut bad_weights = 0usize;

    for feature in collection.features {
        let Some(geometry) = feature.geometry.and_then(to_geo) else {
            without_position += 1;
            continue;
        };
        let Some(position) = representative_point(&geometry) else {
            without_position += 1;
            continue;
        };
        if !matches!(geometry, Geometry::Point(_)) {
            reduced += 1;
        }

        let properties = feature.properties.unwrap_or_default();
        let (weight, clean) = read_weight(properties.get(WEIGHT_FIELD));
        if !clean {
            bad_weights += 1;
        }
        let region = properties
            .get(REGION_FIELD)
            .and_then(Value::as_str)
            .and_then(Region::parse);

        points.push(PopulationPoint {
            x: position.x(),
            y: position.y(),
            weight,
            region,
        });
    }

    if without_position > 0 {
        warn!(
            "[GeometryStore] '{}': {} of {} features have no usable position",
            logical_name, without_position, total
        );
    }
    if reduced > 0 {
        warn!(
            "[GeometryStore] '{}': {} non-point features reduced to centroids",
            logical_name, reduced
        );
    }
    if bad_weights > 0 {
        warn!(
            "[GeometryStore] '{}': {} points have a missing or invalid {}, counted as 0",
            logical_name, bad_weights, WEIGHT_FIELD
        );
    }

    Dataset::new(logical_name, crs, points)
}

/// Weight from an attribute value, and whether the value was usable as-is.
fn read_weight(value: Option<&Value>) -> (f64, bool) {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(w) if w.is_finite() && w >= 0.0 => (w, true),
        _ => (0.0, false),
    }
}

fn property_text(properties: &Properties, key: &str) -> Option<String> {
    match properties.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn to_multipolygon(geometry: Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match geometry {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p])),
        Geometry::MultiPolygon(mp) => Some(mp),
        Geometry::GeometryCollection(gc) => {
            let polygons: Vec<_> = gc
                .0
                .into_iter()
                .filter_map(to_multipolygon)
                .flat_map(|mp| mp.0)
                .collect();
            (!polygons.is_empty()).then(|| MultiPolygon::new(polygons))
        }
        _ => None,
    }
}

/// Build named areas from features using the attribute names in `fields`.
pub(crate) fn areas_from_collection(
    logical_name: &str,
    crs: Crs,
    collection: FeatureCollection,
    fields: &AreaFields,
) -> PolygonSet {
    let mut unnamed = 0usize;
    let mut without_polygon = 0usize;

    let areas: Vec<AdminArea> = collection
        .features
        .into_iter()
        .enumerate()
        .map(|(i, feature)| {
            let properties = feature.properties.unwrap_or_default();
            let name = property_text(&properties, &fields.name).unwrap_or_else(|| {
                unnamed += 1;
                format!("{}_{}", fields.unnamed_prefix, i)
            });
            let geometry = feature.geometry.and_then(to_geo).and_then(to_multipolygon);
            if geometry.is_none() {
                without_polygon += 1;
            }
            AdminArea {
                name,
                province: fields.province.as_deref().and_then(|k| property_text(&properties, k)),
                canton: fields.canton.as_deref().and_then(|k| property_text(&properties, k)),
                geometry,
                properties,
            }
        })
        .collect();

    if unnamed > 0 {
        warn!(
            "[GeometryStore] '{}': {} areas lack '{}' and were given generated names",
            logical_name, unnamed, fields.name
        );
    }
    if without_polygon > 0 {
        warn!(
            "[GeometryStore] '{}': {} areas have no polygon geometry",
            logical_name, without_polygon
        );
    }

    Dataset::new(logical_name, crs, areas)
}

/// Simplify every boundary with tolerance `tolerance`, keeping originals that
/// would degenerate. The result is a new dataset.
pub fn simplify_areas(areas: &PolygonSet, tolerance: f64) -> PolygonSet {
    let mut kept = 0usize;
    let items: Vec<AdminArea> = areas
        .items()
        .iter()
        .map(|area| {
            let simplified = area.geometry.as_ref().and_then(|g| simplify_area(g, tolerance));
            if simplified.is_none() {
                kept += 1;
            }
            AdminArea {
                name: area.name.clone(),
                province: area.province.clone(),
                canton: area.canton.clone(),
                geometry: simplified.or_else(|| area.geometry.clone()),
                properties: area.properties.clone(),
            }
        })
        .collect();

    debug!(
        "[GeometryStore] Simplified '{}' at tolerance {} ({} areas kept unsimplified)",
        areas.name(),
        tolerance,
        kept
    );
    areas.derive(areas.crs().clone(), items)
}

// ============================================================================
// Unit Tests
// ============================================================================
