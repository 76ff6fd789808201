//! # Density Service
//!
//! Owns the loaded datasets, indexes and aggregation results for one process.
//!
//! The service is an explicit object with injected dependencies (a
//! [`DatasetSource`] and an index builder), so every test can construct a fresh
//! instance. Canton and parish views share one aggregation path that differs
//! only in the [`AreaLevel`] it is asked for.
//!
//! ## Caches
//!
//! | Cache | Key | Holds |
//! |-------|-----|-------|
//! | point layer | logical point dataset name | outline-filtered points + index |
//! | area layers | [`AreaLevel`] | loaded (and simplified) boundaries |
//! | results | level + area dataset id + point dataset id | [`AggregationResult`] |
//! | display | logical point dataset name | styled map subset |
//!
//! Failed loads are never cached; the next request retries them.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;

use crate::aggregate::{clip_to_outline, AggregationResult, PopulationRecord};
use crate::cache::ResultCache;
use crate::config::{AreaFields, AreaLevel, DensityConfig};
use crate::crs::{normalize, Crs, Reproject};
use crate::display::{sample_for_display, style_points, StyledPoint};
use crate::error::{LoadResult, ServiceError};
use crate::index::PointIndex;
use crate::store::{simplify_areas, DatasetSource, GeometryStore};
use crate::{AdminArea, DatasetId, PointSet, PolygonSet};

/// Builds the spatial index for a freshly loaded point set.
pub type IndexBuilder = Arc<dyn Fn(&PointSet) -> PointIndex + Send + Sync>;

/// Number of provinces; valid codes are `01` to `24`.
pub const PROVINCE_COUNT: u32 = 24;

/// Points ready for aggregation, with the index built over them.
#[derive(Debug)]
pub struct PointLayer {
    pub points: Arc<PointSet>,
    pub index: Arc<PointIndex>,
}

/// A province from the canton catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Province {
    /// Two-digit code, e.g. `"17"`
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AggregationKey {
    level: AreaLevel,
    areas: DatasetId,
    points: DatasetId,
}

/// Aggregation, display and catalogue queries over one data source.
pub struct DensityService<S: DatasetSource = GeometryStore> {
    source: S,
    config: DensityConfig,
    index_builder: IndexBuilder,
    point_layers: ResultCache<String, Arc<PointLayer>>,
    area_layers: ResultCache<AreaLevel, Arc<PolygonSet>>,
    results: ResultCache<AggregationKey, Arc<AggregationResult>>,
    display: ResultCache<String, Arc<Vec<StyledPoint>>>,
}

impl DensityService<GeometryStore> {
    /// Service reading from the data directories named in `config`.
    pub fn from_config(config: DensityConfig) -> Self {
        let store = GeometryStore::new(&config);
        Self::new(store, config)
    }
}

impl<S: DatasetSource> DensityService<S> {
    pub fn new(source: S, config: DensityConfig) -> Self {
        let index_builder: IndexBuilder = Arc::new(PointIndex::build);
        Self {
            source,
            config,
            index_builder,
            point_layers: ResultCache::new(),
            area_layers: ResultCache::new(),
            results: ResultCache::new(),
            display: ResultCache::new(),
        }
    }

    /// Replace the index builder.
    pub fn with_index_builder(mut self, builder: IndexBuilder) -> Self {
        self.index_builder = builder;
        self
    }

    pub fn config(&self) -> &DensityConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    // ------------------------------------------------------------------------
    // Layers
    // ------------------------------------------------------------------------

    /// The outline-filtered point set and its index, loading on first use.
    pub fn point_layer(&self) -> LoadResult<Arc<PointLayer>> {
        let name = self.config.datasets.points.clone();
        self.point_layers.get_or_try_compute(name.clone(), || {
            let loaded = self.source.load_points(&name)?;
            let points = self.clip_to_national_outline(loaded);
            let index = (self.index_builder)(&points);
            info!(
                "[DensityService] Point layer ready: {} points ({} indexed), total weight {:.0}",
                points.len(),
                index.len(),
                points.total_weight()
            );
            Ok(Arc::new(PointLayer {
                points: Arc::new(points),
                index: Arc::new(index),
            }))
        })
    }

    /// Boundaries for `level`, loading on first use.
    pub fn area_layer(&self, level: AreaLevel) -> LoadResult<Arc<PolygonSet>> {
        self.area_layers.get_or_try_compute(level, || {
            let (name, fields, tolerance) = self.config.area_source(level);
            let areas = self.source.load_polygons(name, fields)?;
            let areas = match tolerance {
                Some(t) => simplify_areas(&areas, t),
                None => areas,
            };
            Ok(Arc::new(areas))
        })
    }

    /// Restrict points to the national outline.
    ///
    /// Degrades to the unfiltered set when the outline is unavailable or the
    /// points cannot be brought into its CRS.
    fn clip_to_national_outline(&self, points: PointSet) -> PointSet {
        let Some(outline_name) = self.config.datasets.outline.as_deref() else {
            return points;
        };
        let outline = match self.source.load_polygons(outline_name, &AreaFields::default()) {
            Ok(outline) => Arc::new(outline),
            Err(e) => {
                warn!(
                    "[DensityService] National outline unavailable, keeping all {} points: {}",
                    points.len(),
                    e
                );
                return points;
            }
        };

        let points = Arc::new(points);
        match normalize(Arc::clone(&points), outline) {
            Ok((points, outline)) => clip_to_outline(&points, &outline),
            Err(e) => {
                error!(
                    "[DensityService] Cannot bring points into the outline CRS ({}); points are unfiltered and results are approximate",
                    e
                );
                Arc::unwrap_or_clone(points)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Aggregation
    // ------------------------------------------------------------------------

    /// Ranked totals for `level`, or `None` when a dataset is unavailable.
    pub fn aggregation(&self, level: AreaLevel) -> Option<Arc<AggregationResult>> {
        let layer = self.point_layer().ok()?;
        let areas = self.area_layer(level).ok()?;

        let key = AggregationKey {
            level,
            areas: areas.id(),
            points: layer.points.id(),
        };
        self.prune_superseded(&key);

        let outcome = self.results.get_or_try_compute(key, || {
            let areas = match normalize(Arc::clone(&areas), Arc::clone(&layer.points)) {
                Ok((normalized, _)) => normalized,
                Err(e) => {
                    error!(
                        "[DensityService] Cannot bring {} areas into {} ({}); using them unnormalized, results are approximate",
                        level.label(),
                        layer.points.crs(),
                        e
                    );
                    Arc::clone(&areas)
                }
            };
            self.run_aggregation(&areas, &layer).map(Arc::new)
        });

        match outcome {
            Ok(result) => Some(result),
            Err(e) => {
                error!("[DensityService] {} aggregation failed: {}", level.label(), e);
                None
            }
        }
    }

    /// Drop results of `key.level` computed from datasets older than the ones in `key`.
    ///
    /// Dataset ids only grow, so a caller still holding older datasets never
    /// evicts a result (or pending computation) built from newer ones.
    fn prune_superseded(&self, key: &AggregationKey) -> usize {
        self.results
            .invalidate_where(|k| k.level == key.level && (k.areas < key.areas || k.points < key.points))
    }

    #[cfg(feature = "parallel")]
    fn run_aggregation(
        &self,
        areas: &PolygonSet,
        layer: &PointLayer,
    ) -> Result<AggregationResult, crate::error::AggregateError> {
        crate::aggregate::aggregate_parallel(areas, &layer.points, &layer.index, self.config.duplicate_names)
    }

    #[cfg(not(feature = "parallel"))]
    fn run_aggregation(
        &self,
        areas: &PolygonSet,
        layer: &PointLayer,
    ) -> Result<AggregationResult, crate::error::AggregateError> {
        crate::aggregate::aggregate_with(areas, &layer.points, &layer.index, self.config.duplicate_names)
    }

    /// Output records for `level`, ranked by population. Empty when data is unavailable.
    pub fn population_by_area(&self, level: AreaLevel) -> Vec<PopulationRecord> {
        self.aggregation(level)
            .map(|result| result.to_records(self.config.thousands_separator))
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Display
    // ------------------------------------------------------------------------

    /// Styled display subset of the point layer, in WGS 84.
    pub fn map_points(&self) -> Arc<Vec<StyledPoint>> {
        let name = self.config.datasets.points.clone();
        let outcome = self.display.get_or_try_compute(name, || {
            let layer = self.point_layer()?;
            let display = &self.config.display;
            let mut subset = sample_for_display(
                layer.points.items(),
                display.limit(),
                display.high_share,
                display.seed,
            );

            let crs = layer.points.crs();
            if *crs != Crs::Wgs84 {
                let before = subset.len();
                subset = subset
                    .iter()
                    .filter_map(|p| p.reproject(crs, &Crs::Wgs84).ok())
                    .collect();
                if subset.len() < before {
                    warn!(
                        "[DensityService] Dropped {} display points that could not be converted from {}",
                        before - subset.len(),
                        crs
                    );
                }
            }
            Ok::<_, crate::error::LoadError>(Arc::new(style_points(&subset)))
        });
        outcome.unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Province Catalogue
    // ------------------------------------------------------------------------

    /// Provinces listed in the canton dataset, sorted by code.
    pub fn provinces(&self) -> Vec<Province> {
        let Ok(cantons) = self.area_layer(AreaLevel::Canton) else {
            return Vec::new();
        };
        let Some(code_field) = self.config.canton_fields.province_code.as_deref() else {
            return Vec::new();
        };

        let mut catalogue: BTreeMap<String, String> = BTreeMap::new();
        for area in cantons.items() {
            if let (Some(code), Some(name)) = (province_code_of(area, code_field), &area.province) {
                catalogue.entry(code).or_insert_with(|| name.clone());
            }
        }
        catalogue
            .into_iter()
            .map(|(code, name)| Province { code, name })
            .collect()
    }

    /// Names of the `level` areas in province `code` (`1` to `24`), in dataset order.
    ///
    /// Areas are matched on their province code attribute when they carry one,
    /// otherwise on the province name from the canton catalogue.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidProvince`] when `code` is not a number in range.
    pub fn areas_in_province(&self, level: AreaLevel, code: &str) -> Result<Vec<String>, ServiceError> {
        let code = parse_province_code(code)?;
        let Ok(areas) = self.area_layer(level) else {
            return Ok(Vec::new());
        };

        let fields = match level {
            AreaLevel::Canton => &self.config.canton_fields,
            AreaLevel::Parish => &self.config.parish_fields,
        };
        let province_name = self
            .provinces()
            .into_iter()
            .find(|p| p.code == code)
            .map(|p| p.name);

        let mut names: Vec<String> = Vec::new();
        for area in areas.items() {
            let by_code = fields
                .province_code
                .as_deref()
                .and_then(|field| province_code_of(area, field));
            let matched = match by_code {
                Some(area_code) => area_code == code,
                None => match (&area.province, &province_name) {
                    (Some(a), Some(p)) => a.eq_ignore_ascii_case(p),
                    _ => false,
                },
            };
            if matched && !names.contains(&area.name) {
                names.push(area.name.clone());
            }
        }
        Ok(names)
    }

    // ------------------------------------------------------------------------
    // Cache Control
    // ------------------------------------------------------------------------

    /// Drop the cached result for `level` and the datasets it was computed from.
    ///
    /// The next request reloads the points and the `level` boundaries and
    /// aggregates again.
    pub fn clear_cache(&self, level: AreaLevel) {
        self.results.invalidate_where(|k| k.level == level);
        self.area_layers.invalidate(&level);
        self.point_layers.invalidate_all();
        self.display.invalidate_all();
        info!("[DensityService] Cleared {} cache", level.label());
    }

    /// Drop everything.
    pub fn clear_all(&self) {
        self.results.invalidate_all();
        self.area_layers.invalidate_all();
        self.point_layers.invalidate_all();
        self.display.invalidate_all();
        info!("[DensityService] Cleared all caches");
    }

    /// Activity counters of the aggregation result cache.
    pub fn result_cache_stats(&self) -> crate::cache::CacheStats {
        self.results.stats()
    }
}

/// Validate a province code and zero-pad it to two digits.
fn parse_province_code(code: &str) -> Result<String, ServiceError> {
    match code.trim().parse::<u32>() {
        Ok(n) if (1..=PROVINCE_COUNT).contains(&n) => Ok(format!("{:02}", n)),
        _ => Err(ServiceError::InvalidProvince(code.to_string())),
    }
}

fn province_code_of(area: &AdminArea, field: &str) -> Option<String> {
    let raw = area.property_str(field)?;
    let raw = raw.trim();
    match raw.parse::<u32>() {
        Ok(n) => Some(format!("{:02}", n)),
        Err(_) if !raw.is_empty() => Some(raw.to_string()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadError;
    use crate::{Dataset, PopulationPoint};
    use geo::{polygon, MultiPolygon};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn square(x0: f64, y0: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0),
            (x: x0 + 1.0, y: y0),
            (x: x0 + 1.0, y: y0 + 1.0),
            (x: x0, y: y0 + 1.0),
        ]])
    }

    fn canton(name: &str, province: &str, code: &str, x0: f64) -> AdminArea {
        let mut area = AdminArea::new(name, square(x0, 0.0)).with_parents(Some(province.to_string()), None);
        area.properties.insert("DPA_PROVIN".to_string(), code.into());
        area
    }

    /// In-memory source that counts loads.
    struct MemorySource {
        points: Vec<PopulationPoint>,
        cantons: Vec<AdminArea>,
        parishes: Vec<AdminArea>,
        outline: Option<Vec<AdminArea>>,
        loads: AtomicUsize,
    }

    impl MemorySource {
        fn new() -> Self {
            Self {
                points: vec![
                    PopulationPoint::new(0.5, 0.5, 100.0),
                    PopulationPoint::new(1.5, 0.5, 40.0),
                    PopulationPoint::new(1.6, 0.4, 2.0),
                    PopulationPoint::new(9.0, 9.0, 500.0),
                ],
                cantons: vec![
                    canton("QUITO", "PICHINCHA", "17", 0.0),
                    canton("CUENCA", "AZUAY", "1", 1.0),
                ],
                parishes: vec![
                    AdminArea::new("CUMBAYA", square(0.0, 0.0))
                        .with_parents(Some("PICHINCHA".to_string()), Some("QUITO".to_string())),
                    AdminArea::new("BANOS", square(1.0, 0.0))
                        .with_parents(Some("AZUAY".to_string()), Some("CUENCA".to_string())),
                ],
                outline: None,
                loads: AtomicUsize::new(0),
            }
        }
    }

    impl DatasetSource for MemorySource {
        fn load_points(&self, logical_name: &str) -> LoadResult<PointSet> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Dataset::new(logical_name, Crs::Wgs84, self.points.clone()))
        }

        fn load_polygons(&self, logical_name: &str, _fields: &AreaFields) -> LoadResult<PolygonSet> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let items = if logical_name == "cantones.geojson" {
                self.cantons.clone()
            } else if logical_name == "parroquiasEcuador.geojson" {
                self.parishes.clone()
            } else {
                match &self.outline {
                    Some(outline) => outline.clone(),
                    None => {
                        return Err(LoadError::Exhausted {
                            logical_name: logical_name.to_string(),
                            attempts: vec![],
                        })
                    }
                }
            };
            Ok(Dataset::new(logical_name, Crs::Wgs84, items))
        }
    }

    #[test]
    fn test_population_by_canton() {
        let service = DensityService::new(MemorySource::new(), DensityConfig::default());
        let records = service.population_by_area(AreaLevel::Canton);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "QUITO");
        assert_eq!(records[0].population, 100);
        assert_eq!(records[0].province.as_deref(), Some("PICHINCHA"));
        assert_eq!(records[1].name, "CUENCA");
        assert_eq!(records[1].population, 42);
        assert_eq!(records[1].points_count, 2);
    }

    #[test]
    fn test_results_are_cached_until_cleared() {
        let service = DensityService::new(MemorySource::new(), DensityConfig::default());
        let first = service.aggregation(AreaLevel::Parish).unwrap();
        let second = service.aggregation(AreaLevel::Parish).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(service.result_cache_stats().computations, 1);

        service.clear_cache(AreaLevel::Parish);
        let third = service.aggregation(AreaLevel::Parish).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(first.entries, third.entries);
        assert_eq!(service.result_cache_stats().computations, 2);
    }

    #[test]
    fn test_clear_reloads_datasets() {
        let service = DensityService::new(MemorySource::new(), DensityConfig::default());
        service.population_by_area(AreaLevel::Canton);
        let loads = service.source().loads.load(Ordering::SeqCst);

        service.population_by_area(AreaLevel::Canton);
        assert_eq!(service.source().loads.load(Ordering::SeqCst), loads);

        service.clear_cache(AreaLevel::Canton);
        service.population_by_area(AreaLevel::Canton);
        assert!(service.source().loads.load(Ordering::SeqCst) > loads);
    }

    #[test]
    fn test_outline_filters_points() {
        let mut source = MemorySource::new();
        source.outline = Some(vec![AdminArea::new("EC", MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 2.0, y: 0.0),
            (x: 2.0, y: 1.0),
            (x: 0.0, y: 1.0),
        ]]))]);
        let service = DensityService::new(source, DensityConfig::default());
        let layer = service.point_layer().unwrap();
        assert_eq!(layer.points.len(), 3);
        assert_eq!(layer.index.dataset(), layer.points.id());
    }

    #[test]
    fn test_missing_data_gives_empty_results() {
        struct Empty;
        impl DatasetSource for Empty {
            fn load_points(&self, name: &str) -> LoadResult<PointSet> {
                Err(LoadError::Exhausted { logical_name: name.to_string(), attempts: vec![] })
            }
            fn load_polygons(&self, name: &str, _: &AreaFields) -> LoadResult<PolygonSet> {
                Err(LoadError::Exhausted { logical_name: name.to_string(), attempts: vec![] })
            }
        }

        let service = DensityService::new(Empty, DensityConfig::default());
        assert!(service.population_by_area(AreaLevel::Parish).is_empty());
        assert!(service.map_points().is_empty());
        assert!(service.provinces().is_empty());
        assert_eq!(service.areas_in_province(AreaLevel::Canton, "17"), Ok(vec![]));
    }

    #[test]
    fn test_injected_index_builder() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let service = DensityService::new(MemorySource::new(), DensityConfig::default())
            .with_index_builder(Arc::new(move |points: &PointSet| {
                counter.fetch_add(1, Ordering::SeqCst);
                PointIndex::build(points)
            }));

        service.population_by_area(AreaLevel::Canton);
        service.population_by_area(AreaLevel::Parish);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_province_catalogue() {
        let service = DensityService::new(MemorySource::new(), DensityConfig::default());
        assert_eq!(
            service.provinces(),
            vec![
                Province { code: "01".to_string(), name: "AZUAY".to_string() },
                Province { code: "17".to_string(), name: "PICHINCHA".to_string() },
            ]
        );

        assert_eq!(service.areas_in_province(AreaLevel::Canton, "1"), Ok(vec!["CUENCA".to_string()]));
        // Parishes carry no code attribute and match on the province name.
        assert_eq!(service.areas_in_province(AreaLevel::Parish, "17"), Ok(vec!["CUMBAYA".to_string()]));
        assert_eq!(service.areas_in_province(AreaLevel::Parish, "5"), Ok(vec![]));
    }

    #[test]
    fn test_invalid_province_codes() {
        let service = DensityService::new(MemorySource::new(), DensityConfig::default());
        for bad in ["0", "25", "abc", "", "-3"] {
            assert_eq!(
                service.areas_in_province(AreaLevel::Parish, bad),
                Err(ServiceError::InvalidProvince(bad.to_string()))
            );
        }
    }

    fn key(level: AreaLevel) -> AggregationKey {
        AggregationKey {
            level,
            areas: DatasetId::next(),
            points: DatasetId::next(),
        }
    }

    #[test]
    fn test_prune_only_drops_older_results() {
        let service = DensityService::new(MemorySource::new(), DensityConfig::default());
        let old = key(AreaLevel::Canton);
        let new = key(AreaLevel::Canton);
        let parish = AggregationKey { level: AreaLevel::Parish, ..old };
        for k in [old, new, parish] {
            service.results.get_or_compute(k, || Arc::new(AggregationResult::default()));
        }

        assert_eq!(service.prune_superseded(&old), 0);
        assert!(service.results.get(&new).is_some());

        assert_eq!(service.prune_superseded(&new), 1);
        assert!(service.results.get(&old).is_none());
        assert!(service.results.get(&new).is_some());
        assert!(service.results.get(&parish).is_some());
    }

    #[test]
    fn test_stale_caller_keeps_pending_newer_result() {
        use std::sync::mpsc;

        let service = DensityService::new(MemorySource::new(), DensityConfig::default());
        let old = key(AreaLevel::Canton);
        let new = key(AreaLevel::Canton);
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let service = &service;

        std::thread::scope(|scope| {
            let worker = scope.spawn(move || {
                service.results.get_or_compute(new, || {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Arc::new(AggregationResult::default())
                })
            });

            started_rx.recv().unwrap();
            assert_eq!(service.prune_superseded(&old), 0);
            release_tx.send(()).unwrap();
            worker.join().unwrap();
        });

        assert!(service.results.get(&new).is_some());
        assert_eq!(service.result_cache_stats().discarded, 0);
    }

    #[test]
    fn test_map_points_styled() {
        let service = DensityService::new(MemorySource::new(), DensityConfig::default());
        let styled = service.map_points();
        assert_eq!(styled.len(), 4);
        assert!(styled.iter().any(|p| p.color == "#ffff00"));
        assert!(Arc::ptr_eq(&styled, &service.map_points()));
    }
}
