//! End-to-end tests: GeoJSON files on disk through `DensityService`.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;

use density_atlas::crs::transform_coord;
use density_atlas::{AreaLevel, Crs, DensityConfig, DensityService, DuplicateNames};
use geo::Coord;
use serde_json::{json, Value};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn rect(props: Value, min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Value {
    json!({
        "type": "Feature",
        "properties": props,
        "geometry": {
            "type": "Polygon",
            "coordinates": [[[min_x, min_y], [max_x, min_y], [max_x, max_y], [min_x, max_y], [min_x, min_y]]]
        }
    })
}

fn point(x: f64, y: f64, population: Value) -> Value {
    json!({
        "type": "Feature",
        "properties": {"population": population, "region": "continental"},
        "geometry": {"type": "Point", "coordinates": [x, y]}
    })
}

fn write_collection(dir: &Path, name: &str, features: Vec<Value>) {
    let body = json!({"type": "FeatureCollection", "features": features});
    fs::write(dir.join(name), body.to_string()).unwrap();
}

/// Population samples in WGS 84: two in Quito, one in Cuenca, one outside the country.
fn population() -> Vec<(f64, f64, Value)> {
    vec![
        (-78.5, -0.2, json!(1000)),
        (-78.4, -0.3, json!("250.5")),
        (-79.5, -2.5, json!(300)),
        (-70.0, 0.0, json!(9999)),
    ]
}

/// A data directory where the full point file is corrupt and the `_simple` variant is valid.
fn data_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    let path = dir.path();

    fs::write(path.join("poblacion_ecuador_realistic.geojson"), "").unwrap();
    write_collection(
        path,
        "poblacion_ecuador_realistic_simple.geojson",
        population().into_iter().map(|(x, y, w)| point(x, y, w)).collect(),
    );
    write_collection(
        path,
        "ec.json",
        vec![rect(json!({"name": "Ecuador"}), -81.0, -5.0, -75.0, 2.0)],
    );
    write_collection(
        path,
        "cantones.geojson",
        vec![
            rect(
                json!({"DPA_DESCAN": "QUITO", "DPA_DESPRO": "PICHINCHA", "DPA_PROVIN": "17"}),
                -79.0, -1.0, -78.0, 0.0,
            ),
            rect(
                json!({"DPA_DESCAN": "CUENCA", "DPA_DESPRO": "AZUAY", "DPA_PROVIN": "01"}),
                -80.0, -3.0, -79.0, -2.0,
            ),
            rect(
                json!({"DPA_DESCAN": "MACHALA", "DPA_DESPRO": "EL ORO", "DPA_PROVIN": "07"}),
                -80.5, -3.5, -80.0, -3.0,
            ),
        ],
    );
    write_collection(
        path,
        "parroquiasEcuador.geojson",
        vec![
            rect(
                json!({"PARROQUIA": "CUMBAYA", "PROVINCIA": "PICHINCHA", "CANTON": "QUITO"}),
                -78.6, -0.4, -78.3, -0.1,
            ),
            rect(
                json!({"PARROQUIA": "CUMBAYA", "PROVINCIA": "AZUAY", "CANTON": "CUENCA"}),
                -79.6, -2.6, -79.4, -2.4,
            ),
        ],
    );
    dir
}

fn config_for(dir: &TempDir) -> DensityConfig {
    DensityConfig {
        data_dirs: vec![dir.path().to_path_buf()],
        ..DensityConfig::default()
    }
}

#[test]
fn test_canton_records_end_to_end() {
    init_logging();
    let dir = data_dir();
    let service = DensityService::from_config(config_for(&dir));

    let records = service.population_by_area(AreaLevel::Canton);
    assert_eq!(records.len(), 3);

    assert_eq!(records[0].name, "QUITO");
    assert_eq!(records[0].province.as_deref(), Some("PICHINCHA"));
    assert_eq!(records[0].population, 1250);
    assert_eq!(records[0].formatted_population, "1.250");
    assert_eq!(records[0].points_count, 2);

    assert_eq!(records[1].name, "CUENCA");
    assert_eq!(records[1].population, 300);

    assert_eq!(records[2].name, "MACHALA");
    assert_eq!(records[2].population, 0);
    assert_eq!(records[2].points_count, 0);

    // The point outside the outline was dropped before aggregation.
    let layer = service.point_layer().unwrap();
    assert_eq!(layer.points.len(), 3);
    assert!(layer
        .points
        .source()
        .unwrap()
        .ends_with("poblacion_ecuador_realistic_simple.geojson"));
}

#[test]
fn test_parish_duplicates_last_write_wins() {
    init_logging();
    let dir = data_dir();
    let service = DensityService::from_config(config_for(&dir));

    let records = service.population_by_area(AreaLevel::Parish);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "CUMBAYA");
    assert_eq!(records[0].province.as_deref(), Some("AZUAY"));
    assert_eq!(records[0].population, 300);

    let result = service.aggregation(AreaLevel::Parish).unwrap();
    assert_eq!(result.duplicate_names, vec!["CUMBAYA".to_string()]);
}

#[test]
fn test_parish_duplicates_merged() {
    init_logging();
    let dir = data_dir();
    let config = DensityConfig {
        duplicate_names: DuplicateNames::Merge,
        ..config_for(&dir)
    };
    let service = DensityService::from_config(config);

    let records = service.population_by_area(AreaLevel::Parish);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].population, 1550);
    assert_eq!(records[0].points_count, 3);
}

#[test]
fn test_concurrent_requests_aggregate_once() {
    init_logging();
    let dir = data_dir();
    let service = Arc::new(DensityService::from_config(config_for(&dir)));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = Arc::clone(&service);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                service.population_by_area(AreaLevel::Canton)
            })
        })
        .collect();

    let outputs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for output in &outputs[1..] {
        assert_eq!(output, &outputs[0]);
    }
    assert_eq!(service.result_cache_stats().computations, 1);
}

#[test]
fn test_clear_cache_picks_up_new_data() {
    init_logging();
    let dir = data_dir();
    let service = DensityService::from_config(config_for(&dir));
    assert_eq!(service.population_by_area(AreaLevel::Canton)[1].population, 300);

    write_collection(
        dir.path(),
        "poblacion_ecuador_realistic_simple.geojson",
        vec![point(-79.5, -2.5, json!(5000))],
    );

    // Still cached.
    assert_eq!(service.population_by_area(AreaLevel::Canton)[1].population, 300);

    service.clear_cache(AreaLevel::Canton);
    let records = service.population_by_area(AreaLevel::Canton);
    assert_eq!(records[0].name, "CUENCA");
    assert_eq!(records[0].population, 5000);
}

#[test]
fn test_mercator_points_are_normalized() {
    init_logging();
    let dir = data_dir();

    let features: Vec<Value> = population()
        .into_iter()
        .map(|(x, y, w)| {
            let c = transform_coord(Coord { x, y }, &Crs::Wgs84, &Crs::WebMercator).unwrap();
            point(c.x, c.y, w)
        })
        .collect();
    let body = json!({
        "type": "FeatureCollection",
        "crs": {"type": "name", "properties": {"name": "EPSG:3857"}},
        "features": features
    });
    fs::write(
        dir.path().join("poblacion_ecuador_realistic_simple.geojson"),
        body.to_string(),
    )
    .unwrap();

    let service = DensityService::from_config(config_for(&dir));
    let records = service.population_by_area(AreaLevel::Canton);
    assert_eq!(records[0].name, "QUITO");
    assert_eq!(records[0].population, 1250);
    assert_eq!(records[1].population, 300);

    // Display points come back in longitude/latitude.
    let styled = service.map_points();
    assert_eq!(styled.len(), 3);
    assert!(styled.iter().all(|p| p.longitude > -81.0 && p.longitude < -75.0));
}

#[test]
fn test_unsupported_point_crs_degrades_to_unfiltered() {
    init_logging();
    let dir = data_dir();

    let features: Vec<Value> = population()
        .into_iter()
        .map(|(x, y, w)| point(x, y, w))
        .collect();
    let body = json!({
        "type": "FeatureCollection",
        "crs": {"type": "name", "properties": {"name": "urn:ogc:def:crs:EPSG::32717"}},
        "features": features
    });
    fs::write(
        dir.path().join("poblacion_ecuador_realistic_simple.geojson"),
        body.to_string(),
    )
    .unwrap();

    let service = DensityService::from_config(config_for(&dir));

    // No outline filter could be applied: the point outside the country stays.
    let layer = service.point_layer().unwrap();
    assert_eq!(layer.points.crs(), &Crs::Epsg(32717));
    assert_eq!(layer.points.len(), 4);

    // Areas are compared unnormalized, and every canton still gets an entry.
    let records = service.population_by_area(AreaLevel::Canton);
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].name, "QUITO");
    assert_eq!(records[0].population, 1250);
    assert_eq!(records[1].name, "CUENCA");
    assert_eq!(records[1].population, 300);
    assert_eq!(records[2].name, "MACHALA");
    assert_eq!(records[2].population, 0);
    assert_eq!(records[2].points_count, 0);
}

#[test]
fn test_missing_data_directory_degrades() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let config = DensityConfig {
        data_dirs: vec![dir.path().join("nowhere")],
        ..DensityConfig::default()
    };
    let service = DensityService::from_config(config);

    assert!(service.population_by_area(AreaLevel::Canton).is_empty());
    assert!(service.population_by_area(AreaLevel::Parish).is_empty());
    assert!(service.map_points().is_empty());
}

#[test]
fn test_province_listing() {
    init_logging();
    let dir = data_dir();
    let service = DensityService::from_config(config_for(&dir));

    let codes: Vec<String> = service.provinces().into_iter().map(|p| p.code).collect();
    assert_eq!(codes, vec!["01", "07", "17"]);

    assert_eq!(
        service.areas_in_province(AreaLevel::Canton, "17").unwrap(),
        vec!["QUITO".to_string()]
    );
    assert_eq!(
        service.areas_in_province(AreaLevel::Parish, "1").unwrap(),
        vec!["CUMBAYA".to_string()]
    );
    assert!(service.areas_in_province(AreaLevel::Parish, "30").is_err());
}
