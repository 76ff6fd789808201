//! Aggregate synthetic population samples into cantons and parishes.
//!
//! Builds a throwaway data directory, then runs both aggregation families
//! through `DensityService` and prints the ranked tables.
//!
//! Run with: cargo run --example aggregate_demo
//! Set RUST_LOG=info to see loader and aggregation logs.

use std::fs;
use std::path::Path;

use density_atlas::{AreaLevel, DensityConfig, DensityService};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

fn rect(props: Value, min_x: f64, min_y: f64, size: f64) -> Value {
    let (max_x, max_y) = (min_x + size, min_y + size);
    json!({
        "type": "Feature",
        "properties": props,
        "geometry": {
            "type": "Polygon",
            "coordinates": [[[min_x, min_y], [max_x, min_y], [max_x, max_y], [min_x, max_y], [min_x, min_y]]]
        }
    })
}

fn write(dir: &Path, name: &str, features: Vec<Value>) -> std::io::Result<()> {
    let body = json!({"type": "FeatureCollection", "features": features});
    fs::write(dir.join(name), body.to_string())
}

fn build_data(dir: &Path) -> std::io::Result<()> {
    // 3x3 cantons of one degree, each split into four parishes.
    let provinces = [("17", "PICHINCHA"), ("09", "GUAYAS"), ("01", "AZUAY")];
    let mut cantons = Vec::new();
    let mut parishes = Vec::new();
    for row in 0..3 {
        let (code, province) = provinces[row];
        for col in 0..3 {
            let x0 = -80.0 + col as f64;
            let y0 = -3.0 + row as f64;
            let canton = format!("CANTON {}-{}", row, col);
            cantons.push(rect(
                json!({"DPA_DESCAN": canton, "DPA_DESPRO": province, "DPA_PROVIN": code}),
                x0,
                y0,
                1.0,
            ));
            for (i, (dx, dy)) in [(0.0, 0.0), (0.5, 0.0), (0.0, 0.5), (0.5, 0.5)].iter().enumerate() {
                parishes.push(rect(
                    json!({
                        "PARROQUIA": format!("PARISH {}-{}-{}", row, col, i),
                        "PROVINCIA": province,
                        "CANTON": canton,
                    }),
                    x0 + dx,
                    y0 + dy,
                    0.5,
                ));
            }
        }
    }

    // Denser population towards the north-east corner.
    let mut rng = StdRng::seed_from_u64(7);
    let points: Vec<Value> = (0..20_000)
        .map(|_| {
            let x: f64 = rng.gen_range(-80.5..-76.5);
            let y: f64 = rng.gen_range(-3.5..0.5);
            let population = ((x + 81.0) * (y + 4.0)).powi(2) * rng.gen_range(0.5..1.5);
            json!({
                "type": "Feature",
                "properties": {"population": population, "region": "continental"},
                "geometry": {"type": "Point", "coordinates": [x, y]}
            })
        })
        .collect();

    write(dir, "cantones.geojson", cantons)?;
    write(dir, "parroquiasEcuador.geojson", parishes)?;
    write(dir, "poblacion_ecuador_realistic.geojson", points)?;
    write(dir, "ec.json", vec![rect(json!({"name": "Ecuador"}), -80.0, -3.0, 3.0)])?;
    Ok(())
}

fn print_table(service: &DensityService, level: AreaLevel, rows: usize) {
    let records = service.population_by_area(level);
    println!("Top {} of {} {} records:", rows.min(records.len()), records.len(), level.label());
    for (rank, record) in records.iter().take(rows).enumerate() {
        println!(
            "  {:>2}. {:<20} {:<10} {:>12}  ({} points)",
            rank + 1,
            record.name,
            record.province.as_deref().unwrap_or("-"),
            record.formatted_population,
            record.points_count
        );
    }
    println!();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let dir = tempfile::tempdir()?;
    build_data(dir.path())?;

    let config = DensityConfig {
        data_dirs: vec![dir.path().to_path_buf()],
        ..DensityConfig::default()
    };
    let service = DensityService::from_config(config);

    println!("Density Atlas demo\n");
    for level in AreaLevel::ALL {
        print_table(&service, level, 10);
    }

    let layer = service.point_layer()?;
    println!(
        "Point layer: {} of 20000 samples inside the outline, {} shown on the map",
        layer.points.len(),
        service.map_points().len()
    );

    println!("\nProvinces:");
    for province in service.provinces() {
        let cantons = service.areas_in_province(AreaLevel::Canton, &province.code)?;
        println!("  {} {:<10} {} cantons", province.code, province.name, cantons.len());
    }

    // Served from cache the second time.
    service.population_by_area(AreaLevel::Canton);
    println!("\nResult cache: {:?}", service.result_cache_stats());
    Ok(())
}
