//! Configuration for loading, aggregation and display.
//!
//! Every struct implements [`Default`] with the values used in production and
//! deserializes with `#[serde(default)]`, so a host only needs to specify what it
//! overrides.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which administrative level an aggregation runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AreaLevel {
    Canton,
    Parish,
}

impl AreaLevel {
    pub const ALL: [AreaLevel; 2] = [AreaLevel::Canton, AreaLevel::Parish];

    pub fn label(self) -> &'static str {
        match self {
            AreaLevel::Canton => "canton",
            AreaLevel::Parish => "parish",
        }
    }
}

/// How to treat two areas with the same name in one aggregation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateNames {
    /// The later area's totals replace the earlier one's
    #[default]
    LastWriteWins,
    /// Totals of all areas sharing the name are summed
    Merge,
}

/// Attribute names used to read an area dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AreaFields {
    /// Attribute holding the area name (the identity key)
    pub name: String,
    /// Attribute holding the parent province name
    pub province: Option<String>,
    /// Attribute holding the parent canton name
    pub canton: Option<String>,
    /// Attribute holding the two-digit province code
    pub province_code: Option<String>,
    /// Prefix for areas without a name: `{prefix}_{feature index}`
    pub unnamed_prefix: String,
}

impl AreaFields {
    /// Canton boundaries (INEC DPA attributes).
    pub fn canton() -> Self {
        Self {
            name: "DPA_DESCAN".to_string(),
            province: Some("DPA_DESPRO".to_string()),
            canton: None,
            province_code: Some("DPA_PROVIN".to_string()),
            unnamed_prefix: "Canton".to_string(),
        }
    }

    /// Parish boundaries.
    pub fn parish() -> Self {
        Self {
            name: "PARROQUIA".to_string(),
            province: Some("PROVINCIA".to_string()),
            canton: Some("CANTON".to_string()),
            province_code: Some("DPA_PROVIN".to_string()),
            unnamed_prefix: "Parroquia".to_string(),
        }
    }

    /// Only a name attribute.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            province: None,
            canton: None,
            province_code: None,
            unnamed_prefix: "Area".to_string(),
        }
    }
}

impl Default for AreaFields {
    fn default() -> Self {
        Self::named("name")
    }
}

/// Candidate variants tried after the exact file name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Suffixes inserted before the extension, in order.
    /// Default: `["_simple", "_minimal"]`
    pub suffixes: Vec<String>,
    /// Boundary file tried last for point datasets.
    /// Default: `cantones.geojson`
    pub point_last_resort: Option<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            suffixes: vec!["_simple".to_string(), "_minimal".to_string()],
            point_last_resort: Some("cantones.geojson".to_string()),
        }
    }
}

/// Logical dataset names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetNames {
    pub points: String,
    /// National outline used to drop points outside the country
    pub outline: Option<String>,
    pub cantons: String,
    pub parishes: String,
}

impl Default for DatasetNames {
    fn default() -> Self {
        Self {
            points: "poblacion_ecuador_realistic.geojson".to_string(),
            outline: Some("ec.json".to_string()),
            cantons: "cantones.geojson".to_string(),
            parishes: "parroquiasEcuador.geojson".to_string(),
        }
    }
}

/// Map display subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Maximum points sent to the map.
    /// Default: 50000
    pub max_points: usize,
    /// Limit used on constrained hosting.
    /// Default: 25000
    pub constrained_max_points: usize,
    /// Use `constrained_max_points` instead of `max_points`.
    pub constrained: bool,
    /// Share of the subset taken from the highest-population points.
    /// Default: 0.7
    pub high_share: f64,
    /// Seed for sampling the remainder.
    /// Default: 42
    pub seed: u64,
}

impl DisplayConfig {
    /// The point limit in effect.
    pub fn limit(&self) -> usize {
        if self.constrained {
            self.constrained_max_points
        } else {
            self.max_points
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            max_points: 50_000,
            constrained_max_points: 25_000,
            constrained: false,
            high_share: 0.7,
            seed: 42,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityConfig {
    /// Data directories probed in order; the first that exists is used.
    pub data_dirs: Vec<PathBuf>,
    pub fallback: FallbackConfig,
    pub datasets: DatasetNames,
    pub canton_fields: AreaFields,
    pub parish_fields: AreaFields,
    /// Douglas-Peucker tolerance (degrees) for parish boundaries.
    /// Default: 0.001
    pub parish_simplify_tolerance: Option<f64>,
    pub display: DisplayConfig,
    pub duplicate_names: DuplicateNames,
    /// Thousands separator for formatted populations.
    /// Default: '.'
    pub thousands_separator: char,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            data_dirs: vec![
                PathBuf::from("/app/data"),
                PathBuf::from("./data"),
                PathBuf::from("../data"),
            ],
            fallback: FallbackConfig::default(),
            datasets: DatasetNames::default(),
            canton_fields: AreaFields::canton(),
            parish_fields: AreaFields::parish(),
            parish_simplify_tolerance: Some(0.001),
            display: DisplayConfig::default(),
            duplicate_names: DuplicateNames::default(),
            thousands_separator: '.',
        }
    }
}

/// Prepended to `data_dirs` when set.
pub const DATA_DIR_ENV: &str = "DENSITY_ATLAS_DATA_DIR";
/// Presence switches the display subset to its constrained limit.
pub const CONSTRAINED_ENV: &str = "RAILWAY_ENVIRONMENT";

impl DensityConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an environment lookup.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|d| !d.trim().is_empty()) {
            self.data_dirs.insert(0, PathBuf::from(dir));
        }
        if lookup(CONSTRAINED_ENV).is_some() {
            self.display.constrained = true;
        }
        self
    }

    /// Logical dataset name, attribute names and simplification tolerance for a level.
    pub fn area_source(&self, level: AreaLevel) -> (&str, &AreaFields, Option<f64>) {
        match level {
            AreaLevel::Canton => (&self.datasets.cantons, &self.canton_fields, None),
            AreaLevel::Parish => (
                &self.datasets.parishes,
                &self.parish_fields,
                self.parish_simplify_tolerance,
            ),
        }
    }
}
