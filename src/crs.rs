//! # Coordinate Reference Systems
//!
//! Datasets carry the CRS their coordinates are expressed in. Before points are
//! compared against boundaries, both sides must agree; [`normalize`] reprojects
//! the first dataset onto the second when they differ.
//!
//! Supported transforms:
//!
//! | From | To | Notes |
//! |------|----|-------|
//! | EPSG:4326 | EPSG:3857 | spherical Web Mercator, fails at the poles |
//! | EPSG:3857 | EPSG:4326 | inverse Web Mercator |
//!
//! Any other pair yields [`CrsError::UnsupportedTransform`].

use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

use geo::{Coord, MapCoords};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::CrsError;
use crate::{AdminArea, Dataset, PopulationPoint};

/// WGS84 semi-major axis used by spherical Web Mercator.
const EARTH_RADIUS: f64 = 6_378_137.0;

/// A coordinate reference system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Crs {
    /// Geographic longitude/latitude in degrees (EPSG:4326, OGC CRS84)
    #[default]
    Wgs84,
    /// Spherical Web Mercator in meters (EPSG:3857 and its legacy aliases)
    WebMercator,
    /// Any other EPSG code; carried through but never transformed
    Epsg(u32),
}

impl Crs {
    /// Create a CRS from an EPSG code, folding known aliases.
    pub fn from_epsg(code: u32) -> Self {
        match code {
            4326 => Crs::Wgs84,
            3857 | 3785 | 900913 | 102100 | 102113 => Crs::WebMercator,
            other => Crs::Epsg(other),
        }
    }

    /// The canonical EPSG code.
    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::WebMercator => 3857,
            Crs::Epsg(code) => *code,
        }
    }

    /// Parse identifiers such as `EPSG:4326`, `urn:ogc:def:crs:EPSG::3857`
    /// or `urn:ogc:def:crs:OGC:1.3:CRS84`.
    ///
    /// # Example
    /// ```
    /// use density_atlas::Crs;
    /// assert_eq!(Crs::parse("urn:ogc:def:crs:EPSG::3857").unwrap(), Crs::WebMercator);
    /// assert_eq!(Crs::parse("OGC:CRS84").unwrap(), Crs::Wgs84);
    /// ```
    pub fn parse(identifier: &str) -> Result<Self, CrsError> {
        let upper = identifier.trim().to_ascii_uppercase();
        if upper.ends_with("CRS84") {
            return Ok(Crs::Wgs84);
        }
        if !upper.contains("EPSG") {
            return Err(CrsError::Unrecognized(identifier.to_string()));
        }
        upper
            .rsplit(':')
            .next()
            .and_then(|code| code.trim().parse::<u32>().ok())
            .map(Crs::from_epsg)
            .ok_or_else(|| CrsError::Unrecognized(identifier.to_string()))
    }

    /// Read a legacy GeoJSON `crs` member.
    ///
    /// Accepts the `name` form (`{"type":"name","properties":{"name":"EPSG:3857"}}`)
    /// and the `EPSG` form (`{"type":"EPSG","properties":{"code":3857}}`).
    pub fn from_geojson_member(member: &serde_json::Value) -> Result<Self, CrsError> {
        let properties = member.get("properties");
        if let Some(name) = properties.and_then(|p| p.get("name")).and_then(|n| n.as_str()) {
            return Crs::parse(name);
        }
        if let Some(code) = properties.and_then(|p| p.get("code")).and_then(|c| c.as_u64()) {
            return u32::try_from(code)
                .map(Crs::from_epsg)
                .map_err(|_| CrsError::Unrecognized(member.to_string()));
        }
        Err(CrsError::Unrecognized(member.to_string()))
    }

    /// Whether coordinates can be moved from `self` into `to`.
    pub fn can_transform(&self, to: &Crs) -> bool {
        self == to
            || matches!(
                (self, to),
                (Crs::Wgs84, Crs::WebMercator) | (Crs::WebMercator, Crs::Wgs84)
            )
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

/// Transform a single coordinate between two CRSs.
pub fn transform_coord(coord: Coord<f64>, from: &Crs, to: &Crs) -> Result<Coord<f64>, CrsError> {
    if from == to {
        return Ok(coord);
    }

    let out = match (from, to) {
        (Crs::Wgs84, Crs::WebMercator) => {
            if coord.y.abs() >= 90.0 {
                return Err(CrsError::NonFiniteCoordinate { x: coord.x, y: coord.y });
            }
            let lat_rad = coord.y.to_radians();
            Coord {
                x: EARTH_RADIUS * coord.x.to_radians(),
                y: EARTH_RADIUS * (PI / 4.0 + lat_rad / 2.0).tan().ln(),
            }
        }
        (Crs::WebMercator, Crs::Wgs84) => Coord {
            x: (coord.x / EARTH_RADIUS).to_degrees(),
            y: (2.0 * (coord.y / EARTH_RADIUS).exp().atan() - PI / 2.0).to_degrees(),
        },
        _ => {
            return Err(CrsError::UnsupportedTransform {
                from: from.clone(),
                to: to.clone(),
            })
        }
    };

    if out.x.is_finite() && out.y.is_finite() {
        Ok(out)
    } else {
        Err(CrsError::NonFiniteCoordinate { x: coord.x, y: coord.y })
    }
}

/// Items whose coordinates can be moved into another CRS.
pub trait Reproject: Sized {
    fn reproject(&self, from: &Crs, to: &Crs) -> Result<Self, CrsError>;
}

impl Reproject for PopulationPoint {
    fn reproject(&self, from: &Crs, to: &Crs) -> Result<Self, CrsError> {
        let c = transform_coord(Coord { x: self.x, y: self.y }, from, to)?;
        Ok(Self { x: c.x, y: c.y, ..*self })
    }
}

impl Reproject for AdminArea {
    fn reproject(&self, from: &Crs, to: &Crs) -> Result<Self, CrsError> {
        let geometry = match &self.geometry {
            Some(mp) => Some(mp.try_map_coords(|c| transform_coord(c, from, to))?),
            None => None,
        };
        Ok(Self {
            name: self.name.clone(),
            province: self.province.clone(),
            canton: self.canton.clone(),
            geometry,
            properties: self.properties.clone(),
        })
    }
}

/// Reproject every item of a dataset. The result has a new identity.
pub fn reproject<T: Reproject>(dataset: &Dataset<T>, to: &Crs) -> Result<Dataset<T>, CrsError> {
    let from = dataset.crs().clone();
    if !from.can_transform(to) {
        return Err(CrsError::UnsupportedTransform { from, to: to.clone() });
    }
    let items = dataset
        .items()
        .iter()
        .map(|item| item.reproject(&from, to))
        .collect::<Result<Vec<_>, _>>()?;
    debug!(
        "[Normalizer] Reprojected '{}' ({} items) {} -> {}",
        dataset.name(),
        items.len(),
        from,
        to
    );
    Ok(dataset.derive(to.clone(), items))
}

/// Bring `a` into the CRS of the reference dataset `b`.
///
/// When the CRSs already match, `a` is returned as-is (same `Arc`).
/// On failure the caller still owns its original `a` and decides how to degrade.
pub fn normalize<A, B>(a: Arc<Dataset<A>>, b: Arc<Dataset<B>>) -> Result<(Arc<Dataset<A>>, Arc<Dataset<B>>), CrsError>
where
    A: Reproject,
{
    if a.crs() == b.crs() {
        return Ok((a, b));
    }
    info!(
        "[Normalizer] '{}' is in {}, reference '{}' is in {}; reprojecting",
        a.name(),
        a.crs(),
        b.name(),
        b.crs()
    );
    let reprojected = reproject(&a, b.crs())?;
    Ok((Arc::new(reprojected), b))
}
