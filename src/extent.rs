//! Extent values: temporal ranges, bounding rectangles, and the area of interest.
//!
//! A parent's *envelope* is the fold of its children's extents. Both merges
//! here only ever widen, so folding children in any order gives the same
//! envelope.
//!
//! Geospatial bounds use a reserved placeholder ([`SENTINEL`]) to mean
//! "not yet computed". The sentinel is never compared against real
//! coordinates: merging into an unset extent replaces it wholesale.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use geo::{coord, Intersects, LineString, Polygon, Rect};
use serde::Deserialize;
use thiserror::Error;

/// Placeholder written into all four bounds of an unset rectangle.
///
/// Outside every legitimate latitude and longitude.
pub const SENTINEL: f64 = 999.0;

/// Timestamp format written into records (millisecond precision, UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Errors raised while reading an extent out of a record.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtentError {
    #[error("'{field}' element not found")]
    Missing { field: String },
    #[error("'{field}' is not a valid timestamp: {value:?}")]
    BadTimestamp { field: String, value: String },
    #[error("'{field}' is not a valid coordinate: {value:?}")]
    BadCoordinate { field: String, value: String },
    #[error("invalid rectangle: {0}")]
    InvalidRectangle(String),
    #[error("start {start} is after end {end}")]
    ReversedInterval { start: String, end: String },
}

/// Parse a record timestamp.
///
/// Accepts RFC 3339 (`2021-01-01T10:00:00.123Z`), a naive datetime with or
/// without fraction (taken as UTC), or a bare date, which is normalized to
/// midnight UTC.
pub fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, ExtentError> {
    let trimmed = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = trimmed.trim_end_matches('Z');
    if let Ok(dt) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(dt.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(naive, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    Err(ExtentError::BadTimestamp {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Format a timestamp the way records store it.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// A closed time interval. Either bound may be absent in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalExtent {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TemporalExtent {
    /// Widen `self` to cover `other`. Absent bounds on `other` leave ours alone.
    pub fn merge(&self, other: &TemporalExtent) -> TemporalExtent {
        TemporalExtent {
            start: match (self.start, other.start) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            end: match (self.end, other.end) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            },
        }
    }
}

/// A rectangle in degrees, longitude east/west and latitude north/south.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl BoundingBox {
    /// Build a checked rectangle: finite, within lat/lon ranges, `south <= north`, `west <= east`.
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Result<Self, ExtentError> {
        let bbox = BoundingBox {
            north,
            south,
            east,
            west,
        };
        bbox.check()?;
        Ok(bbox)
    }

    fn check(&self) -> Result<(), ExtentError> {
        let all = [self.north, self.south, self.east, self.west];
        if all.iter().any(|v| !v.is_finite()) {
            return Err(ExtentError::InvalidRectangle("non-finite bound".into()));
        }
        if !(-90.0..=90.0).contains(&self.north) || !(-90.0..=90.0).contains(&self.south) {
            return Err(ExtentError::InvalidRectangle(format!(
                "latitude out of range (north={}, south={})",
                self.north, self.south
            )));
        }
        if !(-180.0..=180.0).contains(&self.east) || !(-180.0..=180.0).contains(&self.west) {
            return Err(ExtentError::InvalidRectangle(format!(
                "longitude out of range (east={}, west={})",
                self.east, self.west
            )));
        }
        if self.south > self.north {
            return Err(ExtentError::InvalidRectangle(format!(
                "south {} is above north {}",
                self.south, self.north
            )));
        }
        if self.west > self.east {
            return Err(ExtentError::InvalidRectangle(format!(
                "west {} is east of east {}",
                self.west, self.east
            )));
        }
        Ok(())
    }

    /// Smallest rectangle covering both.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            north: self.north.max(other.north),
            south: self.south.min(other.south),
            east: self.east.max(other.east),
            west: self.west.min(other.west),
        }
    }

    fn to_rect(&self) -> Rect<f64> {
        Rect::new(
            coord! { x: self.west, y: self.south },
            coord! { x: self.east, y: self.north },
        )
    }
}

/// A parent's geospatial bounds: unset (sentinel) or a real rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeoExtent {
    Unset,
    Bounds(BoundingBox),
}

impl GeoExtent {
    /// Interpret four raw bound values.
    ///
    /// Any bound equal to [`SENTINEL`] marks the whole extent as unset; a
    /// rectangle that was only partly reset is still not a real rectangle.
    pub fn from_bounds(north: f64, south: f64, east: f64, west: f64) -> Result<Self, ExtentError> {
        if [north, south, east, west].contains(&SENTINEL) {
            return Ok(GeoExtent::Unset);
        }
        BoundingBox::new(north, south, east, west).map(GeoExtent::Bounds)
    }

    pub fn is_unset(&self) -> bool {
        matches!(self, GeoExtent::Unset)
    }

    /// Fold a child's rectangle into this extent.
    pub fn merge(&self, child: &BoundingBox) -> GeoExtent {
        match self {
            GeoExtent::Unset => GeoExtent::Bounds(*child),
            GeoExtent::Bounds(current) => GeoExtent::Bounds(current.union(child)),
        }
    }

    /// The four values to write, sentinel included.
    pub fn bounds(&self) -> [f64; 4] {
        match self {
            GeoExtent::Unset => [SENTINEL; 4],
            GeoExtent::Bounds(b) => [b.north, b.south, b.east, b.west],
        }
    }
}

/// Format a coordinate for a record, keeping a trailing `.0` on whole numbers.
pub fn format_coordinate(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

/// Default area of interest, as (longitude, latitude) vertices.
pub const DEFAULT_AREA_OF_INTEREST: [(f64, f64); 6] = [
    (-20.263238824222373, 84.8852877777822),
    (-36.25445787748578, 67.02581594412311),
    (11.148084316116405, 52.31593720759386),
    (45.98609725358305, 63.94940066151824),
    (89.96194965005743, 84.8341192704811),
    (-20.263238824222373, 84.8852877777822),
];

/// A simple polygon in (longitude, latitude). The ring is closed implicitly.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Vec<[f64; 2]>")]
pub struct AreaOfInterest {
    vertices: Vec<(f64, f64)>,
    polygon: Polygon<f64>,
}

impl AreaOfInterest {
    pub fn new(vertices: impl IntoIterator<Item = (f64, f64)>) -> Result<Self, String> {
        let mut ring: Vec<(f64, f64)> = Vec::new();
        for v in vertices {
            if !v.0.is_finite() || !v.1.is_finite() {
                return Err(format!("non-finite vertex {:?}", v));
            }
            if ring.last() != Some(&v) {
                ring.push(v);
            }
        }
        while ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        if ring.len() < 3 {
            return Err(format!(
                "area of interest needs at least 3 distinct vertices, got {}",
                ring.len()
            ));
        }
        Ok(Self::from_ring(ring))
    }

    fn from_ring(vertices: Vec<(f64, f64)>) -> Self {
        let polygon = Polygon::new(LineString::from(vertices.clone()), vec![]);
        Self { vertices, polygon }
    }

    pub fn vertices(&self) -> &[(f64, f64)] {
        &self.vertices
    }

    /// Boundary counts as inside.
    pub fn contains_point(&self, (x, y): (f64, f64)) -> bool {
        self.polygon.intersects(&coord! { x: x, y: y })
    }

    /// True when the rectangle and the polygon share at least one point.
    pub fn intersects(&self, bbox: &BoundingBox) -> bool {
        bbox.to_rect().intersects(&self.polygon)
    }
}

impl Default for AreaOfInterest {
    fn default() -> Self {
        let mut vertices = DEFAULT_AREA_OF_INTEREST.to_vec();
        vertices.pop();
        Self::from_ring(vertices)
    }
}

impl TryFrom<Vec<[f64; 2]>> for AreaOfInterest {
    type Error = String;

    fn try_from(raw: Vec<[f64; 2]>) -> Result<Self, Self::Error> {
        AreaOfInterest::new(raw.into_iter().map(|[lon, lat]| (lon, lat)))
    }
}
