use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Kilometres per degree of latitude, good enough at city scale.
pub const KM_PER_DEGREE: f64 = 111.0;

/// Segments in the fallback ring; the ring itself has one more vertex to close it.
pub const RING_SEGMENTS: usize = 16;

/// A `[lon, lat]` pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "[f64; 2]", try_from = "Vec<f64>")]
pub struct Point {
    pub lon: f64,
    pub lat: f64,
}

impl Point {
    pub fn new(lon: f64, lat: f64) -> Self {
        Self { lon, lat }
    }
}

impl From<Point> for [f64; 2] {
    fn from(p: Point) -> Self {
        [p.lon, p.lat]
    }
}

impl TryFrom<Vec<f64>> for Point {
    type Error = String;

    fn try_from(v: Vec<f64>) -> Result<Self, Self::Error> {
        let [lon, lat] = v[..] else {
            return Err(format!(
                "location must be a [lon, lat] pair, got {} values",
                v.len()
            ));
        };
        if !lon.is_finite() || !lat.is_finite() {
            return Err("location coordinates must be finite".to_string());
        }
        Ok(Point::new(lon, lat))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageProperties {
    pub group_index: u32,
    /// Time budget in seconds.
    pub value: u64,
    pub center: Point,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename = "Polygon")]
pub struct Polygon {
    pub coordinates: Vec<Vec<[f64; 2]>>,
}

/// Circle-approximation feature used when the routing service produced nothing.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename = "Feature")]
pub struct CoverageFeature {
    pub properties: CoverageProperties,
    pub geometry: Polygon,
}

/// Radius in degrees for a time budget, assuming 1 km per minute of travel.
pub fn fallback_radius_degrees(minutes: u32) -> f64 {
    let radius_km = f64::from(minutes);
    radius_km / KM_PER_DEGREE
}

pub fn circle_ring(center: Point, radius_deg: f64) -> Vec<[f64; 2]> {
    (0..=RING_SEGMENTS)
        .map(|i| {
            let angle = (i as f64 / RING_SEGMENTS as f64) * 2.0 * PI;
            [
                center.lon + radius_deg * angle.cos(),
                center.lat + radius_deg * angle.sin(),
            ]
        })
        .collect()
}

/// One approximate coverage polygon per point. Ignores roads, terrain and profile.
pub fn synthetic_coverage(locations: &[Point], minutes: u32) -> Vec<CoverageFeature> {
    let radius = fallback_radius_degrees(minutes);
    let value = u64::from(minutes) * 60;

    locations
        .iter()
        .map(|&center| CoverageFeature {
            properties: CoverageProperties {
                group_index: 0,
                value,
                center,
            },
            geometry: Polygon {
                coordinates: vec![circle_ring(center, radius)],
            },
        })
        .collect()
}
