use serde::{Deserialize, Serialize};

/// A WGS84 latitude/longitude pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

impl From<(f64, f64)> for Coordinates {
    fn from((lat, lng): (f64, f64)) -> Self {
        Self { lat, lng }
    }
}

/// Cache key for a coordinate pair, rounded to 5 decimal places (~1m)
/// so sub-meter jitter between rapid calls maps to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteKey {
    start: (i64, i64),
    end: (i64, i64),
}

impl RouteKey {
    pub fn new(start: Coordinates, end: Coordinates) -> Self {
        Self {
            start: (round5(start.lat), round5(start.lng)),
            end: (round5(end.lat), round5(end.lng)),
        }
    }
}

fn round5(value: f64) -> i64 {
    (value * 1e5).round() as i64
}
