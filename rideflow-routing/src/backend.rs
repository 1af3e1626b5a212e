use async_trait::async_trait;
use reqwest::{Client, Url};
use rideflow_shared::Coordinates;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A navigable path between two points, whatever source produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResult {
    pub coordinates: Vec<Coordinates>,
    pub distance_meters: f64,
    pub duration_seconds: f64,
    pub steps: Vec<RouteStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStep {
    pub maneuver: String,
    pub distance_meters: f64,
    pub duration_seconds: f64,
    pub road_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status: {0}")]
    Status(u16),

    #[error("no route found")]
    NoRoute,

    #[error("routing api error: {0}")]
    Api(String),
}

/// One resolution strategy in the fallback chain.
#[async_trait]
pub trait RouteBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, start: Coordinates, end: Coordinates) -> Result<RouteResult, RouteError>;
}

/// Backend proxy endpoint, preferred over public routers to avoid
/// cross-origin and third-party rate-limit failure modes.
#[derive(Debug, Clone)]
pub struct ProxyBackend {
    client: Client,
    endpoint: String,
}

impl ProxyBackend {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build routing client");
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl RouteBackend for ProxyBackend {
    fn name(&self) -> &str {
        "proxy"
    }

    async fn fetch(&self, start: Coordinates, end: Coordinates) -> Result<RouteResult, RouteError> {
        let mut url = Url::parse(&format!("{}/route", self.endpoint))
            .map_err(|err| RouteError::Api(format!("failed to build proxy URL: {}", err)))?;
        url.query_pairs_mut()
            .append_pair("startLat", &start.lat.to_string())
            .append_pair("startLng", &start.lng.to_string())
            .append_pair("endLat", &end.lat.to_string())
            .append_pair("endLng", &end.lng.to_string());

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(RouteError::Status(response.status().as_u16()));
        }

        let parsed: OsrmRouteResponse = response.json().await?;
        decode_osrm(parsed)
    }
}

/// A public OSRM-compatible routing endpoint.
#[derive(Debug, Clone)]
pub struct OsrmBackend {
    client: Client,
    endpoint: String,
}

impl OsrmBackend {
    /// `endpoint` is a base ending with the profile segment, e.g.
    /// `https://router.project-osrm.org/route/v1/driving`.
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build routing client");
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl RouteBackend for OsrmBackend {
    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn fetch(&self, start: Coordinates, end: Coordinates) -> Result<RouteResult, RouteError> {
        // OSRM takes lng,lat pairs
        let url = format!(
            "{}/{},{};{},{}?overview=full&geometries=geojson&steps=true",
            self.endpoint, start.lng, start.lat, end.lng, end.lat
        );

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(RouteError::Status(response.status().as_u16()));
        }

        let parsed: OsrmRouteResponse = response.json().await?;
        decode_osrm(parsed)
    }
}

#[derive(Deserialize)]
pub(crate) struct OsrmRouteResponse {
    pub(crate) code: String,
    #[serde(default)]
    pub(crate) routes: Vec<OsrmRoute>,
}

#[derive(Deserialize)]
pub(crate) struct OsrmRoute {
    pub(crate) geometry: OsrmGeometry,
    pub(crate) distance: f64,
    pub(crate) duration: f64,
    #[serde(default)]
    pub(crate) legs: Vec<OsrmLeg>,
}

#[derive(Deserialize)]
pub(crate) struct OsrmGeometry {
    pub(crate) coordinates: Vec<[f64; 2]>,
}

#[derive(Deserialize)]
pub(crate) struct OsrmLeg {
    #[serde(default)]
    pub(crate) steps: Vec<OsrmStep>,
}

#[derive(Deserialize)]
pub(crate) struct OsrmStep {
    pub(crate) maneuver: Option<OsrmManeuver>,
    pub(crate) distance: f64,
    pub(crate) duration: f64,
    pub(crate) name: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct OsrmManeuver {
    #[serde(rename = "type")]
    pub(crate) kind: Option<String>,
}

pub(crate) fn decode_osrm(response: OsrmRouteResponse) -> Result<RouteResult, RouteError> {
    if response.code != "Ok" {
        return Err(RouteError::Api(response.code));
    }
    let route = response.routes.into_iter().next().ok_or(RouteError::NoRoute)?;

    // GeoJSON geometry is lng,lat; flip to lat,lng
    let coordinates = route
        .geometry
        .coordinates
        .iter()
        .map(|pair| Coordinates::new(pair[1], pair[0]))
        .collect::<Vec<_>>();
    if coordinates.is_empty() {
        return Err(RouteError::NoRoute);
    }

    let steps = route
        .legs
        .into_iter()
        .next()
        .map(|leg| leg.steps)
        .unwrap_or_default()
        .into_iter()
        .map(|step| RouteStep {
            maneuver: step
                .maneuver
                .and_then(|m| m.kind)
                .unwrap_or_else(|| "unknown".to_string()),
            distance_meters: step.distance,
            duration_seconds: step.duration,
            road_name: step
                .name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "Unnamed road".to_string()),
        })
        .collect();

    Ok(RouteResult {
        coordinates,
        distance_meters: route.distance,
        duration_seconds: route.duration,
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_flips_geojson_coordinates() {
        let raw = serde_json::json!({
            "code": "Ok",
            "routes": [{
                "geometry": { "coordinates": [[77.2090, 28.6139], [77.1025, 28.7041]] },
                "distance": 14800.0,
                "duration": 1680.0,
                "legs": [{
                    "steps": [{
                        "maneuver": { "type": "depart" },
                        "distance": 120.0,
                        "duration": 30.0,
                        "name": "Janpath"
                    }]
                }]
            }]
        });
        let parsed: OsrmRouteResponse = serde_json::from_value(raw).unwrap();
        let route = decode_osrm(parsed).unwrap();

        assert_eq!(route.coordinates[0], Coordinates::new(28.6139, 77.2090));
        assert_eq!(route.distance_meters, 14800.0);
        assert_eq!(route.steps.len(), 1);
        assert_eq!(route.steps[0].maneuver, "depart");
        assert_eq!(route.steps[0].road_name, "Janpath");
    }

    #[test]
    fn test_decode_rejects_error_code() {
        let parsed: OsrmRouteResponse =
            serde_json::from_value(serde_json::json!({ "code": "NoRoute", "routes": [] })).unwrap();
        assert!(decode_osrm(parsed).is_err());
    }

    #[test]
    fn test_decode_defaults_unnamed_roads() {
        let raw = serde_json::json!({
            "code": "Ok",
            "routes": [{
                "geometry": { "coordinates": [[77.2, 28.6], [77.1, 28.7]] },
                "distance": 100.0,
                "duration": 10.0,
                "legs": [{
                    "steps": [{ "maneuver": null, "distance": 100.0, "duration": 10.0, "name": "" }]
                }]
            }]
        });
        let parsed: OsrmRouteResponse = serde_json::from_value(raw).unwrap();
        let route = decode_osrm(parsed).unwrap();
        assert_eq!(route.steps[0].road_name, "Unnamed road");
        assert_eq!(route.steps[0].maneuver, "unknown");
    }
}
