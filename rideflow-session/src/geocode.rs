use async_trait::async_trait;
use reqwest::Client;
use rideflow_shared::Coordinates;
use serde::Deserialize;

use crate::backend::BackendError;

#[derive(Debug, Clone, PartialEq)]
pub struct GeocodeResult {
    pub coordinates: Coordinates,
    pub display_name: String,
}

/// Address/coordinate resolution. The coordinator only needs the best
/// match for a free-text query and a label for a map point.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> Result<Option<GeocodeResult>, BackendError>;

    async fn reverse(&self, at: Coordinates) -> Result<Option<String>, BackendError>;
}

/// OpenStreetMap Nominatim client.
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: Client,
    base: String,
    country_codes: Option<String>,
}

impl NominatimGeocoder {
    pub fn new(base: &str, country_codes: Option<&str>) -> Self {
        Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_string(),
            country_codes: country_codes.map(str::to_string),
        }
    }
}

// Nominatim serves lat/lon as strings
#[derive(Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
    display_name: String,
}

#[derive(Deserialize)]
struct ReverseHit {
    display_name: Option<String>,
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<GeocodeResult>, BackendError> {
        let mut params = vec![
            ("q", query.to_string()),
            ("format", "json".to_string()),
            ("limit", "1".to_string()),
        ];
        if let Some(codes) = &self.country_codes {
            params.push(("countrycodes", codes.clone()));
        }

        let response = self
            .client
            .get(format!("{}/search", self.base))
            .query(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status(response.status().as_u16()));
        }

        let hits: Vec<SearchHit> = response.json().await?;
        let Some(hit) = hits.into_iter().next() else {
            return Ok(None);
        };
        let (Ok(lat), Ok(lng)) = (hit.lat.parse::<f64>(), hit.lon.parse::<f64>()) else {
            return Ok(None);
        };
        Ok(Some(GeocodeResult {
            coordinates: Coordinates::new(lat, lng),
            display_name: hit.display_name,
        }))
    }

    async fn reverse(&self, at: Coordinates) -> Result<Option<String>, BackendError> {
        let response = self
            .client
            .get(format!("{}/reverse", self.base))
            .query(&[
                ("lat", at.lat.to_string()),
                ("lon", at.lng.to_string()),
                ("format", "json".to_string()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BackendError::Status(response.status().as_u16()));
        }

        let hit: ReverseHit = response.json().await?;
        Ok(hit.display_name)
    }
}
