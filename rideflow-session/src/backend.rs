use async_trait::async_trait;
use reqwest::Client;
use rideflow_shared::Coordinates;
use serde::{Deserialize, Serialize};

use crate::events::RidePayload;
use crate::models::NearbyDriver;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    /// Business rejection; the message is surfaced to the user verbatim.
    #[error("{0}")]
    Rejected(String),

    #[error("unexpected status: {0}")]
    Status(u16),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Transport(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub pickup_location: String,
    pub drop_location: String,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    pub drop_lat: f64,
    pub drop_lng: f64,
    pub vehicle_type: String,
    pub fare: f64,
}

/// REST surface of the ride service as consumed by the coordinator.
#[async_trait]
pub trait RideBackend: Send + Sync {
    async fn book_ride(&self, request: &BookingRequest) -> Result<RidePayload, BackendError>;

    async fn ride_detail(&self, booking_id: &str) -> Result<RidePayload, BackendError>;

    /// Driver-side accept. A rejection (e.g. the ride was already taken)
    /// comes back as `Rejected` with the server's message.
    async fn accept_ride(
        &self,
        booking_id: &str,
        driver_id: &str,
    ) -> Result<RidePayload, BackendError>;

    async fn cancel_ride(&self, booking_id: &str, reason: &str) -> Result<(), BackendError>;

    async fn verify_otp(&self, booking_id: &str, otp: &str) -> Result<(), BackendError>;

    async fn resend_otp(&self, booking_id: &str) -> Result<(), BackendError>;

    async fn nearby_drivers(
        &self,
        around: Coordinates,
        radius_km: f64,
    ) -> Result<Vec<NearbyDriver>, BackendError>;

    async fn submit_rating(
        &self,
        booking_id: &str,
        stars: u8,
        comment: &str,
    ) -> Result<(), BackendError>;
}

#[derive(Debug, Clone)]
pub struct HttpRideBackend {
    client: Client,
    base: String,
}

impl HttpRideBackend {
    pub fn new(base: &str) -> Self {
        Self {
            client: Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

/// Pull a user-presentable message out of an error body, falling back to
/// the bare status code.
async fn rejection(response: reqwest::Response) -> BackendError {
    let status = response.status().as_u16();
    match response.json::<serde_json::Value>().await {
        Ok(body) => {
            let message = body
                .get("message")
                .and_then(|v| v.as_str())
                .or_else(|| body.get("error").and_then(|v| v.as_str()));
            match message {
                Some(msg) => BackendError::Rejected(msg.to_string()),
                None => BackendError::Status(status),
            }
        }
        Err(_) => BackendError::Status(status),
    }
}

#[async_trait]
impl RideBackend for HttpRideBackend {
    async fn book_ride(&self, request: &BookingRequest) -> Result<RidePayload, BackendError> {
        let response = self
            .client
            .post(self.url("/rides/book"))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(response.json().await?)
    }

    async fn ride_detail(&self, booking_id: &str) -> Result<RidePayload, BackendError> {
        let response = self
            .client
            .get(self.url(&format!("/rides/{}", booking_id)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(response.json().await?)
    }

    async fn accept_ride(
        &self,
        booking_id: &str,
        driver_id: &str,
    ) -> Result<RidePayload, BackendError> {
        let response = self
            .client
            .post(self.url(&format!("/rides/{}/accept", booking_id)))
            .json(&serde_json::json!({ "driverId": driver_id }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(response.json().await?)
    }

    async fn cancel_ride(&self, booking_id: &str, reason: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .put(self.url(&format!("/rides/{}/cancel", booking_id)))
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(())
    }

    async fn verify_otp(&self, booking_id: &str, otp: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url(&format!("/rides/{}/verify-otp", booking_id)))
            .json(&serde_json::json!({ "otp": otp }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(())
    }

    async fn resend_otp(&self, booking_id: &str) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url(&format!("/rides/{}/resend-otp", booking_id)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(())
    }

    async fn nearby_drivers(
        &self,
        around: Coordinates,
        radius_km: f64,
    ) -> Result<Vec<NearbyDriver>, BackendError> {
        let response = self
            .client
            .get(self.url("/drivers/nearby"))
            .query(&[
                ("lat", around.lat.to_string()),
                ("lng", around.lng.to_string()),
                ("radius", radius_km.to_string()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        let drivers: Vec<NearbyDriverDto> = response.json().await?;
        Ok(drivers.into_iter().filter_map(NearbyDriverDto::into_model).collect())
    }

    async fn submit_rating(
        &self,
        booking_id: &str,
        stars: u8,
        comment: &str,
    ) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url(&format!("/rides/{}/rate", booking_id)))
            .json(&serde_json::json!({ "stars": stars, "comment": comment }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        Ok(())
    }
}

/// Nearby-driver entries as the server sends them; older deployments use
/// `currentLat`/`currentLng` and `isOnline` instead of the newer names.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NearbyDriverDto {
    id: Option<i64>,
    #[serde(alias = "currentLat")]
    latitude: Option<f64>,
    #[serde(alias = "currentLng")]
    longitude: Option<f64>,
    #[serde(default)]
    is_available: Option<bool>,
    #[serde(default)]
    is_online: Option<bool>,
    vehicle_type: Option<String>,
}

impl NearbyDriverDto {
    fn into_model(self) -> Option<NearbyDriver> {
        let (lat, lng) = (self.latitude?, self.longitude?);
        Some(NearbyDriver {
            id: self.id.map(|id| id.to_string()).unwrap_or_default(),
            location: Coordinates::new(lat, lng),
            available: self.is_available.or(self.is_online).unwrap_or(false),
            vehicle_type: self.vehicle_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearby_driver_accepts_both_field_spellings() {
        let raw = serde_json::json!([
            { "id": 11, "latitude": 28.61, "longitude": 77.20, "isAvailable": true, "vehicleType": "Car" },
            { "id": 12, "currentLat": 28.62, "currentLng": 77.21, "isOnline": true },
            { "id": 13 }
        ]);
        let parsed: Vec<NearbyDriverDto> = serde_json::from_value(raw).unwrap();
        let drivers: Vec<_> = parsed.into_iter().filter_map(NearbyDriverDto::into_model).collect();

        assert_eq!(drivers.len(), 2);
        assert!(drivers[0].available);
        assert_eq!(drivers[0].vehicle_type.as_deref(), Some("Car"));
        assert!(drivers[1].available);
        assert_eq!(drivers[1].id, "12");
    }

    #[test]
    fn test_booking_request_serializes_to_server_field_names() {
        let request = BookingRequest {
            pickup_location: "Connaught Place".to_string(),
            drop_location: "Delhi University".to_string(),
            pickup_lat: 28.6139,
            pickup_lng: 77.2090,
            drop_lat: 28.7041,
            drop_lng: 77.1025,
            vehicle_type: "Car".to_string(),
            fare: 225.0,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("pickupLocation").is_some());
        assert!(value.get("dropLat").is_some());
        assert!(value.get("vehicleType").is_some());
    }
}
