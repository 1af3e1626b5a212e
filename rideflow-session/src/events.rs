use rideflow_shared::Coordinates;
use serde::{Deserialize, Serialize};

use crate::models::{Driver, RideSession};

/// Asynchronous ride-state events, tagged the way the push channel tags
/// its messages. Poll results are funneled through the same shapes so the
/// coordinator merges both sources in one place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RideUpdate {
    #[serde(rename = "RIDE_ACCEPTED")]
    Accepted { ride: RidePayload },

    #[serde(rename = "DRIVER_LOCATION")]
    DriverLocation { latitude: f64, longitude: f64 },

    #[serde(rename = "RIDE_STARTED")]
    Started,

    #[serde(rename = "RIDE_COMPLETED")]
    Completed { ride: Option<RidePayload> },

    #[serde(rename = "RIDE_CANCELLED")]
    Cancelled { reason: Option<String> },
}

/// Partial ride state as served by the backend. Every field is optional;
/// the server fills in whatever it knows at the time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RidePayload {
    pub booking_id: Option<String>,
    pub status: Option<String>,
    pub otp: Option<String>,
    pub fare: Option<f64>,
    pub driver_id: Option<String>,
    pub driver_name: Option<String>,
    pub vehicle_number: Option<String>,
    pub vehicle_type: Option<String>,
    pub driver_lat: Option<f64>,
    pub driver_lng: Option<f64>,
}

impl RidePayload {
    pub fn driver_location(&self) -> Option<Coordinates> {
        match (self.driver_lat, self.driver_lng) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            _ => None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("ACCEPTED") | Some("DRIVER_ASSIGNED")
        )
    }

    /// Last-known-good merge into the session: a field absent from this
    /// payload never erases a value the session already holds, and
    /// repeated application causes no extra effect.
    pub fn merge_into(&self, session: &mut RideSession) {
        if let Some(booking_id) = &self.booking_id {
            session.booking_id = Some(booking_id.clone());
        }
        if let Some(otp) = &self.otp {
            session.otp = Some(otp.clone());
        }
        if let Some(fare) = self.fare {
            session.fare = Some(fare);
        }
        if let Some(location) = self.driver_location() {
            session.driver_location = Some(location);
        }

        let has_driver_fields = self.driver_id.is_some()
            || self.driver_name.is_some()
            || self.vehicle_number.is_some()
            || self.vehicle_type.is_some()
            || self.driver_location().is_some();
        if !has_driver_fields {
            return;
        }

        let driver = session.driver.get_or_insert_with(|| Driver {
            id: String::new(),
            name: String::new(),
            vehicle_label: String::new(),
            location: None,
        });
        if let Some(id) = &self.driver_id {
            driver.id = id.clone();
        }
        if let Some(name) = &self.driver_name {
            driver.name = name.clone();
        }
        match (&self.vehicle_number, &self.vehicle_type) {
            (Some(number), Some(kind)) => driver.vehicle_label = format!("{} • {}", number, kind),
            (Some(number), None) => driver.vehicle_label = number.clone(),
            (None, Some(kind)) => driver.vehicle_label = kind.clone(),
            (None, None) => {}
        }
        if let Some(location) = self.driver_location() {
            driver.location = Some(location);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted(otp: Option<&str>) -> RidePayload {
        RidePayload {
            booking_id: Some("R-7".to_string()),
            status: Some("ACCEPTED".to_string()),
            otp: otp.map(str::to_string),
            driver_id: Some("D1".to_string()),
            driver_name: Some("Ravi".to_string()),
            ..RidePayload::default()
        }
    }

    #[test]
    fn test_update_event_deserializes_from_tagged_json() {
        let raw = r#"{"type":"RIDE_ACCEPTED","ride":{"bookingId":"R-7","status":"ACCEPTED","driverId":"D1"}}"#;
        let update: RideUpdate = serde_json::from_str(raw).unwrap();
        match update {
            RideUpdate::Accepted { ride } => {
                assert_eq!(ride.booking_id.as_deref(), Some("R-7"));
                assert!(ride.is_accepted());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_merge_preserves_otp_across_sparse_payloads() {
        let mut session = RideSession::new();

        accepted(Some("4821")).merge_into(&mut session);
        accepted(None).merge_into(&mut session);
        accepted(None).merge_into(&mut session);

        assert_eq!(session.otp.as_deref(), Some("4821"));
    }

    #[test]
    fn test_merge_never_erases_known_driver_fields() {
        let mut session = RideSession::new();
        accepted(None).merge_into(&mut session);

        let location_only = RidePayload {
            driver_lat: Some(28.62),
            driver_lng: Some(77.21),
            ..RidePayload::default()
        };
        location_only.merge_into(&mut session);

        let driver = session.driver.expect("driver retained");
        assert_eq!(driver.id, "D1");
        assert_eq!(driver.name, "Ravi");
        assert_eq!(driver.location, Some(Coordinates::new(28.62, 77.21)));
        assert_eq!(session.driver_location, Some(Coordinates::new(28.62, 77.21)));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut once = RideSession::new();
        accepted(Some("4821")).merge_into(&mut once);

        let mut twice = RideSession::new();
        accepted(Some("4821")).merge_into(&mut twice);
        accepted(Some("4821")).merge_into(&mut twice);

        assert_eq!(once.otp, twice.otp);
        assert_eq!(once.booking_id, twice.booking_id);
        assert_eq!(once.driver, twice.driver);
    }
}
