use chrono::{DateTime, Utc};
use rideflow_routing::RouteResult;
use rideflow_shared::Coordinates;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RidePhase {
    Search,
    Selecting,
    Booking,
    Tracking,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VehicleClass {
    Bike,
    Auto,
    Car,
    Share,
}

impl VehicleClass {
    pub fn all() -> [VehicleClass; 4] {
        [
            VehicleClass::Bike,
            VehicleClass::Auto,
            VehicleClass::Car,
            VehicleClass::Share,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VehicleClass::Bike => "Bike",
            VehicleClass::Auto => "Auto",
            VehicleClass::Car => "Car",
            VehicleClass::Share => "Share",
        }
    }
}

/// A named location whose coordinates may resolve after the label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Place {
    pub label: String,
    pub coordinates: Option<Coordinates>,
}

/// Client-side fare estimate for one vehicle class; the authoritative
/// fare arrives only once a ride exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteOption {
    pub vehicle_class: VehicleClass,
    pub price: f64,
    pub eta_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Driver {
    pub id: String,
    pub name: String,
    pub vehicle_label: String,
    pub location: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyDriver {
    pub id: String,
    pub location: Coordinates,
    pub available: bool,
    pub vehicle_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    pub label: String,
}

/// Captured at completion for the rating prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedSummary {
    pub driver_name: String,
    pub fare: f64,
}

/// The aggregate tracking one booking's lifecycle end-to-end. Mutated
/// only by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideSession {
    pub phase: RidePhase,
    pub booking_id: Option<String>,
    pub pickup: Place,
    pub destination: Place,
    pub quotes: Vec<QuoteOption>,
    pub selected_class: Option<VehicleClass>,
    pub driver: Option<Driver>,
    /// Last reported driver position. Kept even before a driver record
    /// exists, since location events may arrive ahead of the acceptance
    /// merge.
    pub driver_location: Option<Coordinates>,
    pub otp: Option<String>,
    /// Once verified, any displayed OTP is stale and no longer required.
    pub otp_verified: bool,
    pub fare: Option<f64>,
    pub preview_route: Option<RouteResult>,
    pub driver_to_pickup_route: Option<RouteResult>,
    pub pickup_to_destination_route: Option<RouteResult>,
    pub nearby_drivers: Vec<NearbyDriver>,
    pub timeline: Vec<TimelineEvent>,
    pub auto_cancel_deadline: Option<DateTime<Utc>>,
    pub completed_summary: Option<CompletedSummary>,
}

impl Default for RideSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RideSession {
    pub fn new() -> Self {
        Self {
            phase: RidePhase::Search,
            booking_id: None,
            pickup: Place::default(),
            destination: Place::default(),
            quotes: Vec::new(),
            selected_class: None,
            driver: None,
            driver_location: None,
            otp: None,
            otp_verified: false,
            fare: None,
            preview_route: None,
            driver_to_pickup_route: None,
            pickup_to_destination_route: None,
            nearby_drivers: Vec::new(),
            timeline: Vec::new(),
            auto_cancel_deadline: None,
            completed_summary: None,
        }
    }

    /// Append a lifecycle event. Timestamps are clamped so the timeline
    /// stays monotonically non-decreasing even if the clock steps back.
    pub fn record(&mut self, label: &str) {
        let now = Utc::now();
        let timestamp = match self.timeline.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        self.timeline.push(TimelineEvent {
            timestamp,
            label: label.to_string(),
        });
    }

    /// Clear everything back to an empty `Search` session.
    pub fn reset(&mut self) {
        *self = RideSession::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_starts_at_search() {
        let session = RideSession::new();
        assert_eq!(session.phase, RidePhase::Search);
        assert!(session.booking_id.is_none());
        assert!(session.timeline.is_empty());
    }

    #[test]
    fn test_timeline_is_monotonic() {
        let mut session = RideSession::new();
        session.record("Ride booked");
        session.record("Driver accepted");
        session.record("Ride started");
        let stamps: Vec<_> = session.timeline.iter().map(|e| e.timestamp).collect();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_reset_clears_all_fields() {
        let mut session = RideSession::new();
        session.phase = RidePhase::Tracking;
        session.booking_id = Some("R-42".to_string());
        session.otp = Some("4821".to_string());
        session.record("Driver accepted");

        session.reset();

        assert_eq!(session.phase, RidePhase::Search);
        assert!(session.booking_id.is_none());
        assert!(session.otp.is_none());
        assert!(session.timeline.is_empty());
    }
}
